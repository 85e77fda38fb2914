/// Class-weighted binary cross-entropy over proposal confidences
use candle_core::Tensor;
use ndarray::Array2;

use crate::config::ComputeContext;
use crate::SSTError;

/// Lower clipping bound applied to predictions before the logarithm
pub const PRED_CLIP_MIN: f64 = 0.001;
/// Upper clipping bound applied to predictions before the logarithm
pub const PRED_CLIP_MAX: f64 = 0.999;

/// Per-anchor class weights computed once from the training labels
///
/// - `w0[k]`: mean fraction of negative timesteps per sequence for anchor k
/// - `w1[k]`: mean fraction of positive timesteps per sequence for anchor k
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ClassWeights {
    pub w0: Vec<f64>,
    pub w1: Vec<f64>,
}

impl ClassWeights {
    /// Compute weights from binarized `[T, K]` label matrices
    pub fn from_labels(labels: &[Array2<f64>]) -> crate::Result<Self> {
        let first = labels.first().ok_or_else(|| {
            SSTError::DataIntegrity("cannot compute class weights from an empty training set".to_string())
        })?;
        let num_proposals = first.ncols();

        let mut w0 = vec![0.0; num_proposals];
        let mut w1 = vec![0.0; num_proposals];
        for gt in labels {
            if gt.ncols() != num_proposals || gt.nrows() == 0 {
                return Err(SSTError::DataIntegrity(format!(
                    "label matrix of shape {:?} does not match {} anchors",
                    gt.shape(),
                    num_proposals
                )));
            }

            let seq_len = gt.nrows() as f64;
            for (k, column) in gt.columns().into_iter().enumerate() {
                let positives = column.iter().filter(|&&v| v == 1.0).count() as f64;
                let negatives = column.iter().filter(|&&v| v == 0.0).count() as f64;
                w1[k] += positives / seq_len;
                w0[k] += negatives / seq_len;
            }
        }

        let n = labels.len() as f64;
        w0.iter_mut().for_each(|w| *w /= n);
        w1.iter_mut().for_each(|w| *w /= n);

        Ok(Self { w0, w1 })
    }

    pub fn num_proposals(&self) -> usize {
        self.w0.len()
    }
}

/// Weighted cross-entropy criterion
///
/// `L = -mean(w1 * y * ln(p) + w0 * (1 - y) * ln(1 - p))` with `p` clipped to
/// `[PRED_CLIP_MIN, PRED_CLIP_MAX]`, weights broadcast over the anchor axis.
pub struct WeightedCrossEntropy {
    w0: Tensor,
    w1: Tensor,
}

impl WeightedCrossEntropy {
    pub fn new(weights: &ClassWeights, ctx: &ComputeContext) -> crate::Result<Self> {
        let k = weights.num_proposals();
        let w0 = Tensor::from_slice(&weights.w0, k, &ctx.device)?.to_dtype(ctx.dtype)?;
        let w1 = Tensor::from_slice(&weights.w1, k, &ctx.device)?.to_dtype(ctx.dtype)?;
        Ok(Self { w0, w1 })
    }

    /// Mean loss over batch, time and anchors
    ///
    /// # Arguments
    /// * `predictions` - Confidences `[N, T, K]`
    /// * `targets` - Binary labels `[N, T, K]`
    pub fn forward(&self, predictions: &Tensor, targets: &Tensor) -> crate::Result<Tensor> {
        if predictions.dims() != targets.dims() {
            return Err(SSTError::Precondition(format!(
                "predictions {:?} and targets {:?} differ in shape",
                predictions.dims(),
                targets.dims()
            )));
        }
        if predictions.dims().last() != Some(&self.w0.dim(0)?) {
            return Err(SSTError::Precondition(format!(
                "predictions {:?} do not end in {} anchors",
                predictions.dims(),
                self.w0.dim(0)?
            )));
        }

        let p = predictions.clamp(PRED_CLIP_MIN, PRED_CLIP_MAX)?;
        let y = targets.to_dtype(p.dtype())?;

        let positive = y.broadcast_mul(&self.w1)?.mul(&p.log()?)?;
        let negative = y
            .affine(-1.0, 1.0)?
            .broadcast_mul(&self.w0)?
            .mul(&p.affine(-1.0, 1.0)?.log()?)?;

        Ok((positive + negative)?.neg()?.mean_all()?)
    }
}
