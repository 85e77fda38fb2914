/// SST sequence encoder and proposal head
use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{ops, VarBuilder};

use crate::config::SSTConfig;
use crate::layers::{Activation, Dense, GruLayer};
use crate::SSTError;

pub mod loader;

/// Recurrent state carried through a forward pass
///
/// Holds one hidden state `[batch, width]` per recurrent layer. It is an
/// explicit value: every forward pass consumes one and returns the updated
/// one, so nothing leaks between unrelated batches unless the caller
/// passes it on.
#[derive(Debug, Clone)]
pub struct EncoderState {
    pub hidden: Vec<Tensor>,
}

impl EncoderState {
    pub fn new(hidden: Vec<Tensor>) -> Self {
        Self { hidden }
    }

    /// Fresh all-zero state
    pub fn zeros(depth: usize, batch_size: usize, width: usize, dtype: DType, device: &Device) -> Result<Self> {
        let hidden = (0..depth)
            .map(|_| Tensor::zeros((batch_size, width), dtype, device))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { hidden })
    }

    /// Number of layers the state covers
    pub fn depth(&self) -> usize {
        self.hidden.len()
    }

    pub fn batch_size(&self) -> Result<usize> {
        match self.hidden.first() {
            Some(h) => h.dim(0),
            None => Ok(0),
        }
    }
}

/// Dropout that also accepts p = 1 (every unit dropped)
fn dropout(xs: &Tensor, p: f64) -> Result<Tensor> {
    let p = p as f32;
    if p >= 1.0 {
        xs.zeros_like()
    } else {
        ops::dropout(xs, p)
    }
}

/// Stack of GRU layers with optional dropout after each layer
pub struct SequenceEncoder {
    layers: Vec<GruLayer>,
    dropout: f64,
    width: usize,
}

impl SequenceEncoder {
    /// Create new sequence encoder
    ///
    /// The first layer reads `input_size` features, the remaining layers read
    /// the previous layer's `width` outputs.
    pub fn new(config: &SSTConfig, vb: VarBuilder) -> Result<Self> {
        let mut layers = Vec::with_capacity(config.depth);
        for i in 0..config.depth {
            let input_size = if i == 0 { config.input_size } else { config.width };
            layers.push(GruLayer::new(
                input_size,
                config.width,
                config.reset_bias,
                vb.pp(format!("layer_{}", i)),
            )?);
        }

        Ok(Self {
            layers,
            dropout: config.dropout,
            width: config.width,
        })
    }

    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `xs` - Input features `[batch, seq_len, input_size]`
    /// * `state` - Initial hidden state for every layer
    /// * `train` - Enables dropout
    ///
    /// # Returns
    /// Tuple of (last layer outputs `[batch, seq_len, width]`, final state)
    pub fn forward(&self, xs: &Tensor, state: EncoderState, train: bool) -> Result<(Tensor, EncoderState)> {
        if state.depth() != self.layers.len() {
            candle_core::bail!(
                "encoder state covers {} layers, encoder has {}",
                state.depth(),
                self.layers.len()
            );
        }

        let mut hidden = xs.clone();
        let mut final_states = Vec::with_capacity(self.layers.len());

        for (layer, h0) in self.layers.iter().zip(state.hidden.iter()) {
            let (ys, h_last) = layer.forward(&hidden, h0)?;
            hidden = if train && self.dropout > 0.0 {
                dropout(&ys, self.dropout)?
            } else {
                ys
            };
            final_states.push(h_last);
        }

        Ok((hidden, EncoderState::new(final_states)))
    }
}

/// Per-timestep proposal scoring
///
/// Flattens `[batch, seq_len, width]` to `[batch * seq_len, width]`, applies a
/// dense sigmoid layer to K outputs and restores `[batch, seq_len, K]`.
pub struct ProposalHead {
    dense: Dense,
    num_proposals: usize,
}

impl ProposalHead {
    pub fn new(width: usize, num_proposals: usize, vb: VarBuilder) -> Result<Self> {
        let dense = Dense::new(width, num_proposals, Activation::Sigmoid, vb)?;
        Ok(Self { dense, num_proposals })
    }

    pub fn forward(&self, hidden: &Tensor) -> Result<Tensor> {
        let (batch, seq_len, width) = hidden.dims3()?;
        let flat = hidden.reshape((batch * seq_len, width))?;
        self.dense
            .forward(&flat)?
            .reshape((batch, seq_len, self.num_proposals))
    }
}

/// Single-Stream Temporal action proposal model
pub struct SSTModel {
    config: SSTConfig,
    encoder: SequenceEncoder,
    head: ProposalHead,
    dtype: DType,
    device: Device,
}

impl SSTModel {
    /// Create new SSTModel
    ///
    /// Fails with a configuration error before any parameter is created if
    /// the configuration is invalid.
    pub fn new(config: SSTConfig, vb: VarBuilder) -> crate::Result<Self> {
        config.validate()?;

        if config.dropout_enabled() {
            if config.verbose {
                log::info!("Enabled dropout with probability p = {}", config.dropout);
            } else {
                log::debug!("Enabled dropout with probability p = {}", config.dropout);
            }
        }

        let dtype = vb.dtype();
        let device = vb.device().clone();

        let encoder = SequenceEncoder::new(&config, vb.pp("encoder"))?;
        let head = ProposalHead::new(config.width, config.num_proposals, vb.pp("head"))?;

        Ok(Self {
            config,
            encoder,
            head,
            dtype,
            device,
        })
    }

    pub fn config(&self) -> &SSTConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Zero hidden state for a batch of `batch_size` sequences
    pub fn initial_state(&self, batch_size: usize) -> crate::Result<EncoderState> {
        Ok(EncoderState::zeros(
            self.encoder.depth(),
            batch_size,
            self.encoder.width(),
            self.dtype,
            &self.device,
        )?)
    }

    fn check_input(&self, input: &Tensor, state: &EncoderState) -> crate::Result<()> {
        if input.rank() != 3 {
            return Err(SSTError::Precondition(format!(
                "Input tensor must be three dimensional (got shape {:?})",
                input.dims()
            )));
        }

        let (batch, seq_len, input_size) = input.dims3()?;
        if input_size != self.config.input_size {
            return Err(SSTError::Precondition(format!(
                "Mismatch between input visual encoding size ({}) and network input size ({})",
                input_size, self.config.input_size
            )));
        }

        if seq_len == 0 {
            return Err(SSTError::Precondition("Input sequence is empty".to_string()));
        }

        if let Some(expected) = self.config.seq_length {
            if seq_len != expected {
                return Err(SSTError::Precondition(format!(
                    "Sequence length {} does not match configured seq_length {}",
                    seq_len, expected
                )));
            }
        }

        if state.depth() != self.encoder.depth() || state.batch_size()? != batch {
            return Err(SSTError::Precondition(format!(
                "Encoder state covers {} layers x {} sequences, expected {} x {}",
                state.depth(),
                state.batch_size()?,
                self.encoder.depth(),
                batch
            )));
        }

        Ok(())
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `input` - Features `[batch, seq_len, input_size]`
    /// * `state` - Hidden state to start from (normally `initial_state`)
    /// * `train` - Enables dropout
    ///
    /// # Returns
    /// Tuple of (confidences `[batch, seq_len, num_proposals]` in (0, 1), final state)
    pub fn forward(&self, input: &Tensor, state: EncoderState, train: bool) -> crate::Result<(Tensor, EncoderState)> {
        self.check_input(input, &state)?;

        let input = if input.dtype() != self.dtype {
            input.to_dtype(self.dtype)?
        } else {
            input.clone()
        };

        let (hidden, state) = self.encoder.forward(&input, state, train)?;
        let scores = self.head.forward(&hidden)?;

        log::trace!("Proposal scores shape: {:?}", scores.dims());

        Ok((scores, state))
    }

    /// Deterministic proposal confidences for whole videos
    ///
    /// Starts from a fresh state and disables dropout. Outputs are not clipped.
    pub fn propose(&self, features: &Tensor) -> crate::Result<Tensor> {
        let batch = if features.rank() == 3 { features.dim(0)? } else { 0 };
        let state = self.initial_state(batch)?;
        let (scores, _) = self.forward(features, state, false)?;
        Ok(scores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn small_config() -> SSTConfig {
        SSTConfig {
            num_proposals: 4,
            seq_length: Some(12),
            depth: 2,
            width: 8,
            input_size: 6,
            ..Default::default()
        }
    }

    fn build(config: SSTConfig) -> crate::Result<(SSTModel, VarMap)> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F64, &Device::Cpu);
        let model = SSTModel::new(config, vb)?;
        Ok((model, varmap))
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> crate::Result<f64> {
        Ok((a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f64>()?)
    }

    #[test]
    fn test_encoder_state_zeros() -> Result<()> {
        let state = EncoderState::zeros(3, 2, 16, DType::F64, &Device::Cpu)?;

        assert_eq!(state.depth(), 3);
        assert_eq!(state.batch_size()?, 2);
        for h in &state.hidden {
            assert_eq!(h.dims(), &[2, 16]);
            assert_eq!(h.abs()?.sum_all()?.to_scalar::<f64>()?, 0.0);
        }

        Ok(())
    }

    #[test]
    fn test_forward_shapes() -> crate::Result<()> {
        let (model, varmap) = build(small_config())?;

        // 2 GRU layers x 5 tensors + dense weight and bias
        assert_eq!(varmap.all_vars().len(), 12);

        let x = Tensor::randn(0f64, 1.0, (3, 12, 6), &Device::Cpu)?;
        let state = model.initial_state(3)?;
        let (scores, state) = model.forward(&x, state, true)?;

        assert_eq!(scores.dims(), &[3, 12, 4]);
        assert_eq!(state.depth(), 2);

        let values = scores.flatten_all()?.to_vec1::<f64>()?;
        assert!(values.iter().all(|v| *v > 0.0 && *v < 1.0));

        Ok(())
    }

    #[test]
    fn test_invalid_config_fails_construction() {
        let config = SSTConfig { dropout: 1.5, ..small_config() };
        assert!(matches!(build(config), Err(SSTError::Config(_))));

        let config = SSTConfig { num_proposals: 0, ..small_config() };
        assert!(matches!(build(config), Err(SSTError::Config(_))));
    }

    #[test]
    fn test_forward_preconditions() -> crate::Result<()> {
        let (model, _varmap) = build(small_config())?;

        // Wrong rank
        let x = Tensor::randn(0f64, 1.0, (12, 6), &Device::Cpu)?;
        assert!(matches!(model.propose(&x), Err(SSTError::Precondition(_))));

        // Wrong feature width
        let x = Tensor::randn(0f64, 1.0, (1, 12, 7), &Device::Cpu)?;
        assert!(matches!(model.propose(&x), Err(SSTError::Precondition(_))));

        // Wrong sequence length
        let x = Tensor::randn(0f64, 1.0, (1, 10, 6), &Device::Cpu)?;
        assert!(matches!(model.propose(&x), Err(SSTError::Precondition(_))));

        // State for a different batch size
        let x = Tensor::randn(0f64, 1.0, (2, 12, 6), &Device::Cpu)?;
        let state = model.initial_state(3)?;
        assert!(matches!(model.forward(&x, state, false), Err(SSTError::Precondition(_))));

        Ok(())
    }

    #[test]
    fn test_untrimmed_sequences_accepted_without_fixed_length() -> crate::Result<()> {
        let (model, _varmap) = build(SSTConfig { seq_length: None, ..small_config() })?;

        let x = Tensor::randn(0f64, 1.0, (1, 37, 6), &Device::Cpu)?;
        assert_eq!(model.propose(&x)?.dims(), &[1, 37, 4]);

        Ok(())
    }

    #[test]
    fn test_hidden_state_isolation() -> crate::Result<()> {
        let (model, _varmap) = build(SSTConfig { dropout: 0.5, ..small_config() })?;

        let a = Tensor::randn(0f64, 1.0, (1, 12, 6), &Device::Cpu)?;
        let b = Tensor::randn(0f64, 1.0, (1, 12, 6), &Device::Cpu)?;

        // b alone
        let (alone, _) = model.forward(&b, model.initial_state(1)?, false)?;

        // a then b, resetting in between
        let (_, _) = model.forward(&a, model.initial_state(1)?, false)?;
        let (after_reset, _) = model.forward(&b, model.initial_state(1)?, false)?;

        assert_eq!(max_abs_diff(&alone, &after_reset)?, 0.0);

        // Carrying a's final state into b changes the result
        let (_, carried) = model.forward(&a, model.initial_state(1)?, false)?;
        let (leaked, _) = model.forward(&b, carried, false)?;
        assert!(max_abs_diff(&alone, &leaked)? > 0.0);

        Ok(())
    }

    #[test]
    fn test_dropout_only_in_training() -> crate::Result<()> {
        let (model, _varmap) = build(SSTConfig { dropout: 1.0, ..small_config() })?;
        let x = Tensor::randn(0f64, 1.0, (2, 12, 6), &Device::Cpu)?;

        // Every hidden unit dropped: head sees zeros, sigmoid(0 + bias) = 0.5
        let (train_scores, _) = model.forward(&x, model.initial_state(2)?, true)?;
        let values = train_scores.flatten_all()?.to_vec1::<f64>()?;
        assert!(values.iter().all(|v| (*v - 0.5).abs() < 1e-12));

        // Evaluation is deterministic and unaffected by dropout
        let first = model.propose(&x)?;
        let second = model.propose(&x)?;
        assert_eq!(max_abs_diff(&first, &second)?, 0.0);
        assert!(max_abs_diff(&first, &train_scores)? > 0.0);

        Ok(())
    }

    #[test]
    fn test_dropout_just_below_one_trains() -> crate::Result<()> {
        let config = SSTConfig { dropout: 1.0 - 1e-9, ..small_config() };
        let (model, _varmap) = build(config)?;
        let x = Tensor::randn(0f64, 1.0, (2, 12, 6), &Device::Cpu)?;

        let (scores, _) = model.forward(&x, model.initial_state(2)?, true)?;
        assert_eq!(scores.dims(), &[2, 12, 4]);
        let values = scores.flatten_all()?.to_vec1::<f64>()?;
        assert!(values.iter().all(|v| (*v - 0.5).abs() < 1e-12));

        Ok(())
    }

    #[test]
    fn test_encoder_rejects_short_state() -> crate::Result<()> {
        let (model, _varmap) = build(small_config())?;
        let x = Tensor::randn(0f64, 1.0, (1, 12, 6), &Device::Cpu)?;

        let state = EncoderState::zeros(1, 1, 8, DType::F64, &Device::Cpu)?;
        assert!(model.encoder.forward(&x, state, false).is_err());

        let state = EncoderState::zeros(2, 1, 8, DType::F64, &Device::Cpu)?;
        let (ys, state) = model.encoder.forward(&x, state, false)?;
        assert_eq!(ys.dims(), &[1, 12, 8]);
        assert_eq!(state.depth(), 2);

        Ok(())
    }
}
