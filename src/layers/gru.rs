/// Gated recurrent unit layer
///
/// Per timestep, with `x` the input and `h` the previous hidden state:
///
/// ```text
/// r  = sigmoid(x W_xr + h W_hr + b_r)
/// u  = sigmoid(x W_xu + h W_hu + b_u)
/// c  = tanh(x W_xc + r * (h W_hc) + b_c)
/// h' = (1 - u) * h + u * c
/// ```
///
/// The reset gate scales the hidden contribution to the candidate, not the
/// hidden state itself.
use candle_core::{Result, Tensor};
use candle_nn::{ops, Init, VarBuilder};

const WEIGHT_STDEV: f64 = 0.1;

pub struct GruLayer {
    /// Input projections for [reset | update | candidate]: `[input_size, 3 * hidden]`
    w_x: Tensor,
    /// Hidden projections for [reset | update | candidate]: `[hidden, 3 * hidden]`
    w_h: Tensor,
    b_reset: Tensor,
    b_update: Tensor,
    b_candidate: Tensor,
    input_size: usize,
    hidden_size: usize,
}

impl GruLayer {
    /// Create new GRU layer
    ///
    /// # Arguments
    /// * `input_size` - Width of each input vector
    /// * `hidden_size` - Width of the hidden state
    /// * `reset_bias` - Initial value of the reset-gate bias
    /// * `vb` - VarBuilder for parameter initialization
    pub fn new(
        input_size: usize,
        hidden_size: usize,
        reset_bias: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        let init_w = Init::Randn { mean: 0.0, stdev: WEIGHT_STDEV };
        let w_x = vb.get_with_hints((input_size, 3 * hidden_size), "w_x", init_w)?;
        let w_h = vb.get_with_hints((hidden_size, 3 * hidden_size), "w_h", init_w)?;
        let b_reset = vb.get_with_hints(hidden_size, "b_reset", Init::Const(reset_bias))?;
        let b_update = vb.get_with_hints(hidden_size, "b_update", Init::Const(0.0))?;
        let b_candidate = vb.get_with_hints(hidden_size, "b_candidate", Init::Const(0.0))?;

        Ok(Self {
            w_x,
            w_h,
            b_reset,
            b_update,
            b_candidate,
            input_size,
            hidden_size,
        })
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// Single recurrence step
    ///
    /// `x_proj` is the precomputed input projection `[batch, 3 * hidden]`,
    /// `h` the previous state `[batch, hidden]`.
    fn step(&self, x_proj: &Tensor, h: &Tensor) -> Result<Tensor> {
        let w = self.hidden_size;
        let h_proj = h.matmul(&self.w_h)?;

        let reset = (x_proj.narrow(1, 0, w)? + h_proj.narrow(1, 0, w)?)?
            .broadcast_add(&self.b_reset)?;
        let reset = ops::sigmoid(&reset)?;

        let update = (x_proj.narrow(1, w, w)? + h_proj.narrow(1, w, w)?)?
            .broadcast_add(&self.b_update)?;
        let update = ops::sigmoid(&update)?;

        let candidate = (x_proj.narrow(1, 2 * w, w)? + (reset * h_proj.narrow(1, 2 * w, w)?)?)?
            .broadcast_add(&self.b_candidate)?
            .tanh()?;

        // (1 - u) * h + u * c == h + u * (c - h)
        h + (update * (candidate - h)?)?
    }

    /// Run the layer over a whole sequence
    ///
    /// # Arguments
    /// * `xs` - Input sequence `[batch, seq_len, input_size]`
    /// * `h0` - Initial hidden state `[batch, hidden]`
    ///
    /// # Returns
    /// Tuple of (outputs `[batch, seq_len, hidden]`, final state `[batch, hidden]`)
    pub fn forward(&self, xs: &Tensor, h0: &Tensor) -> Result<(Tensor, Tensor)> {
        let (batch, seq_len, input_size) = xs.dims3()?;

        // Input projections for every timestep in one matmul
        let x_proj = xs
            .reshape((batch * seq_len, input_size))?
            .matmul(&self.w_x)?
            .reshape((batch, seq_len, 3 * self.hidden_size))?;

        let mut h = h0.clone();
        let mut outputs = Vec::with_capacity(seq_len);
        for t in 0..seq_len {
            let x_t = x_proj.narrow(1, t, 1)?.squeeze(1)?;
            h = self.step(&x_t, &h)?;
            outputs.push(h.clone());
        }

        let ys = Tensor::stack(&outputs, 1)?;
        Ok((ys, h))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_gru_output_shapes() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F64, &device);

        let gru = GruLayer::new(6, 4, 5.0, vb)?;
        let xs = Tensor::randn(0f64, 1.0, (3, 10, 6), &device)?;
        let h0 = Tensor::zeros((3, 4), DType::F64, &device)?;

        let (ys, h) = gru.forward(&xs, &h0)?;

        assert_eq!(ys.dims(), &[3, 10, 4]);
        assert_eq!(h.dims(), &[3, 4]);

        // Final state equals the last output
        let last = ys.narrow(1, 9, 1)?.squeeze(1)?;
        let diff = (last - &h)?.abs()?.sum_all()?.to_scalar::<f64>()?;
        assert_eq!(diff, 0.0);

        Ok(())
    }

    #[test]
    fn test_reset_bias_initialization() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F64, &device);

        let gru = GruLayer::new(2, 3, 5.0, vb)?;

        assert_eq!(gru.b_reset.to_vec1::<f64>()?, vec![5.0; 3]);
        assert_eq!(gru.b_update.to_vec1::<f64>()?, vec![0.0; 3]);
        assert_eq!(gru.b_candidate.to_vec1::<f64>()?, vec![0.0; 3]);

        Ok(())
    }

    #[test]
    fn test_hidden_state_stays_bounded() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F64, &device);

        let gru = GruLayer::new(5, 8, 5.0, vb)?;
        let xs = Tensor::randn(0f64, 100.0, (2, 32, 5), &device)?;
        let h0 = Tensor::zeros((2, 8), DType::F64, &device)?;

        let (ys, _) = gru.forward(&xs, &h0)?;
        let max = ys.abs()?.flatten_all()?.max(0)?.to_scalar::<f64>()?;

        // Convex combination of a bounded state and a tanh candidate
        assert!(max <= 1.0);

        Ok(())
    }
}
