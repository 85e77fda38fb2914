/// Fully-connected layer used by the proposal head
use candle_core::{Result, Tensor};
use candle_nn::{Init, VarBuilder};

/// Nonlinearity applied after the affine transform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Identity,
    Sigmoid,
}

impl Activation {
    pub fn apply(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Activation::Identity => Ok(xs.clone()),
            Activation::Sigmoid => candle_nn::ops::sigmoid(xs),
        }
    }
}

/// Dense layer with automatic dtype casting
///
/// Weights are `[out_features, in_features]` with Glorot-uniform
/// initialization; the bias starts at zero.
pub struct Dense {
    weight: Tensor,
    bias: Tensor,
    activation: Activation,
}

impl Dense {
    /// Create new Dense layer
    ///
    /// # Arguments
    /// * `in_features` - Input dimension
    /// * `out_features` - Output dimension
    /// * `activation` - Nonlinearity applied to the output
    /// * `vb` - VarBuilder for parameter initialization
    pub fn new(
        in_features: usize,
        out_features: usize,
        activation: Activation,
        vb: VarBuilder,
    ) -> Result<Self> {
        let bound = (6.0 / (in_features + out_features) as f64).sqrt();
        let weight = vb.get_with_hints(
            (out_features, in_features),
            "weight",
            Init::Uniform { lo: -bound, up: bound },
        )?;
        let bias = vb.get_with_hints(out_features, "bias", Init::Const(0.0))?;

        Ok(Self { weight, bias, activation })
    }

    /// Forward pass over `[..., in_features]`
    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let input_dtype = input.dtype();

        let weight = if self.weight.dtype() != input_dtype {
            self.weight.to_dtype(input_dtype)?
        } else {
            self.weight.clone()
        };
        let bias = if self.bias.dtype() != input_dtype {
            self.bias.to_dtype(input_dtype)?
        } else {
            self.bias.clone()
        };

        let output = input.broadcast_matmul(&weight.t()?)?.broadcast_add(&bias)?;
        self.activation.apply(&output)
    }

    pub fn out_features(&self) -> usize {
        self.weight.dims()[0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_dense_shapes() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F64, &device);

        let dense = Dense::new(8, 3, Activation::Identity, vb)?;
        let x = Tensor::randn(0f64, 1.0, (5, 8), &device)?;
        let y = dense.forward(&x)?;

        assert_eq!(y.dims(), &[5, 3]);
        assert_eq!(dense.out_features(), 3);

        Ok(())
    }

    #[test]
    fn test_sigmoid_output_in_unit_interval() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F64, &device);

        let dense = Dense::new(4, 6, Activation::Sigmoid, vb)?;
        let x = Tensor::randn(0f64, 10.0, (7, 4), &device)?;
        let values = dense.forward(&x)?.flatten_all()?.to_vec1::<f64>()?;

        assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));

        Ok(())
    }

    #[test]
    fn test_bias_starts_at_zero() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F64, &device);

        let dense = Dense::new(4, 2, Activation::Identity, vb)?;
        let zeros = Tensor::zeros((1, 4), DType::F64, &device)?;
        let out = dense.forward(&zeros)?.flatten_all()?.to_vec1::<f64>()?;

        assert_eq!(out, vec![0.0, 0.0]);

        Ok(())
    }
}
