/// Stochastic gradient descent with momentum
///
/// Classic momentum (optionally Nesterov) with elementwise gradient clipping.
use candle_core::backprop::GradStore;
use candle_core::{Result, Tensor, Var};
use std::collections::HashMap;

/// SGD optimizer configuration
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SgdConfig {
    /// Learning rate
    pub learning_rate: f64,
    /// Momentum coefficient
    pub momentum: f64,
    /// Use Nesterov momentum
    pub nesterov: bool,
    /// Clamp every gradient element to [-grad_clip, grad_clip]
    ///
    /// Applied to the accumulated parameter gradients before the momentum
    /// update, not to the gradient flowing through each recurrent timestep.
    pub grad_clip: Option<f64>,
}

impl Default for SgdConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.01,
            momentum: 0.9,
            nesterov: false,
            grad_clip: Some(100.0),
        }
    }
}

/// Parameter state for SGD
struct ParamState {
    name: String,
    var: Var,
    /// Momentum buffer
    velocity: Tensor,
}

/// SGD with momentum
///
/// Per parameter, with `g` the (clipped) gradient:
///
/// ```text
/// v = momentum * v + g
/// p = p - lr * v                      (classic)
/// p = p - lr * (g + momentum * v)     (nesterov)
/// ```
pub struct SgdMomentum {
    config: SgdConfig,
    params: Vec<ParamState>,
}

impl SgdMomentum {
    /// Create optimizer over named parameters
    ///
    /// Names key the momentum buffers in `state_dict`/`load_state_dict`.
    pub fn from_named(vars: Vec<(String, Var)>, config: SgdConfig) -> Result<Self> {
        let params = vars
            .into_iter()
            .filter(|(_, var)| var.dtype().is_float())
            .map(|(name, var)| {
                let velocity = var.zeros_like()?;
                Ok(ParamState { name, var, velocity })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { config, params })
    }

    pub fn config(&self) -> &SgdConfig {
        &self.config
    }

    /// Momentum buffers by parameter name
    pub fn state_dict(&self) -> HashMap<String, Tensor> {
        self.params
            .iter()
            .map(|p| (p.name.clone(), p.velocity.clone()))
            .collect()
    }

    /// Restore momentum buffers saved by `state_dict`
    ///
    /// Every parameter must have a buffer of matching shape.
    pub fn load_state_dict(&mut self, state: &HashMap<String, Tensor>) -> Result<()> {
        for param in self.params.iter_mut() {
            let velocity = state.get(&param.name).ok_or_else(|| {
                candle_core::Error::Msg(format!("missing momentum buffer for {}", param.name))
            })?;
            if velocity.dims() != param.var.dims() {
                return Err(candle_core::Error::Msg(format!(
                    "momentum buffer for {} has shape {:?}, expected {:?}",
                    param.name,
                    velocity.dims(),
                    param.var.dims()
                )));
            }
            param.velocity = velocity
                .to_dtype(param.var.dtype())?
                .to_device(param.var.device())?;
        }
        Ok(())
    }

    pub fn set_config(&mut self, config: SgdConfig) {
        self.config = config;
    }
}

impl candle_nn::Optimizer for SgdMomentum {
    type Config = SgdConfig;

    fn new(vars: Vec<Var>, config: SgdConfig) -> Result<Self> {
        let named = vars
            .into_iter()
            .enumerate()
            .map(|(i, var)| (format!("param_{}", i), var))
            .collect();
        Self::from_named(named, config)
    }

    fn step(&mut self, grads: &GradStore) -> Result<()> {
        let lr = self.config.learning_rate;
        let momentum = self.config.momentum;

        for param in self.params.iter_mut() {
            let Some(grad) = grads.get(param.var.as_tensor()) else {
                continue;
            };

            let grad = match self.config.grad_clip {
                Some(clip) => grad.clamp(-clip, clip)?,
                None => grad.clone(),
            };

            param.velocity = ((&param.velocity * momentum)? + &grad)?;

            let update = if self.config.nesterov {
                (&grad + (&param.velocity * momentum)?)?
            } else {
                param.velocity.clone()
            };

            param.var.set(&(param.var.as_tensor() - (update * lr)?)?)?;
        }

        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.config.learning_rate = lr;
    }
}
