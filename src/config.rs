/// Configuration for the SST proposal model and the compute context it runs in
use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};

/// Model hyper-parameters for the sequence encoder and proposal head
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SSTConfig {
    /// Number of proposal anchors scored at every timestep (K)
    pub num_proposals: usize,

    /// Fixed sequence length (T); `None` accepts untrimmed input of any length
    pub seq_length: Option<usize>,

    /// Number of stacked recurrent layers
    pub depth: usize,

    /// Hidden state width of each recurrent layer (W)
    pub width: usize,

    /// Size of the visual encoder output per timestep (D)
    pub input_size: usize,

    /// Elementwise gradient clipping magnitude
    pub grad_clip: f64,

    /// Initial value of the GRU reset-gate bias
    pub reset_bias: f64,

    /// Dropout probability applied after each recurrent layer (training only)
    pub dropout: f64,

    /// Log construction details at info level
    pub verbose: bool,
}

impl Default for SSTConfig {
    fn default() -> Self {
        Self {
            num_proposals: 32,
            seq_length: Some(128),
            depth: 1,
            width: 256,
            input_size: 500,
            grad_clip: 100.0,
            reset_bias: 5.0,
            dropout: 0.0,
            verbose: false,
        }
    }
}

impl SSTConfig {
    /// Validate configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.num_proposals == 0 {
            return Err(crate::SSTError::Config(format!(
                "Must provide a positive number of proposal anchors (provided: {})",
                self.num_proposals
            )));
        }

        if !(0.0..=1.0).contains(&self.dropout) {
            return Err(crate::SSTError::Config(format!(
                "Invalid value for dropout (p={})",
                self.dropout
            )));
        }

        if self.depth == 0 {
            return Err(crate::SSTError::Config("depth must be > 0".to_string()));
        }

        if self.width == 0 || self.input_size == 0 {
            return Err(crate::SSTError::Config(
                "width and input_size must be > 0".to_string(),
            ));
        }

        if self.seq_length == Some(0) {
            return Err(crate::SSTError::Config(
                "seq_length must be > 0 when fixed".to_string(),
            ));
        }

        if !(self.grad_clip > 0.0) {
            return Err(crate::SSTError::Config(format!(
                "grad_clip must be > 0 (provided: {})",
                self.grad_clip
            )));
        }

        Ok(())
    }

    /// Whether dropout layers are active during training
    pub fn dropout_enabled(&self) -> bool {
        self.dropout > 0.0
    }
}

/// Device and element type every tensor of a run is created with.
///
/// Passed explicitly to model, loader and trainer construction instead of a
/// process-wide default tensor type.
#[derive(Debug, Clone)]
pub struct ComputeContext {
    pub device: Device,
    pub dtype: DType,
}

impl Default for ComputeContext {
    fn default() -> Self {
        Self::cpu()
    }
}

impl ComputeContext {
    pub fn new(device: Device, dtype: DType) -> Self {
        Self { device, dtype }
    }

    /// Double precision on the CPU
    pub fn cpu() -> Self {
        Self::new(Device::Cpu, DType::F64)
    }

    /// Double precision on the first CUDA device, or the CPU when none is present
    pub fn cuda_if_available() -> crate::Result<Self> {
        Ok(Self::new(Device::cuda_if_available(0)?, DType::F64))
    }

    /// Variable builder that registers new parameters in `varmap`
    pub fn var_builder(&self, varmap: &VarMap) -> VarBuilder<'static> {
        VarBuilder::from_varmap(varmap, self.dtype, &self.device)
    }
}
