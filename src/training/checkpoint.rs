/// Training checkpoints in safetensors files
///
/// One file per checkpoint holds the model parameters (`model.<name>`), the
/// optimizer momentum buffers (`optimizer.velocity.<name>`) and a JSON
/// metadata record under the `sst.checkpoint` metadata key.
use candle_core::{Device, Tensor};
use safetensors::tensor::SafeTensors;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::optimizer::SgdConfig;
use crate::SSTError;

const MODEL_PREFIX: &str = "model.";
const VELOCITY_PREFIX: &str = "optimizer.velocity.";
const METADATA_KEY: &str = "sst.checkpoint";

/// Checkpoint file for `epoch` of run `method_name`:
/// `<param_dir>/<method_name>/epoch_<epoch>.ckpt`
pub fn checkpoint_path<P: AsRef<Path>>(param_dir: P, method_name: &str, epoch: usize) -> PathBuf {
    param_dir
        .as_ref()
        .join(method_name)
        .join(format!("epoch_{}.ckpt", epoch))
}

/// Checkpoint metadata
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CheckpointMetadata {
    /// Epoch index (0-based) the checkpoint was written after
    pub epoch: usize,
    /// Method identifier of the run
    pub method_name: String,
    /// Mean training loss of that epoch
    pub train_loss: f64,
    /// Mean evaluation loss of that epoch
    pub val_loss: f64,
    /// Optimizer hyper-parameters
    pub optimizer: SgdConfig,
    /// Model configuration (as JSON string)
    pub config: Option<String>,
}

/// Training checkpoint
pub struct Checkpoint {
    /// Model parameters by name
    pub model: HashMap<String, Tensor>,
    /// Optimizer momentum buffers by parameter name
    pub optimizer: HashMap<String, Tensor>,
    /// Metadata
    pub metadata: CheckpointMetadata,
}

impl Checkpoint {
    /// Create new checkpoint
    pub fn new(
        model: HashMap<String, Tensor>,
        optimizer: HashMap<String, Tensor>,
        metadata: CheckpointMetadata,
    ) -> Self {
        Self { model, optimizer, metadata }
    }

    /// Save checkpoint to file, creating parent directories as needed
    pub fn save<P: AsRef<Path>>(&self, path: P) -> crate::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut entries: Vec<(String, &Tensor)> = Vec::with_capacity(self.model.len() + self.optimizer.len());
        entries.extend(self.model.iter().map(|(name, t)| (format!("{}{}", MODEL_PREFIX, name), t)));
        entries.extend(self.optimizer.iter().map(|(name, t)| (format!("{}{}", VELOCITY_PREFIX, name), t)));

        let mut info = HashMap::new();
        info.insert(METADATA_KEY.to_string(), serde_json::to_string(&self.metadata)?);

        safetensors::serialize_to_file(entries, &Some(info), path)?;

        Ok(())
    }

    /// Load checkpoint from file
    ///
    /// # Arguments
    /// * `path` - Path to checkpoint file
    /// * `device` - Device to load tensors on
    pub fn load<P: AsRef<Path>>(path: P, device: &Device) -> crate::Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;

        let (_, header) = SafeTensors::read_metadata(&data)?;
        let metadata_json = header
            .metadata()
            .as_ref()
            .and_then(|m| m.get(METADATA_KEY))
            .ok_or_else(|| {
                SSTError::Precondition(format!("{} carries no checkpoint metadata", path.display()))
            })?;
        let metadata: CheckpointMetadata = serde_json::from_str(metadata_json)?;

        let mut model = HashMap::new();
        let mut optimizer = HashMap::new();
        for (name, tensor) in candle_core::safetensors::load_buffer(&data, device)? {
            if let Some(param) = name.strip_prefix(MODEL_PREFIX) {
                model.insert(param.to_string(), tensor);
            } else if let Some(param) = name.strip_prefix(VELOCITY_PREFIX) {
                optimizer.insert(param.to_string(), tensor);
            } else {
                return Err(SSTError::Precondition(format!(
                    "unexpected tensor '{}' in checkpoint {}",
                    name,
                    path.display()
                )));
            }
        }

        Ok(Self { model, optimizer, metadata })
    }
}
