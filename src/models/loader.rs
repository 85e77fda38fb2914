/// Parameter-only persistence in safetensors files
///
/// Stores the named model parameters without any optimizer state, for
/// inference deployment or for initialising a new run from pretrained weights.
use std::path::Path;
use candle_nn::{VarBuilder, VarMap};
use crate::config::{ComputeContext, SSTConfig};
use super::SSTModel;

/// Save every parameter registered in `varmap`
pub fn save_model_params<P: AsRef<Path>>(varmap: &VarMap, path: P) -> crate::Result<()> {
    if let Some(parent) = path.as_ref().parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    varmap.save(path.as_ref())?;
    log::info!("Saved model parameters to {}", path.as_ref().display());
    Ok(())
}

/// Overwrite the parameters in `varmap` with the values stored at `path`
///
/// Every parameter of the model must be present in the file with a matching shape.
pub fn load_model_params<P: AsRef<Path>>(varmap: &mut VarMap, path: P) -> crate::Result<()> {
    varmap.load(path.as_ref())?;
    log::info!("Loaded model parameters from {}", path.as_ref().display());
    Ok(())
}

/// Load model from safetensors file for inference
///
/// # Arguments
/// * `config` - Model configuration
/// * `weights_path` - Path to safetensors file
/// * `ctx` - Device and dtype to load the model with
///
/// # Returns
/// Loaded SSTModel
pub fn load_model<P: AsRef<Path>>(
    config: SSTConfig,
    weights_path: P,
    ctx: &ComputeContext,
) -> crate::Result<SSTModel> {
    let vb = unsafe {
        VarBuilder::from_mmaped_safetensors(
            &[weights_path.as_ref()],
            ctx.dtype,
            &ctx.device,
        )?
    };

    SSTModel::new(config, vb)
}
