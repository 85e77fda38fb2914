//! SST - Single-Stream Temporal action proposals
//!
//! A recurrent model that scores K temporal proposal anchors at every
//! timestep of a video feature sequence, together with the data loading,
//! class-weighted loss and training loop used to fit it.
//!
//! # Architecture
//!
//! - **Sequence encoder**: a stack of GRU layers (optional dropout between them)
//!   mapping `(N, T, D)` features to `(N, T, W)` hidden states
//! - **Proposal head**: one dense layer with sigmoid, `(N, T, W) -> (N, T, K)`
//! - **Weighted cross-entropy**: binary cross-entropy rebalanced by per-anchor
//!   class weights computed once from the training set
//!
//! # Example
//!
//! ```ignore
//! use sst::{ComputeContext, SSTConfig, SSTModel};
//!
//! let ctx = ComputeContext::cpu();
//! let varmap = candle_nn::VarMap::new();
//! let model = SSTModel::new(SSTConfig::default(), ctx.var_builder(&varmap))?;
//! let state = model.initial_state(features.dim(0)?)?;
//! let (scores, _state) = model.forward(&features, state, false)?;
//! ```

pub mod cli;
pub mod config;
pub mod data;
pub mod layers;
pub mod models;
pub mod training;
pub mod utils;

// Re-export commonly used items
pub use config::{ComputeContext, SSTConfig};
pub use models::{EncoderState, SSTModel};

/// Library error types
#[derive(Debug, thiserror::Error)]
pub enum SSTError {
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Data integrity error: {0}")]
    DataIntegrity(String),

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Training error: {0}")]
    Training(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("NPZ error: {0}")]
    Npz(#[from] ndarray_npy::ReadNpzError),

    #[error("Safetensors error: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),
}

pub type Result<T> = std::result::Result<T, SSTError>;
