/// Data loading for SST training
pub mod video_dataset;

pub use video_dataset::{binarize_labels, VideoDataLoader, VideoDataset, FEATURE_KEY, LABEL_KEY};

use candle_core::Tensor;
use crate::config::ComputeContext;

/// Generic data loader trait
pub trait BatchDataLoader {
    /// Get next batch of (features, labels) tensors
    fn next_batch(&mut self, ctx: &ComputeContext) -> crate::Result<Option<(Tensor, Tensor)>>;

    /// Reset loader for new epoch
    fn reset(&mut self);

    /// Get total number of batches
    fn num_batches(&self) -> usize;
}
