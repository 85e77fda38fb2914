/// Training infrastructure for SST
pub mod checkpoint;
pub mod loss;
pub mod optimizer;
pub mod trainer;

pub use checkpoint::{checkpoint_path, Checkpoint, CheckpointMetadata};
pub use loss::{ClassWeights, WeightedCrossEntropy};
pub use optimizer::{SgdConfig, SgdMomentum};
pub use trainer::{EpochReport, EvalSplit, Trainer, TrainingConfig};
