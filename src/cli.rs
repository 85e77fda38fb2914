/// Command-line surface of the SST training script
use clap::Parser;
use std::path::PathBuf;

use crate::config::{ComputeContext, SSTConfig};
use crate::data::{BatchDataLoader, VideoDataLoader, VideoDataset};
use crate::training::{ClassWeights, EvalSplit, Trainer, TrainingConfig};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "sst_train",
    about = "Train and evaluate the SST temporal action proposal model"
)]
pub struct TrainArgs {
    /// Shorthand for the method; names the checkpoint directory and loss log.
    #[arg(long = "method-name", alias = "method_name", default_value = "baseline")]
    pub method_name: String,
    /// Directory of training samples (.npz with `relu6` and `label`).
    #[arg(long = "train-dir", default_value = "data/train")]
    pub train_dir: PathBuf,
    /// Directory of validation samples.
    #[arg(long = "val-dir", default_value = "data/val")]
    pub val_dir: PathBuf,
    /// Directory containing per-method checkpoint directories.
    #[arg(long = "param-dir", alias = "param_dir", default_value = "data/params")]
    pub param_dir: PathBuf,
    /// Checkpoint to resume from (training starts from scratch if missing).
    #[arg(long)]
    pub checkpoint: Option<PathBuf>,
    /// Parameter-only weights to initialise the model from.
    #[arg(long)]
    pub params: Option<PathBuf>,
    /// Write parameter-only weights here when the run finishes.
    #[arg(long = "save-params")]
    pub save_params: Option<PathBuf>,
    /// Number of proposals generated at each timestep.
    #[arg(short = 'k', long = "num-proposals", alias = "num_proposals", default_value_t = 32)]
    pub num_proposals: usize,
    /// Sequence length of each training instance.
    #[arg(long = "seq-length", alias = "seq_length", default_value_t = 128)]
    pub seq_length: usize,
    /// Number of recurrent layers in the sequence encoder.
    #[arg(long, default_value_t = 1)]
    pub depth: usize,
    /// Size of hidden state in each recurrent layer.
    #[arg(short = 'w', long, default_value_t = 256)]
    pub width: usize,
    /// Dimension of the visual features.
    #[arg(long = "feat-dim", default_value_t = 500)]
    pub feat_dim: usize,
    /// Size of mini batch.
    #[arg(long = "batch-size", alias = "batch_size", default_value_t = 64)]
    pub batch_size: usize,
    /// Number of training epochs.
    #[arg(short = 'e', long = "num-epochs", alias = "num_epochs", default_value_t = 200)]
    pub num_epochs: usize,
    /// Threshold on tIoU for a positive anchor.
    #[arg(long = "tiou", alias = "tIoU", default_value_t = 0.5)]
    pub tiou: f64,
    /// Dropout probability.
    #[arg(long, default_value_t = 0.5)]
    pub dropout: f64,
    /// Learning rate.
    #[arg(long = "lr", default_value_t = 0.01)]
    pub learning_rate: f64,
    /// Momentum coefficient.
    #[arg(long, default_value_t = 0.9)]
    pub momentum: f64,
    /// Use Nesterov momentum.
    #[arg(long)]
    pub nesterov: bool,
    /// Elementwise gradient clipping magnitude.
    #[arg(long = "grad-clip", default_value_t = 100.0)]
    pub grad_clip: f64,
    /// Data the per-epoch evaluation pass runs over.
    #[arg(long = "eval-split", value_enum, default_value_t = EvalSplit::Training)]
    pub eval_split: EvalSplit,
    /// Only evaluate a restored model; requires --checkpoint or --params.
    #[arg(long = "eval-only")]
    pub eval_only: bool,
    /// Directory of the `<method-name>_loss.txt` log.
    #[arg(long = "loss-log-dir", default_value = ".")]
    pub loss_log_dir: PathBuf,
    /// Seed for minibatch shuffling.
    #[arg(long)]
    pub seed: Option<u64>,
    /// Run on the first CUDA device if available.
    #[arg(long)]
    pub cuda: bool,
    /// Verbose logging.
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

impl TrainArgs {
    pub fn model_config(&self) -> SSTConfig {
        SSTConfig {
            num_proposals: self.num_proposals,
            seq_length: Some(self.seq_length),
            depth: self.depth,
            width: self.width,
            input_size: self.feat_dim,
            grad_clip: self.grad_clip,
            dropout: self.dropout,
            verbose: self.verbose,
            ..Default::default()
        }
    }

    pub fn training_config(&self) -> TrainingConfig {
        TrainingConfig {
            method_name: self.method_name.clone(),
            num_epochs: self.num_epochs,
            batch_size: self.batch_size,
            learning_rate: self.learning_rate,
            momentum: self.momentum,
            nesterov: self.nesterov,
            param_dir: self.param_dir.clone(),
            loss_log_dir: self.loss_log_dir.clone(),
            eval_split: self.eval_split,
            seed: self.seed,
            ..Default::default()
        }
    }
}

pub fn run(args: TrainArgs) -> anyhow::Result<()> {
    if args.eval_only && args.checkpoint.is_none() && args.params.is_none() {
        anyhow::bail!("--eval-only needs trained weights from --checkpoint or --params");
    }

    let ctx = if args.cuda {
        ComputeContext::cuda_if_available()?
    } else {
        ComputeContext::cpu()
    };
    log::info!("Using device: {:?}", ctx.device);

    log::info!("Reading training data ...");
    let train = VideoDataset::from_directory(&args.train_dir, args.tiou)?;
    log::info!("Reading validation data ...");
    let val = VideoDataset::from_directory(&args.val_dir, args.tiou)?;
    log::info!(
        "Number of training samples: {}, validation samples: {}",
        train.len(),
        val.len()
    );

    let weights = ClassWeights::from_labels(train.labels())?;
    log::debug!("Class weights: w0={:?} w1={:?}", weights.w0, weights.w1);

    log::info!("Building model ...");
    let mut trainer = Trainer::new(args.model_config(), args.training_config(), weights, ctx)?;

    let mut restored = false;
    if let Some(params) = &args.params {
        trainer.load_params(params)?;
        restored = true;
    }
    if let Some(checkpoint) = &args.checkpoint {
        restored |= trainer.resume_from(checkpoint)?;
    }
    if args.eval_only && !restored {
        anyhow::bail!("--eval-only found no trained weights to evaluate");
    }

    if args.eval_only {
        let dataset = match args.eval_split {
            EvalSplit::Training => &train,
            EvalSplit::Validation => &val,
        };
        let mut loader = VideoDataLoader::new(dataset, args.batch_size, false, None)?;
        log::info!(
            "Evaluating {} batches ({} samples dropped)",
            loader.num_batches(),
            loader.num_dropped()
        );
        let loss = trainer.evaluate(&mut loader)?;
        log::info!("{:?} loss: {:.3}", args.eval_split, loss);
    } else {
        log::info!("Starting training ...");
        trainer.train(&train, &val)?;
    }

    if let Some(path) = &args.save_params {
        trainer.save_params(path)?;
    }

    log::info!("DONE");
    Ok(())
}
