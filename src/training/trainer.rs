/// Training loop for the SST proposal model
use candle_core::{DType, Tensor, Var};
use candle_nn::{Optimizer, VarMap};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use super::checkpoint::{checkpoint_path, Checkpoint, CheckpointMetadata};
use super::loss::{ClassWeights, WeightedCrossEntropy};
use super::optimizer::{SgdConfig, SgdMomentum};
use crate::config::{ComputeContext, SSTConfig};
use crate::data::{BatchDataLoader, VideoDataLoader, VideoDataset};
use crate::models::loader::{load_model_params, save_model_params};
use crate::utils::{count_parameters, LossLog};
use crate::{SSTError, SSTModel};

/// Dataset the per-epoch evaluation pass runs over
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, clap::ValueEnum)]
pub enum EvalSplit {
    /// Re-run the training set in order without updates
    Training,
    /// Use the validation set
    Validation,
}

/// Training configuration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TrainingConfig {
    /// Shorthand for the run; names the checkpoint directory and loss log
    pub method_name: String,
    /// Number of training epochs
    pub num_epochs: usize,
    /// Batch size
    pub batch_size: usize,
    /// Learning rate
    pub learning_rate: f64,
    /// Momentum coefficient
    pub momentum: f64,
    /// Nesterov momentum instead of classic momentum
    pub nesterov: bool,
    /// Save checkpoint every N epochs (0-based epochs divisible by N)
    pub save_every: usize,
    /// Root directory for per-method checkpoint directories
    pub param_dir: PathBuf,
    /// Directory of the `<method_name>_loss.txt` log
    pub loss_log_dir: PathBuf,
    /// Data the evaluation pass runs over
    pub eval_split: EvalSplit,
    /// Seed for minibatch shuffling
    pub seed: Option<u64>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            method_name: "baseline".to_string(),
            num_epochs: 200,
            batch_size: 64,
            learning_rate: 0.01,
            momentum: 0.9,
            nesterov: false,
            save_every: 10,
            param_dir: PathBuf::from("params"),
            loss_log_dir: PathBuf::from("."),
            eval_split: EvalSplit::Training,
            seed: None,
        }
    }
}

impl TrainingConfig {
    /// Validate configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.batch_size == 0 {
            return Err(SSTError::Config("batch_size must be > 0".to_string()));
        }

        if self.save_every == 0 {
            return Err(SSTError::Config("save_every must be > 0".to_string()));
        }

        if !(self.learning_rate > 0.0) {
            return Err(SSTError::Config(format!(
                "learning_rate must be > 0 (provided: {})",
                self.learning_rate
            )));
        }

        if !(0.0..1.0).contains(&self.momentum) {
            return Err(SSTError::Config(format!(
                "momentum must be in [0, 1) (provided: {})",
                self.momentum
            )));
        }

        if self.method_name.is_empty() {
            return Err(SSTError::Config("method_name must not be empty".to_string()));
        }

        Ok(())
    }
}

/// Losses of one finished epoch
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochReport {
    pub epoch: usize,
    pub train_loss: f64,
    pub val_loss: f64,
}

/// Model parameters sorted by name
fn named_vars(varmap: &VarMap) -> crate::Result<Vec<(String, Var)>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| SSTError::Training("parameter store lock poisoned".to_string()))?;
    let mut vars: Vec<(String, Var)> = data
        .iter()
        .map(|(name, var)| (name.clone(), var.clone()))
        .collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(vars)
}

fn scalar(loss: &Tensor) -> crate::Result<f64> {
    Ok(loss.to_dtype(DType::F64)?.to_scalar::<f64>()?)
}

/// Trainer for SSTModel
///
/// Owns the model parameters and optimizer state for the whole run.
pub struct Trainer {
    model: SSTModel,
    model_config: SSTConfig,
    varmap: VarMap,
    optimizer: SgdMomentum,
    criterion: WeightedCrossEntropy,
    class_weights: ClassWeights,
    config: TrainingConfig,
    ctx: ComputeContext,
    start_epoch: usize,
}

impl Trainer {
    /// Create new trainer
    ///
    /// `class_weights` must come from the training set and cover
    /// `model_config.num_proposals` anchors.
    pub fn new(
        model_config: SSTConfig,
        training_config: TrainingConfig,
        class_weights: ClassWeights,
        ctx: ComputeContext,
    ) -> crate::Result<Self> {
        training_config.validate()?;

        if class_weights.num_proposals() != model_config.num_proposals {
            return Err(SSTError::Config(format!(
                "class weights cover {} anchors, model has {}",
                class_weights.num_proposals(),
                model_config.num_proposals
            )));
        }

        let varmap = VarMap::new();
        let model = SSTModel::new(model_config.clone(), ctx.var_builder(&varmap))?;

        let optimizer = SgdMomentum::from_named(
            named_vars(&varmap)?,
            SgdConfig {
                learning_rate: training_config.learning_rate,
                momentum: training_config.momentum,
                nesterov: training_config.nesterov,
                grad_clip: Some(model_config.grad_clip),
            },
        )?;

        let criterion = WeightedCrossEntropy::new(&class_weights, &ctx)?;

        log::info!(
            "Model built: depth={}, width={}, proposals={}, {} parameters",
            model_config.depth,
            model_config.width,
            model_config.num_proposals,
            count_parameters(&varmap)
        );

        Ok(Self {
            model,
            model_config,
            varmap,
            optimizer,
            criterion,
            class_weights,
            config: training_config,
            ctx,
            start_epoch: 0,
        })
    }

    pub fn model(&self) -> &SSTModel {
        &self.model
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn optimizer(&self) -> &SgdMomentum {
        &self.optimizer
    }

    pub fn class_weights(&self) -> &ClassWeights {
        &self.class_weights
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// First epoch `train` will run
    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    /// Current parameter values by name
    pub fn model_params(&self) -> crate::Result<HashMap<String, Tensor>> {
        Ok(named_vars(&self.varmap)?
            .into_iter()
            .map(|(name, var)| (name, var.as_tensor().clone()))
            .collect())
    }

    /// Training step: fresh state, forward, weighted loss, one SGD update
    pub fn train_step(&mut self, features: &Tensor, labels: &Tensor) -> crate::Result<f64> {
        let state = self.model.initial_state(features.dim(0)?)?;
        let (predictions, _) = self.model.forward(features, state, true)?;

        let loss = self.criterion.forward(&predictions, labels)?;
        let loss_val = scalar(&loss)?;

        self.optimizer.backward_step(&loss)?;

        Ok(loss_val)
    }

    /// Loss of one batch without dropout or updates
    pub fn eval_step(&self, features: &Tensor, labels: &Tensor) -> crate::Result<f64> {
        let state = self.model.initial_state(features.dim(0)?)?;
        let (predictions, _) = self.model.forward(features, state, false)?;

        let loss = self.criterion.forward(&predictions, labels)?;
        scalar(&loss)
    }

    /// Train for one epoch, returning the mean batch loss
    pub fn train_epoch(&mut self, dataloader: &mut impl BatchDataLoader) -> crate::Result<f64> {
        if dataloader.num_batches() == 0 {
            return Err(SSTError::Training("no complete batch to train on".to_string()));
        }

        let mut total_loss = 0.0;
        let mut num_batches = 0;

        dataloader.reset();
        while let Some((features, labels)) = dataloader.next_batch(&self.ctx)? {
            let loss = self.train_step(&features, &labels)?;
            total_loss += loss;
            num_batches += 1;

            log::debug!("Batch {} loss: {:.4}", num_batches, loss);
        }

        Ok(total_loss / num_batches as f64)
    }

    /// Mean batch loss over a loader without updating parameters
    pub fn evaluate(&self, dataloader: &mut impl BatchDataLoader) -> crate::Result<f64> {
        if dataloader.num_batches() == 0 {
            return Err(SSTError::Training("no complete batch to evaluate".to_string()));
        }

        let mut total_loss = 0.0;
        let mut num_batches = 0;

        dataloader.reset();
        while let Some((features, labels)) = dataloader.next_batch(&self.ctx)? {
            total_loss += self.eval_step(&features, &labels)?;
            num_batches += 1;
        }

        Ok(total_loss / num_batches as f64)
    }

    /// Save a full checkpoint for `epoch` under `<param_dir>/<method_name>/`
    pub fn save_checkpoint(&self, epoch: usize, train_loss: f64, val_loss: f64) -> crate::Result<PathBuf> {
        let path = checkpoint_path(&self.config.param_dir, &self.config.method_name, epoch);

        let metadata = CheckpointMetadata {
            epoch,
            method_name: self.config.method_name.clone(),
            train_loss,
            val_loss,
            optimizer: self.optimizer.config().clone(),
            config: Some(serde_json::to_string(&self.model_config)?),
        };

        let checkpoint = Checkpoint::new(self.model_params()?, self.optimizer.state_dict(), metadata);
        checkpoint.save(&path)?;

        log::info!("Saved checkpoint to {}", path.display());
        Ok(path)
    }

    /// Restore parameters, optimizer state and epoch from a checkpoint
    ///
    /// A missing file is not an error: training starts from scratch and
    /// `Ok(false)` is returned.
    pub fn resume_from<P: AsRef<Path>>(&mut self, path: P) -> crate::Result<bool> {
        let path = path.as_ref();
        if !path.is_file() {
            log::warn!("=> no checkpoint found at '{}'", path.display());
            return Ok(false);
        }

        log::info!("=> loading checkpoint '{}'", path.display());
        let checkpoint = Checkpoint::load(path, &self.ctx.device)?;

        if let Some(saved) = &checkpoint.metadata.config {
            match serde_json::from_str::<SSTConfig>(saved) {
                Ok(saved) if saved != self.model_config => {
                    log::warn!("Checkpoint model config differs from the current one: {:?}", saved);
                }
                Ok(_) => {}
                Err(e) => log::warn!("Unreadable model config in checkpoint: {}", e),
            }
        }

        for (name, var) in named_vars(&self.varmap)? {
            let value = checkpoint.model.get(&name).ok_or_else(|| {
                SSTError::Precondition(format!("checkpoint has no parameter '{}'", name))
            })?;
            var.set(&value.to_dtype(var.dtype())?)?;
        }

        self.optimizer.load_state_dict(&checkpoint.optimizer)?;
        self.optimizer.set_config(checkpoint.metadata.optimizer.clone());
        self.start_epoch = checkpoint.metadata.epoch + 1;

        log::info!(
            "=> loaded checkpoint '{}' (epoch {})",
            path.display(),
            checkpoint.metadata.epoch
        );
        Ok(true)
    }

    /// Initialise parameters from a parameter-only file
    pub fn load_params<P: AsRef<Path>>(&mut self, path: P) -> crate::Result<()> {
        load_model_params(&mut self.varmap, path)
    }

    /// Write the current parameters without optimizer state
    pub fn save_params<P: AsRef<Path>>(&self, path: P) -> crate::Result<()> {
        save_model_params(&self.varmap, path)
    }

    /// Full training loop
    ///
    /// Every epoch trains on shuffled full batches of `train`, then runs an
    /// evaluation pass over the split chosen by `eval_split`. A checkpoint is
    /// written after every epoch divisible by `save_every`.
    pub fn train(&mut self, train: &VideoDataset, val: &VideoDataset) -> crate::Result<Vec<EpochReport>> {
        let eval_set = match self.config.eval_split {
            EvalSplit::Training => {
                log::warn!("Evaluation pass runs over the training set; pass the validation split to use held-out data");
                train
            }
            EvalSplit::Validation => val,
        };

        for (split, dataset) in [("training", train), ("evaluation", eval_set)] {
            if dataset.len() < self.config.batch_size {
                return Err(SSTError::Training(format!(
                    "{} set has {} samples, fewer than batch size {}",
                    split,
                    dataset.len(),
                    self.config.batch_size
                )));
            }
        }

        let mut train_loader = VideoDataLoader::new(train, self.config.batch_size, true, self.config.seed)?;
        let mut eval_loader = VideoDataLoader::new(eval_set, self.config.batch_size, false, None)?;
        let mut loss_log = LossLog::open(&self.config.loss_log_dir, &self.config.method_name)?;

        log::info!(
            "Starting training for epochs {}..{}: {} batches per epoch, {} samples dropped",
            self.start_epoch,
            self.config.num_epochs,
            train_loader.num_batches(),
            train_loader.num_dropped()
        );

        let global_start = Instant::now();
        let mut reports = Vec::new();
        for epoch in self.start_epoch..self.config.num_epochs {
            let start = Instant::now();

            let train_loss = self.train_epoch(&mut train_loader)?;
            let val_loss = self.evaluate(&mut eval_loader)?;

            log::info!(
                "[{},{}] Time took: {:.4}s",
                epoch + 1,
                self.config.num_epochs,
                start.elapsed().as_secs_f64()
            );
            log::info!("train loss: {:.3}", train_loss);
            log::info!("val loss: {:.3}", val_loss);

            loss_log.append(epoch, train_loss, val_loss)?;

            if epoch % self.config.save_every == 0 {
                self.save_checkpoint(epoch, train_loss, val_loss)?;
            }

            reports.push(EpochReport { epoch, train_loss, val_loss });
        }

        self.start_epoch = self.start_epoch.max(self.config.num_epochs);

        log::info!(
            "Training complete in {:.1}s",
            global_start.elapsed().as_secs_f64()
        );

        Ok(reports)
    }
}
