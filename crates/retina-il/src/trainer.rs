//! Incremental state machine
//!
//! [`IncrementalTrainer`] owns everything whose shape depends on the current
//! state: the live model, the frozen previous-state snapshot, the replay
//! buffer, the MAS regularizer and the A-GEM projector. [`next_state`] is the
//! only operation that changes them, and it leaves them consistent with the
//! new state before returning.
//!
//! Optional components are `None` when their feature is disabled:
//!
//! | component   | present when                          |
//! |-------------|---------------------------------------|
//! | `previous`  | `distill` and state > 0               |
//! | `replay`    | `sample_num > 0` and state > 0        |
//! | `importance`| `mas` and state > 0                   |
//! | `projector` | `agem` and state > 0                  |
//!
//! [`next_state`]: IncrementalTrainer::next_state

use crate::buffer::{BufferConfig, ReplayBuffer, SamplePresets};
use crate::checkpoint::{self, Checkpoint, CheckpointStore};
use crate::config::{StateConfig, TrainingConfig};
use crate::data::{DataLoader, Dataset};
use crate::history::LossHistory;
use crate::importance::ImportanceRegularizer;
use crate::model::{DetectionModel, FrozenModel, ModelBuilder};
use crate::optim::Optimizer;
use crate::params::ParamSet;
use crate::projection::GradientProjector;
use crate::scheduler::EpochScheduler;
use crate::{IlError, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info};

/// External collaborators handed to the trainer
pub struct TrainerParts<M> {
    /// Live model, sized for the starting state
    pub model: M,
    /// Optimizer over the live model
    pub optimizer: Box<dyn Optimizer<M>>,
    /// Per-epoch learning rate schedule
    pub scheduler: EpochScheduler,
    /// Training data
    pub dataset: Box<dyn Dataset>,
    /// Checkpoint persistence
    pub checkpoints: Box<dyn CheckpointStore>,
    /// Builds empty models for previous-state snapshots
    pub model_builder: ModelBuilder<M>,
}

/// Incremental learning state machine
pub struct IncrementalTrainer<M> {
    pub(crate) config: TrainingConfig,
    pub(crate) model: M,
    pub(crate) optimizer: Box<dyn Optimizer<M>>,
    pub(crate) scheduler: EpochScheduler,
    pub(crate) dataset: Box<dyn Dataset>,
    pub(crate) loader: DataLoader,
    pub(crate) checkpoints: Box<dyn CheckpointStore>,
    model_builder: ModelBuilder<M>,
    presets: SamplePresets,
    cur_state: usize,
    pub(crate) previous: Option<FrozenModel<M>>,
    pub(crate) replay: Option<ReplayBuffer>,
    pub(crate) importance: Option<ImportanceRegularizer>,
    pub(crate) projector: Option<GradientProjector>,
    pub(crate) loss_history: LossHistory,
    warm_stage: Option<usize>,
    pub(crate) rng: StdRng,
    transitions: usize,
}

impl<M: DetectionModel> IncrementalTrainer<M> {
    /// Set up the trainer at `config.start_state`.
    ///
    /// Starting past the first state runs the catch-up sequence in fixed
    /// order: projector, replay buffer, previous snapshot, importance.
    pub fn initialize(config: TrainingConfig, parts: TrainerParts<M>) -> Result<Self> {
        config.validate()?;

        let expected = config.state(config.start_state)?.num_knowing_class;
        if parts.model.num_classes() != expected {
            return Err(IlError::Config(format!(
                "model predicts {} classes but state {} knows {}",
                parts.model.num_classes(),
                config.start_state,
                expected
            )));
        }

        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let loader = DataLoader::new(&*parts.dataset, config.batch_size, false);

        let mut trainer = Self {
            cur_state: config.start_state,
            config,
            model: parts.model,
            optimizer: parts.optimizer,
            scheduler: parts.scheduler,
            dataset: parts.dataset,
            loader,
            checkpoints: parts.checkpoints,
            model_builder: parts.model_builder,
            presets: SamplePresets::builtin()?,
            previous: None,
            replay: None,
            importance: None,
            projector: None,
            loss_history: LossHistory::default(),
            warm_stage: None,
            rng,
            transitions: 0,
        };

        if trainer.cur_state > 0 {
            let state = trainer.cur_state;
            info!("Catching up to state {}", state);
            trainer.init_projector();
            if trainer.config.replay_enabled() {
                trainer.replay = Some(trainer.build_replay(state)?);
            }
            trainer.previous = trainer.load_previous_model(state)?;
            trainer.importance = trainer.compute_importance(state - 1)?;
        }

        Ok(trainer)
    }

    /// Use a different preset table for custom exemplar selection
    pub fn with_presets(mut self, presets: SamplePresets) -> Self {
        self.presets = presets;
        self
    }

    fn init_projector(&mut self) {
        self.projector = self.config.agem.then(GradientProjector::new);
    }

    /// Replay buffer holding every state before `state`
    fn build_replay(&self, state: usize) -> Result<ReplayBuffer> {
        let mut buffer = ReplayBuffer::new(
            BufferConfig::from_training(&self.config),
            self.presets.clone(),
        );
        buffer.init(&*self.dataset, state)?;
        info!("Replay buffer initialized with {} exemplars", buffer.len());
        Ok(buffer)
    }

    /// Frozen snapshot of the state before `state`, from its last checkpoint
    fn load_previous_model(&self, state: usize) -> Result<Option<FrozenModel<M>>> {
        let prev_state = state.checked_sub(1).ok_or(IlError::NoPreviousState)?;
        if !self.config.distill {
            return Ok(None);
        }

        let num_classes = self.config.state(prev_state)?.num_knowing_class;
        let mut model = (self.model_builder)(num_classes)?;
        checkpoint::load_into(&*self.checkpoints, prev_state, None, &mut model)?;
        debug!("Loaded previous-state snapshot of state {}", prev_state);
        Ok(Some(FrozenModel::new(model, prev_state)))
    }

    /// Load or compute importance for the `completed` state.
    ///
    /// Runs against the live model and data, which must still be those of
    /// `completed`.
    fn compute_importance(&mut self, completed: usize) -> Result<Option<ImportanceRegularizer>> {
        if !self.config.mas {
            return Ok(None);
        }
        debug!("Update MAS");

        let path = self.config.importance_cache_path(completed);
        let mut regularizer = ImportanceRegularizer::new();
        let plan = self.loader.epoch(&mut self.rng);
        let dataset = &self.dataset;
        let batches = plan.iter().map(|indices| dataset.get_batch(indices));
        regularizer.load_or_compute(completed, &path, &mut self.model, batches)?;
        Ok(Some(regularizer))
    }

    /// Advance to the next state.
    ///
    /// Order matters: importance is estimated before the output layer grows,
    /// so it reflects the old class count. Every fallible step runs before
    /// anything is replaced, so on `Err` the trainer is still at the old
    /// state with its old components.
    pub fn next_state(&mut self) -> Result<()> {
        let completed = self.cur_state;
        let next = completed + 1;
        let num_new_class = self.config.state(next)?.num_new_class;

        let importance = self.compute_importance(completed)?;
        let replay = if self.config.replay_enabled() {
            match self.replay.as_ref() {
                Some(buffer) => {
                    let mut buffer = buffer.clone();
                    buffer.advance_state(self.dataset.exemplars(completed))?;
                    Some(buffer)
                }
                None => Some(self.build_replay(next)?),
            }
        } else {
            None
        };
        let previous = self.load_previous_model(next)?;
        self.model.expand_capacity(num_new_class)?;

        self.cur_state = next;
        self.importance = importance;
        self.dataset.advance_state();
        self.replay = replay;
        if next == 1 {
            self.init_projector();
        }
        self.loader = DataLoader::new(&*self.dataset, self.config.batch_size, false);
        self.previous = previous;
        self.scheduler.reset();
        self.warm_stage = None;
        self.transitions += 1;

        info!(
            "Advanced to state {} ({} classes, {} training images)",
            self.cur_state,
            self.model.num_classes(),
            self.dataset.len()
        );
        Ok(())
    }

    /// Apply the warm-up schedule for `epoch`; returns the active stage.
    pub fn warm_up(&mut self, epoch: usize) -> Result<Option<usize>> {
        let stage = self
            .config
            .state(self.cur_state)?
            .warmup_stage(epoch)
            .map(|(idx, stage)| (idx, stage.layers.clone()));

        self.warm_stage = match stage {
            Some((idx, Some(layers))) => {
                self.model.freeze(&layers);
                Some(idx)
            }
            Some((idx, None)) => {
                self.model.unfreeze_all();
                Some(idx)
            }
            None => {
                self.model.unfreeze_all();
                None
            }
        };
        Ok(self.warm_stage)
    }

    /// Whether the active warm-up stage trains only the classification output
    pub fn warming_classifier(&self) -> bool {
        let Some(idx) = self.warm_stage else {
            return false;
        };
        self.config
            .states
            .get(self.cur_state)
            .and_then(|state| state.warmup.get(idx))
            .is_some_and(|stage| stage.warms_classifier())
    }

    /// MAS penalty of the live model and its gradient
    pub fn importance_penalty(&self) -> Option<(f32, ParamSet)> {
        let regularizer = self.importance.as_ref()?;
        let current = self.model.parameters();
        let reference = self.previous.as_ref().map(|p| p.model().parameters());
        let ratio = self.config.mas_ratio;

        let penalty = regularizer.penalty(&current, reference.as_ref(), ratio);
        let gradient = regularizer.penalty_gradient(&current, reference.as_ref(), ratio);
        Some((penalty, gradient))
    }

    /// Save the current state, epoch, model, optimizer, scheduler and losses
    pub fn save_checkpoint(&mut self, epoch_losses: Option<&[f32]>, epoch: usize) -> Result<()> {
        let checkpoint = Checkpoint {
            state: self.cur_state,
            epoch,
            params: self.model.parameters(),
            optimizer: self.optimizer.state_bytes()?,
            scheduler: self.scheduler.clone(),
            loss_history: self.loss_history.to_vec(),
            epoch_losses: epoch_losses.map(<[f32]>::to_vec),
        };
        self.checkpoints.save(&checkpoint)
    }

    /// Retention cleanup of the current state's checkpoints
    pub fn delete_old_checkpoints(&mut self, epoch: usize) -> Result<usize> {
        self.checkpoints.delete_old(self.cur_state, epoch)
    }

    /// Current state index
    pub fn current_state(&self) -> usize {
        self.cur_state
    }

    /// Configuration of the current state
    pub fn state_config(&self) -> Result<&StateConfig> {
        self.config.state(self.cur_state)
    }

    /// Run configuration
    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Live model
    pub fn model(&self) -> &M {
        &self.model
    }

    /// Mutable live model
    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    /// Previous-state snapshot
    pub fn previous(&self) -> Option<&FrozenModel<M>> {
        self.previous.as_ref()
    }

    /// Replay buffer
    pub fn replay(&self) -> Option<&ReplayBuffer> {
        self.replay.as_ref()
    }

    /// MAS regularizer
    pub fn importance(&self) -> Option<&ImportanceRegularizer> {
        self.importance.as_ref()
    }

    /// A-GEM projector
    pub fn projector(&self) -> Option<&GradientProjector> {
        self.projector.as_ref()
    }

    /// Training data
    pub fn dataset(&self) -> &dyn Dataset {
        &*self.dataset
    }

    /// Batch plan for the current data
    pub fn loader(&self) -> &DataLoader {
        &self.loader
    }

    /// Optimizer
    pub fn optimizer(&self) -> &dyn Optimizer<M> {
        &*self.optimizer
    }

    /// Epoch scheduler
    pub fn scheduler(&self) -> &EpochScheduler {
        &self.scheduler
    }

    /// Recent losses
    pub fn loss_history(&self) -> &LossHistory {
        &self.loss_history
    }

    /// Active warm-up stage
    pub fn warm_stage(&self) -> Option<usize> {
        self.warm_stage
    }

    /// Transitions performed by [`next_state`](Self::next_state)
    pub fn transitions(&self) -> usize {
        self.transitions
    }
}

impl<M> std::fmt::Debug for IncrementalTrainer<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncrementalTrainer")
            .field("cur_state", &self.cur_state)
            .field("has_previous", &self.previous.is_some())
            .field("has_replay", &self.replay.is_some())
            .field("has_importance", &self.importance.is_some())
            .field("has_projector", &self.projector.is_some())
            .field("transitions", &self.transitions)
            .finish()
    }
}
