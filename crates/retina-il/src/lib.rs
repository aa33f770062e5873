//! Class-incremental training for single-stage object detectors
//!
//! A detector learns new classes in successive states without forgetting the
//! old ones. This crate provides the training driver around an opaque model:
//! - State machine that grows the output layer and rebuilds every
//!   state-dependent component on each transition
//! - Distillation snapshot of the previous state
//! - Exemplar replay buffer with per-class selection
//! - MAS importance regularization with an on-disk cache
//! - A-GEM gradient projection
//! - Mixed-precision training loop with warm-up, replay scheduling and
//!   checkpoint retention
//!
//! The detector, its loss and its optimizer stay behind the
//! [`DetectionModel`], [`DetectionLoss`] and [`Optimizer`] traits.

mod buffer;
mod checkpoint;
mod config;
mod data;
mod error;
mod history;
mod importance;
mod loss;
mod model;
mod optim;
mod params;
mod precision;
mod projection;
mod recorder;
mod scheduler;
mod trainer;
mod training;

pub use buffer::{BufferConfig, ReplayBuffer, SamplePresets};
pub use checkpoint::{load_into, Checkpoint, CheckpointStore, FsCheckpointStore};
pub use config::{
    BetaTarget, ReplayMode, SampleMethod, StateConfig, TrainingConfig, WarmupStage,
    GRAD_CLIP_NORM, LOSS_HISTORY_CAPACITY, LR_WARMUP_ITERS, OUTPUT_LAYER, RETENTION_INTERVAL,
};
pub use data::{Annotation, Batch, DataLoader, Dataset, Exemplar};
pub use error::{IlError, Result};
pub use history::LossHistory;
pub use importance::{ImportanceRegularizer, ImportanceSource, ParamImportance};
pub use loss::{DetectionLoss, IterationLosses, LossTerm, LossTerms};
pub use model::{DetectionModel, FrozenModel, HeadLayout, ModelBuilder, ModelMode};
pub use optim::{GroupHyper, HyperOverrides, Optimizer, DEFAULT_BETAS};
pub use params::ParamSet;
pub use precision::{GradScaler, GradScalerConfig};
pub use projection::{project, GradientProjector};
pub use recorder::{EpochRecord, MemoryRecorder, NullRecorder, Recorder};
pub use scheduler::{EpochScheduler, LrWarmup, SchedulerConfig, SchedulerType};
pub use trainer::{IncrementalTrainer, TrainerParts};
pub use training::{BiasCorrection, IterationOutcome, ReplaySchedule, RunSummary, TrainingLoop};

/// Flat-vector helpers over [`ParamSet`]
pub mod tensor {
    pub use crate::params::{
        add_scaled, clip_grad_norm, dot, flatten, global_norm, numel, unflatten_into, zeros_like,
    };
}

/// Prelude for common imports
pub mod prelude {
    pub use crate::{
        Batch, Dataset, DetectionLoss, DetectionModel, IlError, IncrementalTrainer, LossTerm,
        LossTerms, Optimizer, ParamSet, Result, TrainerParts, TrainingConfig, TrainingLoop,
    };
}
