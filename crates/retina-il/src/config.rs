//! Run configuration and the per-state class table
//!
//! [`TrainingConfig`] is the typed form of the option map the training driver
//! reads. It loads from JSON and is validated once before a run starts:
//!
//! ```ignore
//! use retina_il::TrainingConfig;
//!
//! let config = TrainingConfig::from_json(Path::new("runs/voc_15_5.json"))?;
//! config.validate()?;
//! ```

use crate::{IlError, Result};
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

/// Global gradient-norm bound applied before every optimizer step.
pub const GRAD_CLIP_NORM: f32 = 0.1;

/// Iterations over which the learning rate ramps up in the first epoch of a state.
pub const LR_WARMUP_ITERS: usize = 100;

/// Old checkpoints are cleaned up every this many epochs.
pub const RETENTION_INTERVAL: usize = 5;

/// Capacity of the running-loss history.
pub const LOSS_HISTORY_CAPACITY: usize = 500;

/// Layer name that designates the classification output layer in a warm-up stage.
pub const OUTPUT_LAYER: &str = "output";

/// One warm-up stage: applies to every epoch up to and including `last_epoch`
/// that is not covered by an earlier stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarmupStage {
    /// Last epoch (inclusive) of this stage
    pub last_epoch: usize,
    /// Trainable layer allow-list; `None` trains everything
    pub layers: Option<Vec<String>>,
}

impl WarmupStage {
    /// Create a stage restricted to the given layers
    pub fn layers(last_epoch: usize, layers: &[&str]) -> Self {
        Self {
            last_epoch,
            layers: Some(layers.iter().map(|l| l.to_string()).collect()),
        }
    }

    /// Create an unrestricted stage
    pub fn unrestricted(last_epoch: usize) -> Self {
        Self {
            last_epoch,
            layers: None,
        }
    }

    /// Whether this stage warms only the classification output layer
    pub fn warms_classifier(&self) -> bool {
        matches!(&self.layers, Some(layers) if layers.len() == 1 && layers[0] == OUTPUT_LAYER)
    }
}

/// Immutable configuration of a single incremental state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateConfig {
    /// Classes introduced by this state
    pub num_new_class: usize,
    /// Classes learned by earlier states
    pub num_past_class: usize,
    /// All classes known after this state (`past + new`)
    pub num_knowing_class: usize,
    /// First epoch of this state when it is not the run's starting state
    pub start_epoch: usize,
    /// Last epoch of this state when it is not the run's starting state
    pub end_epoch: usize,
    /// Warm-up schedule, ordered by `last_epoch`
    #[serde(default)]
    pub warmup: Vec<WarmupStage>,
}

impl StateConfig {
    /// Build the state table from per-state new-class counts.
    ///
    /// Every state gets the epoch range `1..=epochs` and no warm-up.
    pub fn plan(new_classes: &[usize], epochs: usize) -> Vec<StateConfig> {
        let mut past = 0;
        new_classes
            .iter()
            .map(|&num_new_class| {
                let state = StateConfig {
                    num_new_class,
                    num_past_class: past,
                    num_knowing_class: past + num_new_class,
                    start_epoch: 1,
                    end_epoch: epochs,
                    warmup: Vec::new(),
                };
                past += num_new_class;
                state
            })
            .collect()
    }

    /// Warm-up stage covering `epoch`, with its index
    pub fn warmup_stage(&self, epoch: usize) -> Option<(usize, &WarmupStage)> {
        self.warmup
            .iter()
            .enumerate()
            .find(|(_, stage)| epoch <= stage.last_epoch)
    }
}

/// Exemplar selection strategy for the replay buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleMethod {
    /// `sample_num` random images per class
    Random,
    /// The first `sample_num` images per class, in image-id order
    First,
    /// A named image-id preset
    Custom,
}

/// Which optimizer parameter groups get the replay momentum override
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetaTarget {
    /// Both groups
    All,
    /// Output group (index 1) only
    Output,
    /// Feature group (index 0) only
    Feature,
}

impl BetaTarget {
    /// Whether the override applies to parameter group `group`
    pub fn covers(&self, group: usize) -> bool {
        match self {
            BetaTarget::All => true,
            BetaTarget::Feature => group == 0,
            BetaTarget::Output => group == 1,
        }
    }
}

/// How replay batches are scheduled within an epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayMode {
    /// Replay batches interleaved between training iterations
    Interleaved,
    /// One full replay pass after the training batches
    Dedicated,
}

/// Configuration of a full incremental run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Per-state class table
    pub states: Vec<StateConfig>,
    /// State the run starts in
    pub start_state: usize,
    /// Last state to train (clamped to `start_state`)
    pub end_state: usize,
    /// First epoch of the starting state
    pub start_epoch: usize,
    /// Last epoch of the starting state
    pub end_epoch: usize,
    /// Training batch size
    pub batch_size: usize,
    /// Keep a frozen previous-state snapshot
    pub distill: bool,
    /// Enable the MAS importance penalty
    pub mas: bool,
    /// Weight of the MAS penalty
    pub mas_ratio: f32,
    /// File stem of the importance cache
    pub mas_file: String,
    /// Enable A-GEM gradient projection
    pub agem: bool,
    /// Run bias correction after the final state
    pub bic: bool,
    /// Exemplars per class; replay is disabled when `<= 0`
    pub sample_num: i64,
    /// Exemplar selection strategy
    pub sample_method: SampleMethod,
    /// Version of the custom sample presets
    pub sample_preset_version: String,
    /// Interleave replay batches instead of a dedicated pass
    pub mix_data: bool,
    /// Interleaving starts after this epoch
    pub mix_data_start: usize,
    /// First-moment beta used while training on replay batches
    pub beta_on_replay: f32,
    /// Groups that get `beta_on_replay`
    pub beta_on_where: BetaTarget,
    /// Run the enhance-loss correction pass after each state
    pub final_correction: bool,
    /// Loss function emits the enhance term
    pub enhance_error: bool,
    /// Bound on correction passes
    pub max_correction_rounds: usize,
    /// Propagate iteration errors instead of skipping the batch
    pub debug: bool,
    /// Forward state changes to the recorder
    pub record: bool,
    /// Checkpoint and cache root
    pub ckp_path: PathBuf,
    /// RNG seed for shuffling and exemplar selection
    pub seed: Option<u64>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            states: StateConfig::plan(&[15, 5], 10),
            start_state: 0,
            end_state: 1,
            start_epoch: 1,
            end_epoch: 10,
            batch_size: 8,
            distill: true,
            mas: false,
            mas_ratio: 1.0,
            mas_file: "mas_importance".into(),
            agem: false,
            bic: false,
            sample_num: 0,
            sample_method: SampleMethod::Random,
            sample_preset_version: "v1".into(),
            mix_data: false,
            mix_data_start: 0,
            beta_on_replay: 0.9,
            beta_on_where: BetaTarget::All,
            final_correction: false,
            enhance_error: false,
            max_correction_rounds: 50,
            debug: false,
            record: false,
            ckp_path: PathBuf::from("./checkpoint"),
            seed: None,
        }
    }
}

impl TrainingConfig {
    /// Load configuration from a JSON file
    pub fn from_json(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn to_json(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Check the state table and option ranges
    pub fn validate(&self) -> Result<()> {
        if self.states.is_empty() {
            return Err(IlError::Config("state table is empty".into()));
        }
        if self.start_state >= self.states.len() {
            return Err(IlError::Config(format!(
                "start_state {} out of range for {} states",
                self.start_state,
                self.states.len()
            )));
        }
        if self.last_state() >= self.states.len() {
            return Err(IlError::Config(format!(
                "end_state {} out of range for {} states",
                self.end_state,
                self.states.len()
            )));
        }
        if self.batch_size == 0 {
            return Err(IlError::Config("batch_size must be positive".into()));
        }
        if self.start_epoch == 0 || self.start_epoch > self.end_epoch {
            return Err(IlError::Config(format!(
                "invalid epoch range {}..={}",
                self.start_epoch, self.end_epoch
            )));
        }
        if self.mas_ratio < 0.0 {
            return Err(IlError::Config("mas_ratio must be non-negative".into()));
        }
        if !(0.0..1.0).contains(&self.beta_on_replay) {
            return Err(IlError::Config(format!(
                "beta_on_replay {} must be in [0, 1)",
                self.beta_on_replay
            )));
        }

        let mut prev_knowing = 0;
        for (idx, state) in self.states.iter().enumerate() {
            if state.num_knowing_class != state.num_past_class + state.num_new_class {
                return Err(IlError::Config(format!(
                    "state {}: num_knowing_class {} != past {} + new {}",
                    idx, state.num_knowing_class, state.num_past_class, state.num_new_class
                )));
            }
            if state.num_past_class != prev_knowing {
                return Err(IlError::Config(format!(
                    "state {}: num_past_class {} does not match previous knowing count {}",
                    idx, state.num_past_class, prev_knowing
                )));
            }
            if state.start_epoch == 0 || state.start_epoch > state.end_epoch {
                return Err(IlError::Config(format!(
                    "state {}: invalid epoch range {}..={}",
                    idx, state.start_epoch, state.end_epoch
                )));
            }
            if state.warmup.windows(2).any(|w| w[0].last_epoch >= w[1].last_epoch) {
                return Err(IlError::Config(format!(
                    "state {}: warm-up stages must have increasing last_epoch",
                    idx
                )));
            }
            prev_knowing = state.num_knowing_class;
        }

        Ok(())
    }

    /// Last state of the run; never before the starting state
    pub fn last_state(&self) -> usize {
        self.end_state.max(self.start_state)
    }

    /// Configuration of state `idx`
    pub fn state(&self, idx: usize) -> Result<&StateConfig> {
        self.states
            .get(idx)
            .ok_or_else(|| IlError::Config(format!("no configuration for state {}", idx)))
    }

    /// Epochs trained in state `idx`
    pub fn epoch_range(&self, idx: usize) -> Result<RangeInclusive<usize>> {
        if idx == self.start_state {
            return Ok(self.start_epoch..=self.end_epoch);
        }
        let state = self.state(idx)?;
        Ok(state.start_epoch..=state.end_epoch)
    }

    /// Whether an exemplar replay buffer is kept
    pub fn replay_enabled(&self) -> bool {
        self.sample_num > 0
    }

    /// Replay scheduling used in `epoch`
    pub fn replay_mode(&self, epoch: usize) -> ReplayMode {
        if self.mix_data && epoch > self.mix_data_start {
            ReplayMode::Interleaved
        } else {
            ReplayMode::Dedicated
        }
    }

    /// Path of the importance cache for `state`
    pub fn importance_cache_path(&self, state: usize) -> PathBuf {
        self.ckp_path
            .join(format!("state{}", state))
            .join(format!("{}.bin", self.mas_file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config_is_valid() {
        TrainingConfig::default().validate().unwrap();
    }

    #[test]
    fn test_plan_class_counts() {
        let states = StateConfig::plan(&[10, 2, 2, 2], 5);
        assert_eq!(states.len(), 4);
        assert_eq!(states[0].num_past_class, 0);
        assert_eq!(states[0].num_knowing_class, 10);
        assert_eq!(states[3].num_past_class, 14);
        assert_eq!(states[3].num_knowing_class, 16);
        assert_eq!(states[2].end_epoch, 5);
    }

    #[test]
    fn test_json_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        let config = TrainingConfig {
            agem: true,
            sample_num: 2,
            sample_method: SampleMethod::Custom,
            beta_on_where: BetaTarget::Output,
            ..Default::default()
        };
        config.to_json(&path).unwrap();

        let loaded = TrainingConfig::from_json(&path).unwrap();
        assert!(loaded.agem);
        assert_eq!(loaded.sample_num, 2);
        assert_eq!(loaded.sample_method, SampleMethod::Custom);
        assert_eq!(loaded.beta_on_where, BetaTarget::Output);
        assert_eq!(loaded.states, config.states);
    }

    #[test]
    fn test_unknown_enum_value_rejected() {
        let json = r#"{ "sample_method": "herding" }"#;
        let parsed: std::result::Result<TrainingConfig, _> = serde_json::from_str(json);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_inconsistent_knowing_count_rejected() {
        let mut config = TrainingConfig::default();
        config.states[1].num_knowing_class = 99;
        assert!(matches!(config.validate(), Err(IlError::Config(_))));
    }

    #[test]
    fn test_end_state_clamped() {
        let config = TrainingConfig {
            start_state: 1,
            end_state: 0,
            ..Default::default()
        };
        assert_eq!(config.last_state(), 1);
    }

    #[test]
    fn test_epoch_range_per_state() {
        let config = TrainingConfig {
            states: StateConfig::plan(&[5, 5, 5], 4),
            start_state: 1,
            end_state: 2,
            start_epoch: 3,
            end_epoch: 7,
            ..Default::default()
        };
        assert_eq!(config.epoch_range(1).unwrap(), 3..=7);
        assert_eq!(config.epoch_range(2).unwrap(), 1..=4);
    }

    #[test]
    fn test_replay_mode_selection() {
        let config = TrainingConfig {
            mix_data: true,
            mix_data_start: 2,
            ..Default::default()
        };
        assert_eq!(config.replay_mode(1), ReplayMode::Dedicated);
        assert_eq!(config.replay_mode(2), ReplayMode::Dedicated);
        assert_eq!(config.replay_mode(3), ReplayMode::Interleaved);

        let config = TrainingConfig::default();
        assert_eq!(config.replay_mode(10), ReplayMode::Dedicated);
    }

    #[test]
    fn test_warmup_stage_lookup() {
        let mut state = StateConfig::plan(&[4], 10).remove(0);
        state.warmup = vec![
            WarmupStage::layers(1, &[OUTPUT_LAYER]),
            WarmupStage::layers(3, &["classificationModel", "regressionModel"]),
            WarmupStage::unrestricted(4),
        ];

        let (idx, stage) = state.warmup_stage(1).unwrap();
        assert_eq!(idx, 0);
        assert!(stage.warms_classifier());

        let (idx, stage) = state.warmup_stage(3).unwrap();
        assert_eq!(idx, 1);
        assert!(!stage.warms_classifier());

        assert_eq!(state.warmup_stage(4).unwrap().0, 2);
        assert!(state.warmup_stage(5).is_none());
    }

    #[test]
    fn test_beta_target_groups() {
        assert!(BetaTarget::All.covers(0) && BetaTarget::All.covers(1));
        assert!(BetaTarget::Feature.covers(0) && !BetaTarget::Feature.covers(1));
        assert!(!BetaTarget::Output.covers(0) && BetaTarget::Output.covers(1));
    }
}
