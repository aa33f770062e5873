//! Exemplar replay buffer
//!
//! Completed states contribute their images to an eligible pool. A bounded
//! exemplar set is drawn from the pool (per class, or from a named preset) and
//! replayed in later states. Advancing a state only ever adds to the pool.

use crate::config::{SampleMethod, TrainingConfig};
use crate::data::{Dataset, Exemplar};
use crate::{IlError, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

const BUILTIN_PRESETS: &str = include_str!("../presets/sample_presets.json");

/// Versioned image-id presets, keyed by version then per-class count
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SamplePresets {
    versions: BTreeMap<String, BTreeMap<String, Vec<u64>>>,
}

impl SamplePresets {
    /// Presets shipped with the crate
    pub fn builtin() -> Result<Self> {
        Self::from_json(BUILTIN_PRESETS)
    }

    /// Parse presets from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Image ids of a preset
    pub fn get(&self, version: &str, per_num: i64) -> Result<&[u64]> {
        self.versions
            .get(version)
            .and_then(|v| v.get(&per_num.to_string()))
            .map(Vec::as_slice)
            .ok_or(IlError::InvalidSamplePreset { per_num })
    }

    /// Whether a preset exists
    pub fn contains(&self, version: &str, per_num: i64) -> bool {
        self.get(version, per_num).is_ok()
    }
}

/// Buffer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Exemplars per class
    pub per_num: i64,
    /// Selection strategy
    pub method: SampleMethod,
    /// Preset version for custom selection
    pub preset_version: String,
    /// Cap on the selected exemplar set
    pub max_size: Option<usize>,
    /// Random seed
    pub seed: Option<u64>,
}

impl BufferConfig {
    /// Buffer settings of a run
    pub fn from_training(config: &TrainingConfig) -> Self {
        Self {
            per_num: config.sample_num,
            method: config.sample_method,
            preset_version: config.sample_preset_version.clone(),
            max_size: None,
            seed: config.seed,
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            per_num: 1,
            method: SampleMethod::Random,
            preset_version: "v1".into(),
            max_size: None,
            seed: None,
        }
    }
}

/// Replay buffer over previously learned states
#[derive(Debug, Clone)]
pub struct ReplayBuffer {
    /// Configuration
    config: BufferConfig,
    /// Custom presets
    presets: SamplePresets,
    /// Replay candidates from completed states
    eligible: Vec<Exemplar>,
    /// Ids of `eligible`
    eligible_ids: BTreeSet<u64>,
    /// Currently replayed image ids
    selected: Vec<u64>,
    /// States below this one are eligible
    state: usize,
    /// Random number generator
    rng: StdRng,
}

impl ReplayBuffer {
    /// Empty buffer
    pub fn new(config: BufferConfig, presets: SamplePresets) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self {
            config,
            presets,
            eligible: Vec::new(),
            eligible_ids: BTreeSet::new(),
            selected: Vec::new(),
            state: 0,
            rng,
        }
    }

    /// Fill the pool with every state before `current_state` and draw exemplars
    pub fn init(&mut self, dataset: &dyn Dataset, current_state: usize) -> Result<()> {
        for state in 0..current_state {
            self.extend(dataset.exemplars(state));
        }
        self.state = current_state;
        self.resample_configured()
    }

    /// Make a newly completed state's samples eligible and redraw exemplars
    pub fn advance_state(&mut self, completed: Vec<Exemplar>) -> Result<()> {
        self.extend(completed);
        self.state += 1;
        self.resample_configured()
    }

    fn extend(&mut self, exemplars: Vec<Exemplar>) {
        for exemplar in exemplars {
            if self.eligible_ids.insert(exemplar.image_id) {
                self.eligible.push(exemplar);
            }
        }
    }

    fn resample_configured(&mut self) -> Result<()> {
        let per_num = self.config.per_num;
        if self.config.method == SampleMethod::Custom {
            let ids = self
                .presets
                .get(&self.config.preset_version, per_num)?
                .to_vec();
            self.resample(per_num, Some(&ids))
        } else {
            self.resample(per_num, None)
        }
    }

    /// Redraw the exemplar set.
    ///
    /// Explicit ids are used as given, but `count` must name a known preset
    /// of the same length.
    pub fn resample(&mut self, count: i64, explicit_ids: Option<&[u64]>) -> Result<()> {
        let mut selected = match explicit_ids {
            Some(ids) => {
                let preset = self.presets.get(&self.config.preset_version, count)?;
                if preset.len() != ids.len() {
                    return Err(IlError::Config(format!(
                        "preset {} lists {} images, got {} explicit ids",
                        count,
                        preset.len(),
                        ids.len()
                    )));
                }
                ids.to_vec()
            }
            None => self.select_per_class(count)?,
        };

        if let Some(max) = self.config.max_size {
            selected.truncate(max);
        }

        debug!(
            "Replay buffer at state {}: {} exemplars from {} eligible",
            self.state,
            selected.len(),
            self.eligible.len()
        );
        self.selected = selected;
        Ok(())
    }

    fn select_per_class(&mut self, count: i64) -> Result<Vec<u64>> {
        if count <= 0 {
            return Err(IlError::Config(format!(
                "replay sample count must be positive, got {}",
                count
            )));
        }
        let count = count as usize;

        let mut by_class: BTreeMap<u32, Vec<u64>> = BTreeMap::new();
        for exemplar in &self.eligible {
            for class in &exemplar.classes {
                by_class.entry(*class).or_default().push(exemplar.image_id);
            }
        }

        let mut chosen: BTreeSet<u64> = BTreeSet::new();
        for ids in by_class.values_mut() {
            match self.config.method {
                SampleMethod::First => {
                    ids.sort_unstable();
                    chosen.extend(ids.iter().take(count));
                }
                SampleMethod::Random => {
                    chosen.extend(ids.choose_multiple(&mut self.rng, count));
                }
                SampleMethod::Custom => {
                    return Err(IlError::Config(
                        "custom sampling requires explicit image ids".into(),
                    ));
                }
            }
        }

        Ok(chosen.into_iter().collect())
    }

    /// Shuffled batches of exemplar ids for one replay pass
    pub fn batches(&mut self, batch_size: usize) -> Vec<Vec<u64>> {
        let mut ids = self.selected.clone();
        ids.shuffle(&mut self.rng);
        ids.chunks(batch_size.max(1)).map(<[u64]>::to_vec).collect()
    }

    /// Random mini-batch of exemplar ids
    pub fn sample_batch(&mut self, batch_size: usize) -> Vec<u64> {
        self.selected
            .choose_multiple(&mut self.rng, batch_size)
            .copied()
            .collect()
    }

    /// Batches in one replay pass
    pub fn num_batches(&self, batch_size: usize) -> usize {
        self.selected.len().div_ceil(batch_size.max(1))
    }

    /// Ids eligible for replay
    pub fn eligible_ids(&self) -> &BTreeSet<u64> {
        &self.eligible_ids
    }

    /// Currently selected exemplar ids
    pub fn selected(&self) -> &[u64] {
        &self.selected
    }

    /// Selected exemplar count
    pub fn len(&self) -> usize {
        self.selected.len()
    }

    /// Whether nothing is selected
    pub fn is_empty(&self) -> bool {
        self.selected.is_empty()
    }

    /// First state not yet eligible
    pub fn state(&self) -> usize {
        self.state
    }

    /// Get configuration
    pub fn config(&self) -> &BufferConfig {
        &self.config
    }
}
