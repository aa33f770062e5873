//! Memory Aware Synapses (MAS) importance regularization
//!
//! Importance of a parameter is estimated from the squared gradient of the
//! model's output norm, accumulated over one pass of the training data and
//! averaged. The drift penalty is `Σ importance · (θ - θ_ref)² · ratio`.
//!
//! Estimates are cached per state, so a resumed run reuses them instead of
//! recomputing.

use crate::data::Batch;
use crate::model::DetectionModel;
use crate::params::ParamSet;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

/// Importance of one parameter tensor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamImportance {
    /// Parameter name
    pub name: String,
    /// Per-element importance (non-negative)
    pub importance: Vec<f32>,
    /// Parameter values the importance was estimated at
    pub reference: Vec<f32>,
}

impl ParamImportance {
    /// Zero importance at `reference`
    pub fn new(name: impl Into<String>, reference: Vec<f32>) -> Self {
        let n = reference.len();
        Self {
            name: name.into(),
            importance: vec![0.0; n],
            reference,
        }
    }

    /// Accumulate a squared gradient sample
    pub fn accumulate(&mut self, gradient: &[f32]) {
        if gradient.len() != self.importance.len() {
            return;
        }
        for (w, g) in self.importance.iter_mut().zip(gradient) {
            *w += g * g;
        }
    }

    /// Average by sample count
    pub fn normalize(&mut self, sample_count: usize) {
        if sample_count > 0 {
            let scale = 1.0 / sample_count as f32;
            for w in &mut self.importance {
                *w *= scale;
            }
        }
    }

    /// Drift penalty against `reference` (or the stored reference)
    pub fn penalty(&self, current: &[f32], reference: Option<&[f32]>, ratio: f32) -> f32 {
        let reference = reference.unwrap_or(&self.reference);
        if current.len() != self.importance.len() || reference.len() != self.importance.len() {
            return 0.0;
        }

        let mut penalty = 0.0;
        for ((w, r), c) in self.importance.iter().zip(reference).zip(current) {
            let diff = c - r;
            penalty += w * diff * diff;
        }

        penalty * ratio
    }

    /// Gradient of [`penalty`](Self::penalty) with respect to `current`
    pub fn gradient(&self, current: &[f32], reference: Option<&[f32]>, ratio: f32) -> Option<Vec<f32>> {
        let reference = reference.unwrap_or(&self.reference);
        if current.len() != self.importance.len() || reference.len() != self.importance.len() {
            return None;
        }

        Some(
            current
                .iter()
                .zip(reference)
                .zip(&self.importance)
                .map(|((c, r), w)| 2.0 * ratio * w * (c - r))
                .collect(),
        )
    }
}

/// Where the active importance came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportanceSource {
    /// Loaded from the state cache
    Cache,
    /// Estimated from the data and written to the cache
    Computed,
}

#[derive(Serialize, Deserialize)]
struct SavedImportance {
    state: usize,
    sample_count: usize,
    params: BTreeMap<String, ParamImportance>,
}

/// MAS regularizer
#[derive(Debug, Default)]
pub struct ImportanceRegularizer {
    /// Importance per parameter
    params: BTreeMap<String, ParamImportance>,
    /// State the importance belongs to
    state: Option<usize>,
    /// Batches the estimate averaged over
    sample_count: usize,
}

impl ImportanceRegularizer {
    /// Regularizer with no importance loaded
    pub fn new() -> Self {
        Self::default()
    }

    /// Load importance for `state` from `path`, or estimate and persist it.
    pub fn load_or_compute<M, I>(
        &mut self,
        state: usize,
        path: &Path,
        model: &mut M,
        batches: I,
    ) -> Result<ImportanceSource>
    where
        M: DetectionModel,
        I: IntoIterator<Item = Result<Batch>>,
    {
        if self.load(path)? {
            info!("Loaded MAS importance for state {} from {}", state, path.display());
            return Ok(ImportanceSource::Cache);
        }

        debug!("No MAS cache at {}, computing importance", path.display());
        self.compute(state, model, batches)?;
        self.save(path)?;
        info!(
            "Computed MAS importance for state {} over {} batches ({} params)",
            state,
            self.sample_count,
            self.total_params()
        );
        Ok(ImportanceSource::Computed)
    }

    /// Estimate importance over one pass of `batches`
    pub fn compute<M, I>(&mut self, state: usize, model: &mut M, batches: I) -> Result<()>
    where
        M: DetectionModel,
        I: IntoIterator<Item = Result<Batch>>,
    {
        let mut params: BTreeMap<String, ParamImportance> = model
            .parameters()
            .into_iter()
            .map(|(name, values)| (name.clone(), ParamImportance::new(name, values)))
            .collect();

        let mut sample_count = 0;
        for batch in batches {
            let gradients = model.output_sensitivity(&batch?)?;
            for (name, gradient) in &gradients {
                if let Some(entry) = params.get_mut(name) {
                    entry.accumulate(gradient);
                }
            }
            sample_count += 1;
        }

        for entry in params.values_mut() {
            entry.normalize(sample_count);
        }

        self.params = params;
        self.state = Some(state);
        self.sample_count = sample_count;
        Ok(())
    }

    /// Load a cached estimate; `Ok(false)` when no cache exists
    pub fn load(&mut self, path: &Path) -> Result<bool> {
        if !path.exists() {
            return Ok(false);
        }
        let data = std::fs::read(path)?;
        let saved: SavedImportance = bincode::deserialize(&data)?;

        self.params = saved.params;
        self.state = Some(saved.state);
        self.sample_count = saved.sample_count;
        Ok(true)
    }

    /// Persist the current estimate
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let saved = SavedImportance {
            state: self.state.unwrap_or_default(),
            sample_count: self.sample_count,
            params: self.params.clone(),
        };
        let data = bincode::serialize(&saved)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Total drift penalty; zero when no importance is loaded.
    ///
    /// Tensors whose shape changed since estimation (a grown output layer)
    /// contribute nothing.
    pub fn penalty(&self, current: &ParamSet, reference: Option<&ParamSet>, ratio: f32) -> f32 {
        let mut total = 0.0;
        for (name, values) in current {
            if let Some(entry) = self.params.get(name) {
                let reference = reference.and_then(|r| r.get(name)).map(Vec::as_slice);
                total += entry.penalty(values, reference, ratio);
            }
        }
        total
    }

    /// Gradient of the penalty for every tensor it covers
    pub fn penalty_gradient(
        &self,
        current: &ParamSet,
        reference: Option<&ParamSet>,
        ratio: f32,
    ) -> ParamSet {
        let mut gradients = ParamSet::new();
        for (name, values) in current {
            if let Some(entry) = self.params.get(name) {
                let reference = reference.and_then(|r| r.get(name)).map(Vec::as_slice);
                if let Some(gradient) = entry.gradient(values, reference, ratio) {
                    gradients.insert(name.clone(), gradient);
                }
            }
        }
        gradients
    }

    /// Whether any importance is loaded
    pub fn is_loaded(&self) -> bool {
        !self.params.is_empty()
    }

    /// State of the loaded importance
    pub fn state(&self) -> Option<usize> {
        self.state
    }

    /// Importance for one parameter
    pub fn get(&self, name: &str) -> Option<&ParamImportance> {
        self.params.get(name)
    }

    /// Total scalars tracked
    pub fn total_params(&self) -> usize {
        self.params.values().map(|p| p.importance.len()).sum()
    }
}
