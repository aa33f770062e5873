//! Optimizer seam and per-group hyperparameter overrides
//!
//! The training loop never edits optimizer groups piecemeal. Each iteration it
//! computes a full [`GroupHyper`] table from the captured base values, the
//! learning-rate factors and the replay momentum override, applies it in one
//! go, and restores the base table when a replay section ends.

use crate::config::BetaTarget;
use crate::Result;
use serde::{Deserialize, Serialize};

/// Default Adam betas
pub const DEFAULT_BETAS: (f32, f32) = (0.9, 0.999);

/// Hyperparameters of one optimizer parameter group
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GroupHyper {
    /// Learning rate
    pub lr: f32,
    /// Adam moment coefficients
    pub betas: (f32, f32),
}

impl GroupHyper {
    /// Group with default betas
    pub fn new(lr: f32) -> Self {
        Self {
            lr,
            betas: DEFAULT_BETAS,
        }
    }
}

/// Gradient-descent engine with parameter groups.
///
/// Group 0 holds the feature extractor, group 1 the output heads.
pub trait Optimizer<M> {
    /// Number of parameter groups
    fn num_groups(&self) -> usize;

    /// Hyperparameters of a group
    fn hyper(&self, group: usize) -> GroupHyper;

    /// Replace hyperparameters of a group
    fn set_hyper(&mut self, group: usize, hyper: GroupHyper);

    /// Apply the model's accumulated gradients
    fn step(&mut self, model: &mut M) -> Result<()>;

    /// Serialized optimizer state for checkpoints
    fn state_bytes(&self) -> Result<Vec<u8>>;
}

/// Base group table plus the rules that derive per-iteration overrides
#[derive(Debug, Clone, PartialEq)]
pub struct HyperOverrides {
    base: Vec<GroupHyper>,
}

impl HyperOverrides {
    /// Capture the optimizer's current groups as the base table
    pub fn capture<M>(optimizer: &dyn Optimizer<M>) -> Self {
        let base = (0..optimizer.num_groups())
            .map(|group| optimizer.hyper(group))
            .collect();
        Self { base }
    }

    /// Base table
    pub fn base(&self) -> &[GroupHyper] {
        &self.base
    }

    /// Table for one iteration.
    ///
    /// Every group's learning rate is scaled by `lr_factor`; groups covered by
    /// `replay_beta` get its first-moment beta.
    pub fn compute(&self, lr_factor: f32, replay_beta: Option<(f32, BetaTarget)>) -> Vec<GroupHyper> {
        self.base
            .iter()
            .enumerate()
            .map(|(group, base)| {
                let betas = match replay_beta {
                    Some((beta, target)) if target.covers(group) => (beta, base.betas.1),
                    _ => base.betas,
                };
                GroupHyper {
                    lr: base.lr * lr_factor,
                    betas,
                }
            })
            .collect()
    }

    /// Apply a full table
    pub fn apply<M>(optimizer: &mut dyn Optimizer<M>, table: &[GroupHyper]) {
        for (group, hyper) in table.iter().enumerate() {
            optimizer.set_hyper(group, *hyper);
        }
    }

    /// Put the base table back
    pub fn restore<M>(&self, optimizer: &mut dyn Optimizer<M>) {
        Self::apply(optimizer, &self.base);
    }
}
