//! Loss terms and the detection-loss seam

use crate::data::Batch;
use crate::model::FrozenModel;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Named terms a detection loss may produce, in report order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LossTerm {
    Classification,
    Regression,
    Distillation,
    FeatureDistillation,
    Enhance,
}

impl LossTerm {
    /// All terms in declared order
    pub const ALL: [LossTerm; 5] = [
        LossTerm::Classification,
        LossTerm::Regression,
        LossTerm::Distillation,
        LossTerm::FeatureDistillation,
        LossTerm::Enhance,
    ];

    /// Short report name
    pub fn name(&self) -> &'static str {
        match self {
            LossTerm::Classification => "cls_loss",
            LossTerm::Regression => "reg_loss",
            LossTerm::Distillation => "dist_loss",
            LossTerm::FeatureDistillation => "feat_loss",
            LossTerm::Enhance => "enhance_loss",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

/// Scalar value per loss term; absent terms are `None`
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LossTerms {
    values: [Option<f32>; 5],
}

impl LossTerms {
    /// No terms
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter
    pub fn with(mut self, term: LossTerm, value: f32) -> Self {
        self.set(term, value);
        self
    }

    /// Set a term
    pub fn set(&mut self, term: LossTerm, value: f32) {
        self.values[term.index()] = Some(value);
    }

    /// Value of a term
    pub fn get(&self, term: LossTerm) -> Option<f32> {
        self.values[term.index()]
    }

    /// Terms in declared order
    pub fn iter(&self) -> impl Iterator<Item = (LossTerm, Option<f32>)> + '_ {
        LossTerm::ALL.iter().map(move |t| (*t, self.get(*t)))
    }

    /// Sum of present terms
    pub fn total(&self) -> f32 {
        self.values.iter().flatten().sum()
    }
}

/// Loss report of one successful iteration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationLosses {
    /// Task loss terms (absent terms reported as zero)
    pub terms: LossTerms,
    /// MAS penalty, when it was applied
    pub importance: Option<f32>,
    /// Total optimized loss
    pub total: f32,
    /// Whether the batch came from the replay buffer
    pub replay: bool,
}

impl fmt::Display for IterationLosses {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = if self.replay { "replay_" } else { "" };
        let mut first = true;
        for (term, value) in self.terms.iter() {
            if !first {
                write!(f, " | ")?;
            }
            first = false;
            write!(f, "{}{}: {:1.4}", prefix, term.name(), value.unwrap_or(0.0))?;
        }
        if let Some(penalty) = self.importance {
            write!(f, " | mas_loss: {:1.4}", penalty)?;
        }
        write!(f, " | total_loss: {:1.4}", self.total)
    }
}

/// Detection loss with an opaque autodiff engine behind it
pub trait DetectionLoss<M> {
    /// Forward pass on `batch`, returning the task loss terms
    fn forward(
        &mut self,
        model: &mut M,
        previous: Option<&FrozenModel<M>>,
        batch: &Batch,
        is_replay: bool,
    ) -> Result<LossTerms>;

    /// Accumulate `scale` times the gradient of the last forward's total into the model.
    ///
    /// With `only` set, backpropagate that single term instead of the total.
    fn backward(&mut self, model: &mut M, scale: f32, only: Option<LossTerm>) -> Result<()>;
}
