//! A-GEM gradient projection
//!
//! Before each training step a reference gradient is computed on a replay
//! mini-batch. If the live gradient points against it (negative dot product),
//! the conflicting component is projected out:
//!
//! ```text
//! g' = g - (g·r / r·r) r      if g·r < 0
//! g' = g                      otherwise
//! ```

use crate::model::DetectionModel;
use crate::params::{self, ParamSet};
use crate::{IlError, Result};

/// Project `live` so it no longer conflicts with `reference`.
///
/// Returns whether a projection was applied.
pub fn project(live: &mut [f32], reference: &[f32]) -> bool {
    let dot = params::dot(live, reference);
    if dot >= 0.0 {
        return false;
    }
    let ref_sq = params::dot(reference, reference);
    if ref_sq <= f32::EPSILON {
        return false;
    }

    let coeff = dot / ref_sq;
    for (g, r) in live.iter_mut().zip(reference) {
        *g -= coeff * r;
    }
    true
}

/// Holds the replay reference gradient between recomputations
#[derive(Debug, Default)]
pub struct GradientProjector {
    reference: Option<Vec<f32>>,
    projections: usize,
}

impl GradientProjector {
    /// Projector with no reference gradient
    pub fn new() -> Self {
        Self::default()
    }

    /// Recompute the reference gradient.
    ///
    /// `backward` runs forward/backward on a replay batch, accumulating into
    /// the model's gradients. The model's previous gradients are restored
    /// afterwards, so the reference never leaks into the live step.
    pub fn recompute_reference<M, F>(&mut self, model: &mut M, backward: F) -> Result<()>
    where
        M: DetectionModel,
        F: FnOnce(&mut M) -> Result<()>,
    {
        let saved = model.gradients().clone();
        model.zero_grad();

        let result = backward(model);
        let reference = params::flatten(model.gradients());
        *model.gradients_mut() = saved;

        result?;
        self.reference = Some(reference);
        Ok(())
    }

    /// Install a reference gradient directly
    pub fn set_reference(&mut self, reference: Vec<f32>) {
        self.reference = Some(reference);
    }

    /// Current reference gradient
    pub fn reference(&self) -> Option<&[f32]> {
        self.reference.as_deref()
    }

    /// Drop the reference gradient
    pub fn clear(&mut self) {
        self.reference = None;
    }

    /// Correct a flat live gradient against the reference
    pub fn correct(&self, live: &mut [f32]) -> Result<bool> {
        let Some(reference) = self.reference.as_deref() else {
            return Ok(false);
        };
        if reference.len() != live.len() {
            return Err(IlError::ShapeMismatch {
                name: "A-GEM reference gradient".into(),
                expected: reference.len(),
                got: live.len(),
            });
        }
        Ok(project(live, reference))
    }

    /// Correct the model's full gradient in place
    pub fn apply(&mut self, grads: &mut ParamSet) -> Result<bool> {
        if self.reference.is_none() {
            return Ok(false);
        }
        let mut flat = params::flatten(grads);
        let projected = self.correct(&mut flat)?;
        if projected {
            params::unflatten_into(grads, &flat)?;
            self.projections += 1;
        }
        Ok(projected)
    }

    /// Steps that needed a projection
    pub fn projections(&self) -> usize {
        self.projections
    }
}
