//! Detector model seam
//!
//! The network itself lives outside this crate. The trainer only needs the
//! operations in [`DetectionModel`]: parameter and gradient access, capacity
//! growth, layer freezing and the output-sensitivity gradient used for
//! importance estimation.

use crate::data::Batch;
use crate::params::ParamSet;
use crate::{IlError, Result};

/// Train/eval toggle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelMode {
    /// Training mode
    Train,
    /// Inference mode
    Eval,
}

/// Location of the classification output layer inside the parameter set.
///
/// The output weight is laid out as `num_anchors` consecutive blocks of
/// `num_classes` rows; the bias as `num_anchors * num_classes` scalars.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadLayout {
    /// Parameter name of the output weight
    pub weight: String,
    /// Parameter name of the output bias
    pub bias: String,
    /// Anchors per location
    pub num_anchors: usize,
}

impl HeadLayout {
    /// Zero the gradient rows of the first `num_past` classes in every anchor block.
    ///
    /// Used while the classification head is being warmed for new classes,
    /// so previously learned class weights stay untouched.
    pub fn mask_known_classes(
        &self,
        grads: &mut ParamSet,
        num_classes: usize,
        num_past: usize,
    ) -> Result<()> {
        if num_past == 0 {
            return Ok(());
        }
        let rows = self.num_anchors * num_classes;

        let weight = grads
            .get_mut(&self.weight)
            .ok_or_else(|| IlError::Model(format!("missing gradient for {}", self.weight)))?;
        if rows == 0 || weight.len() % rows != 0 {
            return Err(IlError::ShapeMismatch {
                name: self.weight.clone(),
                expected: rows,
                got: weight.len(),
            });
        }
        let row_len = weight.len() / rows;
        for anchor in 0..self.num_anchors {
            let start = anchor * num_classes * row_len;
            weight[start..start + num_past * row_len].fill(0.0);
        }

        let bias = grads
            .get_mut(&self.bias)
            .ok_or_else(|| IlError::Model(format!("missing gradient for {}", self.bias)))?;
        if bias.len() != rows {
            return Err(IlError::ShapeMismatch {
                name: self.bias.clone(),
                expected: rows,
                got: bias.len(),
            });
        }
        for anchor in 0..self.num_anchors {
            let start = anchor * num_classes;
            bias[start..start + num_past].fill(0.0);
        }

        Ok(())
    }
}

/// Operations the incremental trainer needs from a detector
pub trait DetectionModel {
    /// Number of classes the output layer currently predicts
    fn num_classes(&self) -> usize;

    /// Grow the output layer by `num_new_class`, preserving existing-class weights
    fn expand_capacity(&mut self, num_new_class: usize) -> Result<()>;

    /// Freeze everything except the listed layers
    fn freeze(&mut self, layers: &[String]);

    /// Make every layer trainable
    fn unfreeze_all(&mut self);

    /// Keep batch-norm statistics fixed during training
    fn freeze_batch_norm(&mut self) {}

    /// Switch between train and eval mode
    fn set_mode(&mut self, mode: ModelMode);

    /// Current parameter values
    fn parameters(&self) -> ParamSet;

    /// Replace parameter values (checkpoint restore)
    fn load_parameters(&mut self, params: ParamSet) -> Result<()>;

    /// Accumulated gradients
    fn gradients(&self) -> &ParamSet;

    /// Mutable accumulated gradients
    fn gradients_mut(&mut self) -> &mut ParamSet;

    /// Clear accumulated gradients
    fn zero_grad(&mut self);

    /// Classification output layout, if the model has one
    fn classifier_head(&self) -> Option<HeadLayout>;

    /// Gradient of the squared L2 norm of the model outputs on `batch`.
    ///
    /// Must not touch the accumulated gradients.
    fn output_sensitivity(&mut self, batch: &Batch) -> Result<ParamSet>;
}

/// Builds an empty model with the given class count (previous-state snapshots)
pub type ModelBuilder<M> = Box<dyn Fn(usize) -> Result<M>>;

/// Previous-state snapshot.
///
/// Only shared access is exposed: the snapshot is replaced wholesale on a
/// state transition and never updated in place.
#[derive(Debug)]
pub struct FrozenModel<M> {
    model: M,
    state: usize,
}

impl<M: DetectionModel> FrozenModel<M> {
    /// Freeze `model` as the snapshot of `state`
    pub fn new(mut model: M, state: usize) -> Self {
        model.set_mode(ModelMode::Eval);
        Self { model, state }
    }

    /// State this snapshot was trained in
    pub fn state(&self) -> usize {
        self.state
    }

    /// Shared access to the snapshot
    pub fn model(&self) -> &M {
        &self.model
    }
}
