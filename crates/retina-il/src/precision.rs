//! Dynamic loss scaling for mixed-precision training
//!
//! One scaler lives for the whole run. Per optimizer step the order is fixed:
//! `scale` → backward → `unscale` → clip → `step` → `update` → zero-grad.

use crate::model::DetectionModel;
use crate::optim::Optimizer;
use crate::params::ParamSet;
use crate::Result;
use serde::{Deserialize, Serialize};

/// Scaler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradScalerConfig {
    /// Initial loss scale
    pub init_scale: f32,
    /// Scale multiplier after `growth_interval` clean steps
    pub growth_factor: f32,
    /// Scale multiplier after a step with non-finite gradients
    pub backoff_factor: f32,
    /// Clean steps between growths
    pub growth_interval: usize,
    /// Disabled scalers pass gradients through unchanged
    pub enabled: bool,
}

impl Default for GradScalerConfig {
    fn default() -> Self {
        Self {
            init_scale: 65536.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
            enabled: true,
        }
    }
}

/// Dynamic loss scaler
#[derive(Debug, Clone)]
pub struct GradScaler {
    config: GradScalerConfig,
    scale: f32,
    growth_tracker: usize,
    found_inf: bool,
    unscaled: bool,
    skipped_steps: usize,
}

impl GradScaler {
    /// Create new scaler
    pub fn new(config: GradScalerConfig) -> Self {
        let scale = if config.enabled { config.init_scale } else { 1.0 };
        Self {
            config,
            scale,
            growth_tracker: 0,
            found_inf: false,
            unscaled: false,
            skipped_steps: 0,
        }
    }

    /// Factor the loss is multiplied by before backward
    pub fn scale(&self) -> f32 {
        self.scale
    }

    /// Divide gradients by the current scale and record non-finite values
    pub fn unscale(&mut self, grads: &mut ParamSet) {
        if self.unscaled {
            return;
        }
        let inv = 1.0 / self.scale;
        for grad in grads.values_mut() {
            for g in grad.iter_mut() {
                *g *= inv;
                if !g.is_finite() {
                    self.found_inf = true;
                }
            }
        }
        self.unscaled = true;
    }

    /// Step the optimizer unless the unscaled gradients were non-finite.
    ///
    /// Returns whether the optimizer actually stepped.
    pub fn step<M: DetectionModel>(
        &mut self,
        optimizer: &mut dyn Optimizer<M>,
        model: &mut M,
    ) -> Result<bool> {
        if !self.unscaled {
            self.unscale(model.gradients_mut());
        }
        if self.found_inf {
            self.skipped_steps += 1;
            return Ok(false);
        }
        optimizer.step(model)?;
        Ok(true)
    }

    /// Adjust the scale for the next step
    pub fn update(&mut self) {
        if self.config.enabled {
            if self.found_inf {
                self.scale *= self.config.backoff_factor;
                self.growth_tracker = 0;
            } else {
                self.growth_tracker += 1;
                if self.growth_tracker >= self.config.growth_interval {
                    self.scale *= self.config.growth_factor;
                    self.growth_tracker = 0;
                }
            }
        }
        self.found_inf = false;
        self.unscaled = false;
    }

    /// Forget an iteration that failed between `unscale` and `update`
    pub fn discard_step(&mut self) {
        self.found_inf = false;
        self.unscaled = false;
    }

    /// Steps skipped because of non-finite gradients
    pub fn skipped_steps(&self) -> usize {
        self.skipped_steps
    }
}

impl Default for GradScaler {
    fn default() -> Self {
        Self::new(GradScalerConfig::default())
    }
}
