//! Learning rate scheduling
//!
//! Two factors multiply each parameter group's base learning rate:
//! [`EpochScheduler`] decays it across the epochs of a state, and [`LrWarmup`]
//! ramps it linearly from zero over the first iterations of a state.

use crate::config::LR_WARMUP_ITERS;
use serde::{Deserialize, Serialize};

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Factor reached at the end of the schedule
    pub final_factor: f32,
    /// Epochs the decay spans
    pub total_epochs: usize,
    /// Scheduler type
    pub scheduler_type: SchedulerType,
}

/// Scheduler type
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SchedulerType {
    /// Constant learning rate
    Constant,
    /// Linear decay
    Linear,
    /// Cosine annealing
    Cosine,
    /// Multiply by `gamma` every `every` epochs
    Step { every: usize, gamma: f32 },
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            final_factor: 0.01,
            total_epochs: 10,
            scheduler_type: SchedulerType::Constant,
        }
    }
}

/// Per-epoch learning rate factor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochScheduler {
    /// Configuration
    config: SchedulerConfig,
    /// Completed epochs
    current_epoch: usize,
    /// Current factor
    current_factor: f32,
}

impl EpochScheduler {
    /// Create new scheduler
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            current_epoch: 0,
            current_factor: 1.0,
        }
    }

    /// Advance by one epoch
    pub fn step(&mut self) -> f32 {
        self.current_epoch += 1;
        self.current_factor = self.compute_factor(self.current_epoch);
        self.current_factor
    }

    fn compute_factor(&self, epoch: usize) -> f32 {
        let config = &self.config;
        if config.total_epochs == 0 {
            return 1.0;
        }
        let progress = (epoch as f32 / config.total_epochs as f32).min(1.0);

        match config.scheduler_type {
            SchedulerType::Constant => 1.0,
            SchedulerType::Linear => 1.0 + (config.final_factor - 1.0) * progress,
            SchedulerType::Cosine => {
                let cosine_decay = 0.5 * (1.0 + (std::f32::consts::PI * progress).cos());
                config.final_factor + (1.0 - config.final_factor) * cosine_decay
            }
            SchedulerType::Step { every, gamma } => {
                let num_decays = epoch.checked_div(every).unwrap_or(0);
                gamma.powi(num_decays as i32)
            }
        }
    }

    /// Current factor
    pub fn factor(&self) -> f32 {
        self.current_factor
    }

    /// Completed epochs
    pub fn current_epoch(&self) -> usize {
        self.current_epoch
    }

    /// Restart the schedule (new state)
    pub fn reset(&mut self) {
        self.current_epoch = 0;
        self.current_factor = 1.0;
    }
}

impl Default for EpochScheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

/// Linear ramp from 0 to 1 over the first iterations of epoch 1
#[derive(Debug, Clone, Copy)]
pub struct LrWarmup {
    iters: usize,
}

impl LrWarmup {
    /// Ramp over `iters` iterations
    pub fn new(iters: usize) -> Self {
        Self { iters }
    }

    /// Learning rate factor for iteration `iter` (0-based) of `epoch` (1-based)
    pub fn factor(&self, epoch: usize, iter: usize) -> f32 {
        if epoch == 1 && self.iters > 0 && iter <= self.iters {
            iter as f32 / self.iters as f32
        } else {
            1.0
        }
    }
}

impl Default for LrWarmup {
    fn default() -> Self {
        Self::new(LR_WARMUP_ITERS)
    }
}
