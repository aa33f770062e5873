//! Running loss history for progress display

use crate::config::LOSS_HISTORY_CAPACITY;
use std::collections::VecDeque;

/// Bounded FIFO of recent scalar losses
#[derive(Debug, Clone)]
pub struct LossHistory {
    entries: VecDeque<f32>,
    capacity: usize,
}

impl LossHistory {
    /// Empty history with the given capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a loss, evicting the oldest when full
    pub fn push(&mut self, loss: f32) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(loss);
    }

    /// Mean of the stored losses (0 when empty)
    pub fn mean(&self) -> f32 {
        if self.entries.is_empty() {
            0.0
        } else {
            self.entries.iter().sum::<f32>() / self.entries.len() as f32
        }
    }

    /// Stored losses, oldest first
    pub fn to_vec(&self) -> Vec<f32> {
        self.entries.iter().copied().collect()
    }

    /// Number of stored losses
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum stored losses
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for LossHistory {
    fn default() -> Self {
        Self::with_capacity(LOSS_HISTORY_CAPACITY)
    }
}
