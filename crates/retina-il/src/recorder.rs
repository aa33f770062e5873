//! Loss recording sinks
//!
//! Recorders only observe; nothing they hold feeds back into training.

use crate::loss::IterationLosses;

/// Sink for iteration and epoch losses
pub trait Recorder {
    /// Record one iteration's losses
    fn add_iter_loss(&mut self, losses: &IterationLosses);

    /// Close the current epoch
    fn record_epoch_loss(&mut self, epoch: usize);

    /// Mark a state transition
    fn next_state(&mut self);

    /// Flush everything at the end of the run
    fn end_write(&mut self);
}

/// Discards everything
#[derive(Debug, Default)]
pub struct NullRecorder;

impl Recorder for NullRecorder {
    fn add_iter_loss(&mut self, _losses: &IterationLosses) {}
    fn record_epoch_loss(&mut self, _epoch: usize) {}
    fn next_state(&mut self) {}
    fn end_write(&mut self) {}
}

/// Mean losses of one epoch
#[derive(Debug, Clone, PartialEq)]
pub struct EpochRecord {
    pub state: usize,
    pub epoch: usize,
    pub iterations: usize,
    pub mean_total: f32,
}

/// Keeps epoch summaries in memory
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    state: usize,
    pending: Vec<f32>,
    epochs: Vec<EpochRecord>,
    finished: bool,
}

impl MemoryRecorder {
    /// Empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Closed epochs
    pub fn epochs(&self) -> &[EpochRecord] {
        &self.epochs
    }

    /// Whether `end_write` was called
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl Recorder for MemoryRecorder {
    fn add_iter_loss(&mut self, losses: &IterationLosses) {
        self.pending.push(losses.total);
    }

    fn record_epoch_loss(&mut self, epoch: usize) {
        let iterations = self.pending.len();
        let mean_total = if iterations == 0 {
            0.0
        } else {
            self.pending.iter().sum::<f32>() / iterations as f32
        };
        self.epochs.push(EpochRecord {
            state: self.state,
            epoch,
            iterations,
            mean_total,
        });
        self.pending.clear();
    }

    fn next_state(&mut self) {
        self.state += 1;
    }

    fn end_write(&mut self) {
        self.finished = true;
    }
}
