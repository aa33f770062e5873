//! Checkpoint storage
//!
//! A [`Checkpoint`] is the logical record written after every epoch. The
//! [`CheckpointStore`] trait decides where it lives; [`FsCheckpointStore`] keeps
//! one bincode file per epoch under `{root}/state{k}/epoch{e}.bin`.

use crate::model::DetectionModel;
use crate::params::ParamSet;
use crate::scheduler::EpochScheduler;
use crate::{IlError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Everything saved at the end of an epoch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Incremental state
    pub state: usize,
    /// Epoch within the state
    pub epoch: usize,
    /// Model parameters
    pub params: ParamSet,
    /// Opaque optimizer state
    pub optimizer: Vec<u8>,
    /// Epoch scheduler
    pub scheduler: EpochScheduler,
    /// Recent loss history, oldest first
    pub loss_history: Vec<f32>,
    /// Losses of this epoch (absent for correction checkpoints)
    pub epoch_losses: Option<Vec<f32>>,
}

/// Checkpoint persistence
pub trait CheckpointStore {
    /// Persist a checkpoint
    fn save(&mut self, checkpoint: &Checkpoint) -> Result<()>;

    /// Load the checkpoint of `state` at `epoch`, or its latest epoch when `None`
    fn load(&self, state: usize, epoch: Option<usize>) -> Result<Checkpoint>;

    /// Retention cleanup for `state` as of `epoch`; returns removed checkpoints
    fn delete_old(&mut self, state: usize, epoch: usize) -> Result<usize>;
}

/// Load a checkpoint's parameters into `model`
pub fn load_into<M: DetectionModel>(
    store: &dyn CheckpointStore,
    state: usize,
    epoch: Option<usize>,
    model: &mut M,
) -> Result<Checkpoint> {
    let mut checkpoint = store.load(state, epoch)?;
    let params = std::mem::take(&mut checkpoint.params);
    model.load_parameters(params)?;
    Ok(checkpoint)
}

/// Filesystem checkpoint store
#[derive(Debug, Clone)]
pub struct FsCheckpointStore {
    root: PathBuf,
    keep_last: usize,
}

impl FsCheckpointStore {
    /// Store under `root`, keeping the newest `keep_last` epochs per state
    pub fn new(root: impl Into<PathBuf>, keep_last: usize) -> Self {
        Self {
            root: root.into(),
            keep_last: keep_last.max(1),
        }
    }

    fn state_dir(&self, state: usize) -> PathBuf {
        self.root.join(format!("state{}", state))
    }

    fn path(&self, state: usize, epoch: usize) -> PathBuf {
        self.state_dir(state).join(format!("epoch{}.bin", epoch))
    }

    /// Saved epochs of a state, ascending
    pub fn epochs(&self, state: usize) -> Result<Vec<usize>> {
        let dir = self.state_dir(state);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut epochs = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if let Some(epoch) = parse_epoch(&entry.path()) {
                epochs.push(epoch);
            }
        }
        epochs.sort_unstable();
        Ok(epochs)
    }
}

fn parse_epoch(path: &Path) -> Option<usize> {
    if path.extension()? != "bin" {
        return None;
    }
    path.file_stem()?
        .to_str()?
        .strip_prefix("epoch")?
        .parse()
        .ok()
}

impl CheckpointStore for FsCheckpointStore {
    fn save(&mut self, checkpoint: &Checkpoint) -> Result<()> {
        let path = self.path(checkpoint.state, checkpoint.epoch);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = bincode::serialize(checkpoint)?;
        std::fs::write(&path, data)?;
        debug!("Saved checkpoint {}", path.display());
        Ok(())
    }

    fn load(&self, state: usize, epoch: Option<usize>) -> Result<Checkpoint> {
        let epoch = match epoch {
            Some(epoch) => epoch,
            None => self.epochs(state)?.last().copied().ok_or_else(|| {
                IlError::Checkpoint(format!("no checkpoint saved for state {}", state))
            })?,
        };

        let path = self.path(state, epoch);
        if !path.exists() {
            return Err(IlError::Checkpoint(format!(
                "missing checkpoint {}",
                path.display()
            )));
        }
        let data = std::fs::read(&path)?;
        Ok(bincode::deserialize(&data)?)
    }

    fn delete_old(&mut self, state: usize, epoch: usize) -> Result<usize> {
        let mut removed = 0;
        for saved in self.epochs(state)? {
            if saved + self.keep_last <= epoch {
                std::fs::remove_file(self.path(state, saved))?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!("Removed {} old checkpoints of state {}", removed, state);
        }
        Ok(removed)
    }
}
