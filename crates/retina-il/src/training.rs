//! Multi-state training loop
//!
//! [`TrainingLoop::run`] walks every state from `start_state` to the last
//! state. Each epoch applies the warm-up stage, trains on every batch of the
//! current data, optionally replays exemplars (interleaved or as a dedicated
//! pass), steps the epoch scheduler and saves a checkpoint. Between states it
//! calls [`IncrementalTrainer::next_state`]; after the final state it runs
//! bias correction once.
//!
//! One optimizer step follows a fixed order:
//!
//! 1. forward, giving the task loss terms
//! 2. skip the step when the task loss is exactly zero
//! 3. add the MAS penalty (current data only)
//! 4. scaled backward, unscale, clip to [`GRAD_CLIP_NORM`]
//! 5. mask known-class rows while the classifier warms up
//! 6. A-GEM projection (current data only)
//! 7. optimizer step, scaler update, zero-grad, loss history

use crate::buffer::ReplayBuffer;
use crate::config::{ReplayMode, GRAD_CLIP_NORM, RETENTION_INTERVAL};
use crate::data::{Batch, Dataset};
use crate::loss::{DetectionLoss, IterationLosses, LossTerm};
use crate::model::{DetectionModel, ModelMode};
use crate::optim::HyperOverrides;
use crate::params;
use crate::precision::GradScaler;
use crate::recorder::Recorder;
use crate::scheduler::LrWarmup;
use crate::trainer::IncrementalTrainer;
use crate::Result;
use rand::rngs::StdRng;
use rand::seq::index;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Result of one training iteration
#[derive(Debug, Clone)]
pub enum IterationOutcome {
    /// Gradients were applied (or the scaler skipped a non-finite step)
    Stepped(IterationLosses),
    /// The batch had no valid targets
    SkippedEmptyLoss,
    /// A recoverable error was logged and the batch dropped
    TransientFailure(String),
}

/// Bias correction run once after the final state
pub trait BiasCorrection<M> {
    /// Correct the output bias of `model` using the exemplar buffer
    fn run(&mut self, model: &mut M, replay: Option<&ReplayBuffer>, dataset: &dyn Dataset)
        -> Result<()>;
}

/// How many replay batches follow each training iteration in one epoch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplaySchedule {
    counts: Vec<usize>,
}

impl ReplaySchedule {
    /// Spread `replay_iters` replay batches over `train_iters` iterations.
    ///
    /// Every iteration gets `replay_iters / train_iters`; the remainder goes
    /// to distinct iterations chosen at random.
    pub fn build(train_iters: usize, replay_iters: usize, rng: &mut StdRng) -> Self {
        if train_iters == 0 {
            return Self { counts: Vec::new() };
        }
        let mut counts = vec![replay_iters / train_iters; train_iters];
        for iter in index::sample(rng, train_iters, replay_iters % train_iters) {
            counts[iter] += 1;
        }
        Self { counts }
    }

    /// Replay batches after iteration `iter`
    pub fn at(&self, iter: usize) -> usize {
        self.counts.get(iter).copied().unwrap_or(0)
    }

    /// Per-iteration counts
    pub fn counts(&self) -> &[usize] {
        &self.counts
    }

    /// Replay batches in the whole epoch
    pub fn total(&self) -> usize {
        self.counts.iter().sum()
    }
}

/// Counters of one run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub states_trained: usize,
    pub transitions: usize,
    pub epochs: usize,
    pub optimizer_steps: usize,
    pub replay_steps: usize,
    pub skipped_empty: usize,
    pub transient_failures: usize,
    pub correction_rounds: usize,
}

/// Drives an [`IncrementalTrainer`] through all configured states
pub struct TrainingLoop<M> {
    loss: Box<dyn DetectionLoss<M>>,
    recorder: Box<dyn Recorder>,
    bias_correction: Option<Box<dyn BiasCorrection<M>>>,
    scaler: GradScaler,
    lr_warmup: LrWarmup,
    summary: RunSummary,
}

impl<M: DetectionModel> TrainingLoop<M> {
    /// Loop with the given loss and recorder
    pub fn new(loss: Box<dyn DetectionLoss<M>>, recorder: Box<dyn Recorder>) -> Self {
        Self {
            loss,
            recorder,
            bias_correction: None,
            scaler: GradScaler::default(),
            lr_warmup: LrWarmup::default(),
            summary: RunSummary::default(),
        }
    }

    /// Bias correction for the final state
    pub fn with_bias_correction(mut self, correction: Box<dyn BiasCorrection<M>>) -> Self {
        self.bias_correction = Some(correction);
        self
    }

    /// Replace the loss scaler
    pub fn with_scaler(mut self, scaler: GradScaler) -> Self {
        self.scaler = scaler;
        self
    }

    /// Replace the first-epoch learning rate ramp
    pub fn with_lr_warmup(mut self, warmup: LrWarmup) -> Self {
        self.lr_warmup = warmup;
        self
    }

    /// Counters so far
    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    /// Loss scaler
    pub fn scaler(&self) -> &GradScaler {
        &self.scaler
    }

    /// Train every state from the trainer's current state to the last one
    pub fn run(&mut self, trainer: &mut IncrementalTrainer<M>) -> Result<RunSummary> {
        let last_state = trainer.config.last_state();
        let overrides = HyperOverrides::capture(&*trainer.optimizer);

        for state in trainer.current_state()..=last_state {
            let epochs = trainer.config.epoch_range(state)?;
            info!("State: {}", state);
            info!("Train epoch from {} to {}", epochs.start(), epochs.end());
            info!("Number of training images: {}", trainer.dataset.len());
            info!("Number of training iterations: {}", trainer.loader.len());

            let mut epoch_secs = Vec::new();
            for epoch in epochs.clone() {
                let started = Instant::now();
                self.train_epoch(trainer, &overrides, epoch)?;
                epoch_secs.push(started.elapsed().as_secs_f32());

                let mean = epoch_secs.iter().sum::<f32>() / epoch_secs.len() as f32;
                let remaining = (mean * epochs.end().saturating_sub(epoch) as f32) as u64;
                info!(
                    "Estimated Training Time for this state is {}m{}s",
                    remaining / 60,
                    remaining % 60
                );
            }
            self.summary.states_trained += 1;

            if trainer.config.final_correction {
                self.final_correction(trainer, &overrides, *epochs.end())?;
            }

            if state == last_state {
                if trainer.config.bic {
                    if let Some(correction) = self.bias_correction.as_mut() {
                        info!("Start bias correction");
                        correction.run(
                            &mut trainer.model,
                            trainer.replay.as_ref(),
                            &*trainer.dataset,
                        )?;
                    }
                }
            } else {
                trainer.next_state()?;
                self.summary.transitions += 1;
                if trainer.config.record {
                    self.recorder.next_state();
                }
            }
        }

        self.recorder.end_write();
        Ok(self.summary.clone())
    }

    fn train_epoch(
        &mut self,
        trainer: &mut IncrementalTrainer<M>,
        overrides: &HyperOverrides,
        epoch: usize,
    ) -> Result<()> {
        trainer.model.set_mode(ModelMode::Train);
        if let Some(stage) = trainer.warm_up(epoch)? {
            debug!("Warm-up stage {} active in epoch {}", stage, epoch);
        }
        trainer.model.freeze_batch_norm();

        let batch_size = trainer.config.batch_size;
        let replay_active =
            trainer.replay.is_some() && !trainer.config.agem && !trainer.warming_classifier();
        let mode = trainer.config.replay_mode(epoch);
        let replay_beta = Some((trainer.config.beta_on_replay, trainer.config.beta_on_where));

        let plan = trainer.loader.epoch(&mut trainer.rng);
        let mut interleaved = None;
        if replay_active && mode == ReplayMode::Interleaved {
            if let Some(buffer) = trainer.replay.as_mut() {
                let batches = buffer.batches(batch_size);
                let schedule = ReplaySchedule::build(plan.len(), batches.len(), &mut trainer.rng);
                interleaved = Some((schedule, batches.into_iter()));
            }
        }

        let mut epoch_losses = Vec::with_capacity(plan.len());
        for (iter, indices) in plan.iter().enumerate() {
            let lr_factor = self.lr_warmup.factor(epoch, iter) * trainer.scheduler.factor();
            HyperOverrides::apply(&mut *trainer.optimizer, &overrides.compute(lr_factor, None));

            let started = Instant::now();
            let result = self.main_iteration(trainer, indices);
            let outcome = self.settle(trainer, result)?;
            self.report(trainer, &outcome, epoch, iter, started, &mut epoch_losses);

            if let Some((schedule, replay_batches)) = interleaved.as_mut() {
                let count = schedule.at(iter);
                if count == 0 {
                    continue;
                }
                let table = overrides.compute(lr_factor, replay_beta);
                HyperOverrides::apply(&mut *trainer.optimizer, &table);
                for ids in replay_batches.by_ref().take(count) {
                    let started = Instant::now();
                    let result = self.replay_iteration(trainer, &ids);
                    let outcome = self.settle(trainer, result)?;
                    self.report(trainer, &outcome, epoch, iter, started, &mut epoch_losses);
                }
                overrides.restore(&mut *trainer.optimizer);
            }
        }

        if replay_active && mode == ReplayMode::Dedicated {
            info!("Start Replay!");
            let batches = match trainer.replay.as_mut() {
                Some(buffer) => buffer.batches(batch_size),
                None => Vec::new(),
            };
            let table = overrides.compute(trainer.scheduler.factor(), replay_beta);
            HyperOverrides::apply(&mut *trainer.optimizer, &table);
            for (iter, ids) in batches.iter().enumerate() {
                let started = Instant::now();
                let result = self.replay_iteration(trainer, ids);
                let outcome = self.settle(trainer, result)?;
                self.report(trainer, &outcome, epoch, iter, started, &mut epoch_losses);
            }
            overrides.restore(&mut *trainer.optimizer);
        }

        trainer.scheduler.step();
        trainer.save_checkpoint(Some(&epoch_losses), epoch)?;
        if epoch % RETENTION_INTERVAL == 0 {
            trainer.delete_old_checkpoints(epoch)?;
        }
        self.recorder.record_epoch_loss(epoch);
        self.summary.epochs += 1;
        Ok(())
    }

    fn main_iteration(
        &mut self,
        trainer: &mut IncrementalTrainer<M>,
        indices: &[usize],
    ) -> Result<IterationOutcome> {
        if trainer.projector.is_some() {
            self.refresh_reference(trainer)?;
        }
        let batch = trainer.dataset.get_batch(indices)?;
        self.train_step_inner(trainer, &batch, false)
    }

    fn replay_iteration(
        &mut self,
        trainer: &mut IncrementalTrainer<M>,
        image_ids: &[u64],
    ) -> Result<IterationOutcome> {
        let batch = trainer.dataset.load_images(image_ids)?;
        self.train_step_inner(trainer, &batch, true)
    }

    /// Recompute the A-GEM reference gradient on a fresh replay batch
    fn refresh_reference(&mut self, trainer: &mut IncrementalTrainer<M>) -> Result<()> {
        let batch_size = trainer.config.batch_size;
        let ids = match trainer.replay.as_mut() {
            Some(buffer) if !buffer.is_empty() => buffer.sample_batch(batch_size),
            _ => return Ok(()),
        };
        let batch = trainer.dataset.load_images(&ids)?;

        let loss = &mut self.loss;
        let previous = trainer.previous.as_ref();
        if let Some(projector) = trainer.projector.as_mut() {
            projector.recompute_reference(&mut trainer.model, |model| {
                loss.forward(model, previous, &batch, true)?;
                loss.backward(model, 1.0, None)
            })?;
        }
        Ok(())
    }

    /// One optimizer step on `batch`, with the run's error policy applied
    pub fn train_step(
        &mut self,
        trainer: &mut IncrementalTrainer<M>,
        batch: &Batch,
        is_replay: bool,
    ) -> Result<IterationOutcome> {
        let result = self.train_step_inner(trainer, batch, is_replay);
        self.settle(trainer, result)
    }

    fn train_step_inner(
        &mut self,
        trainer: &mut IncrementalTrainer<M>,
        batch: &Batch,
        is_replay: bool,
    ) -> Result<IterationOutcome> {
        let terms = self
            .loss
            .forward(&mut trainer.model, trainer.previous.as_ref(), batch, is_replay)?;
        let task_loss = terms.total();
        if task_loss == 0.0 {
            return Ok(IterationOutcome::SkippedEmptyLoss);
        }

        let importance = if is_replay {
            None
        } else {
            trainer.importance_penalty()
        };
        let total = task_loss + importance.as_ref().map_or(0.0, |(penalty, _)| *penalty);

        let scale = self.scaler.scale();
        self.loss.backward(&mut trainer.model, scale, None)?;
        if let Some((_, gradient)) = importance.as_ref() {
            params::add_scaled(trainer.model.gradients_mut(), gradient, scale);
        }
        self.scaler.unscale(trainer.model.gradients_mut());
        params::clip_grad_norm(trainer.model.gradients_mut(), GRAD_CLIP_NORM);

        if trainer.warming_classifier() {
            let state = trainer.state_config()?;
            let (known, past) = (state.num_knowing_class, state.num_past_class);
            if let Some(head) = trainer.model.classifier_head() {
                head.mask_known_classes(trainer.model.gradients_mut(), known, past)?;
            }
        }

        if !is_replay {
            if let Some(projector) = trainer.projector.as_mut() {
                projector.apply(trainer.model.gradients_mut())?;
            }
        }

        let stepped = self.scaler.step(&mut *trainer.optimizer, &mut trainer.model)?;
        self.scaler.update();
        trainer.model.zero_grad();
        trainer.loss_history.push(total);

        if stepped {
            self.summary.optimizer_steps += 1;
            if is_replay {
                self.summary.replay_steps += 1;
            }
        }

        Ok(IterationOutcome::Stepped(IterationLosses {
            terms,
            importance: importance.map(|(penalty, _)| penalty),
            total,
            replay: is_replay,
        }))
    }

    /// Apply the error policy: debug runs propagate, others drop the batch
    fn settle(
        &mut self,
        trainer: &mut IncrementalTrainer<M>,
        result: Result<IterationOutcome>,
    ) -> Result<IterationOutcome> {
        match result {
            Ok(IterationOutcome::SkippedEmptyLoss) => {
                self.summary.skipped_empty += 1;
                Ok(IterationOutcome::SkippedEmptyLoss)
            }
            Ok(outcome) => Ok(outcome),
            Err(err) if !trainer.config.debug && err.is_transient() => {
                warn!("Skipping batch after error: {}", err);
                trainer.model.zero_grad();
                self.scaler.discard_step();
                self.summary.transient_failures += 1;
                Ok(IterationOutcome::TransientFailure(err.to_string()))
            }
            Err(err) => Err(err),
        }
    }

    fn report(
        &mut self,
        trainer: &IncrementalTrainer<M>,
        outcome: &IterationOutcome,
        epoch: usize,
        iter: usize,
        started: Instant,
        epoch_losses: &mut Vec<f32>,
    ) {
        let IterationOutcome::Stepped(losses) = outcome else {
            return;
        };
        epoch_losses.push(losses.total);
        self.recorder.add_iter_loss(losses);
        info!(
            "{}Epoch: {:2} | Iter: {:3} | {} | Running loss: {:1.5} | Spend Time: {:1.2}s",
            if losses.replay { "Replay | " } else { "" },
            epoch,
            iter,
            losses,
            trainer.loss_history.mean(),
            started.elapsed().as_secs_f32()
        );
    }

    /// Repeat enhance-loss steps over the exemplars until no batch reports one.
    ///
    /// Runs on the base hyperparameter table, whatever the last epoch left.
    fn final_correction(
        &mut self,
        trainer: &mut IncrementalTrainer<M>,
        overrides: &HyperOverrides,
        epoch: usize,
    ) -> Result<()> {
        let config = &trainer.config;
        if !config.enhance_error || config.agem || trainer.replay.is_none() {
            return Ok(());
        }
        info!("Start Correction!");
        overrides.restore(&mut *trainer.optimizer);

        let batch_size = config.batch_size;
        let max_rounds = config.max_correction_rounds;
        let mut rounds = 0;
        loop {
            if rounds >= max_rounds {
                warn!("Correction stopped after {} rounds", rounds);
                break;
            }
            rounds += 1;

            let batches = match trainer.replay.as_mut() {
                Some(buffer) => buffer.batches(batch_size),
                None => Vec::new(),
            };
            let mut corrected = false;
            for ids in &batches {
                let batch = trainer.dataset.load_images(ids)?;
                let terms = self.loss.forward(
                    &mut trainer.model,
                    trainer.previous.as_ref(),
                    &batch,
                    true,
                )?;
                let enhance = terms.get(LossTerm::Enhance).unwrap_or(0.0);
                if enhance == 0.0 {
                    continue;
                }
                info!("Enhance loss : {:.2}", enhance);
                self.loss
                    .backward(&mut trainer.model, 1.0, Some(LossTerm::Enhance))?;
                trainer.optimizer.step(&mut trainer.model)?;
                trainer.model.zero_grad();
                corrected = true;
            }
            if !corrected {
                break;
            }
        }

        self.summary.correction_rounds += rounds;
        trainer.save_checkpoint(None, epoch)
    }
}
