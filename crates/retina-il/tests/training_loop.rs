//! End-to-end runs of the training loop over the mock detector.

mod common;

use common::{
    config, seed_checkpoint, IterationLog, LossTally, MemoryCheckpointStore, MockDataset, MockLoss,
    MockModel, MockOptimizer,
};
use retina_il::{
    Batch, BetaTarget, BiasCorrection, Dataset, DetectionModel, EpochScheduler, GroupHyper,
    IlError, IncrementalTrainer, IterationOutcome, NullRecorder, Optimizer, Recorder,
    ReplayBuffer, TrainerParts, TrainingConfig, TrainingLoop, WarmupStage, DEFAULT_BETAS,
};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use tempfile::{tempdir, TempDir};

struct Harness {
    trainer: IncrementalTrainer<MockModel>,
    tally: Rc<LossTally>,
    steps: Rc<Cell<usize>>,
    lr_log: Rc<RefCell<Vec<f32>>>,
    hyper_log: Rc<RefCell<Vec<Vec<GroupHyper>>>>,
    store: MemoryCheckpointStore,
    _dir: TempDir,
}

impl Harness {
    fn new(
        classes: &[usize],
        epochs: usize,
        images: usize,
        tweak: impl FnOnce(&mut TrainingConfig),
    ) -> Self {
        Self::with_dataset(classes, epochs, images, tweak, |_| {})
    }

    fn with_dataset(
        classes: &[usize],
        epochs: usize,
        images: usize,
        tweak: impl FnOnce(&mut TrainingConfig),
        dataset_tweak: impl FnOnce(&mut MockDataset),
    ) -> Self {
        let dir = tempdir().unwrap();
        let mut cfg = config(classes, epochs, dir.path());
        tweak(&mut cfg);

        let store = MemoryCheckpointStore::default();
        let start = cfg.start_state;
        if start > 0 {
            seed_checkpoint(&store, start - 1, cfg.states[start - 1].num_knowing_class);
        }

        let mut dataset = MockDataset::new(images, classes, start);
        dataset_tweak(&mut dataset);

        let optimizer = MockOptimizer::new(0.5);
        let steps = optimizer.steps.clone();
        let lr_log = optimizer.lr_log.clone();
        let hyper_log = optimizer.hyper_log.clone();

        let trainer = IncrementalTrainer::initialize(
            cfg.clone(),
            TrainerParts {
                model: MockModel::new(cfg.states[start].num_knowing_class),
                optimizer: Box::new(optimizer),
                scheduler: EpochScheduler::default(),
                dataset: Box::new(dataset),
                checkpoints: Box::new(store.clone()),
                model_builder: Box::new(|classes| Ok(MockModel::new(classes))),
            },
        )
        .unwrap();

        Self {
            trainer,
            tally: Rc::new(LossTally::default()),
            steps,
            lr_log,
            hyper_log,
            store,
            _dir: dir,
        }
    }

    fn training_loop(&self, fail_on: &[usize], enhance_calls: usize) -> TrainingLoop<MockModel> {
        self.recording_loop(fail_on, enhance_calls, Box::new(NullRecorder))
    }

    fn recording_loop(
        &self,
        fail_on: &[usize],
        enhance_calls: usize,
        recorder: Box<dyn Recorder>,
    ) -> TrainingLoop<MockModel> {
        let mut loss = MockLoss::new(self.tally.clone());
        loss.fail_on = fail_on.iter().copied().collect();
        loss.enhance_calls = enhance_calls;
        TrainingLoop::new(Box::new(loss), recorder)
    }
}

#[test]
fn test_run_walks_every_state() {
    let mut h = Harness::new(&[2, 2, 2, 2], 2, 4, |cfg| {
        cfg.start_state = 1;
        cfg.end_state = 3;
        cfg.sample_num = 1;
        cfg.mas = true;
    });
    let mut training = h.training_loop(&[], 0);

    let summary = training.run(&mut h.trainer).unwrap();

    assert_eq!(summary.states_trained, 3);
    assert_eq!(summary.transitions, 2);
    assert_eq!(summary.epochs, 6);
    assert_eq!(h.trainer.current_state(), 3);
    assert_eq!(h.trainer.model().num_classes(), 8);

    // one exemplar per learned class, two per batch
    assert_eq!(summary.replay_steps, 2 * (1 + 2 + 3));
    assert_eq!(summary.optimizer_steps, 6 * 2 + summary.replay_steps);
    assert_eq!(h.steps.get(), summary.optimizer_steps);
    assert!(h.tally.saw_previous.get());

    let saved = h.store.saved.borrow();
    for state in 1..=3 {
        for epoch in 1..=2 {
            assert!(saved.contains_key(&(state, epoch)), "missing {state}/{epoch}");
        }
    }
}

#[test]
fn test_empty_batches_never_step() {
    let mut h = Harness::with_dataset(&[2], 1, 4, |_| {}, |dataset| {
        dataset.empty = (0..4).collect();
    });
    let mut training = h.training_loop(&[], 0);

    let summary = training.run(&mut h.trainer).unwrap();

    assert_eq!(summary.skipped_empty, 2);
    assert_eq!(summary.optimizer_steps, 0);
    assert_eq!(h.steps.get(), 0);
    assert!(h.trainer.loss_history().is_empty());
    assert_eq!(h.store.saved.borrow()[&(0, 1)].epoch_losses, Some(Vec::new()));
}

#[test]
fn test_train_step_on_batch_without_targets() {
    let mut h = Harness::new(&[2], 1, 4, |_| {});
    let mut training = h.training_loop(&[], 0);
    let before = h.trainer.model().parameters();

    let outcome = training
        .train_step(&mut h.trainer, &Batch::default(), false)
        .unwrap();

    assert!(matches!(outcome, IterationOutcome::SkippedEmptyLoss));
    assert_eq!(h.trainer.model().parameters(), before);
    assert_eq!(h.trainer.loss_history().len(), 0);
}

#[test]
fn test_transient_failure_is_skipped() {
    let mut h = Harness::new(&[2], 1, 4, |_| {});
    let mut training = h.training_loop(&[0], 0);

    let summary = training.run(&mut h.trainer).unwrap();

    assert_eq!(summary.transient_failures, 1);
    assert_eq!(summary.optimizer_steps, 1);
    assert_eq!(h.trainer.loss_history().len(), 1);
}

#[test]
fn test_debug_propagates_failure() {
    let mut h = Harness::new(&[2], 1, 4, |cfg| cfg.debug = true);
    let mut training = h.training_loop(&[0], 0);

    let err = training.run(&mut h.trainer).unwrap_err();
    assert!(matches!(err, IlError::Iteration(_)));
    assert_eq!(h.steps.get(), 0);
}

#[test]
fn test_interleaved_replay() {
    let mut h = Harness::new(&[2, 2], 2, 4, |cfg| {
        cfg.start_state = 1;
        cfg.end_state = 1;
        cfg.sample_num = 1;
        cfg.mix_data = true;
        cfg.mix_data_start = 0;
        cfg.beta_on_replay = 0.6;
    });
    let mut training = h.training_loop(&[], 0);

    let summary = training.run(&mut h.trainer).unwrap();

    assert_eq!(summary.replay_steps, 2);
    assert_eq!(h.tally.replay_forwards.get(), 2);
    assert_eq!(summary.optimizer_steps, 2 * 2 + 2);

    // the override covers every group, only for replay steps
    let hypers = h.hyper_log.borrow();
    let replayed = hypers
        .iter()
        .filter(|groups| groups.iter().all(|g| g.betas == (0.6, DEFAULT_BETAS.1)))
        .count();
    let plain = hypers
        .iter()
        .filter(|groups| groups.iter().all(|g| g.betas == DEFAULT_BETAS))
        .count();
    assert_eq!(replayed, summary.replay_steps);
    assert_eq!(plain, hypers.len() - replayed);
    assert_eq!(h.trainer.optimizer().hyper(0), GroupHyper::new(0.5));
}

#[test]
fn test_dedicated_replay_overrides_betas_then_restores() {
    let mut h = Harness::new(&[2, 2], 1, 4, |cfg| {
        cfg.start_state = 1;
        cfg.end_state = 1;
        cfg.sample_num = 1;
        cfg.beta_on_replay = 0.5;
        cfg.beta_on_where = BetaTarget::Output;
    });
    let mut training = h.training_loop(&[], 0);

    let summary = training.run(&mut h.trainer).unwrap();
    assert_eq!(summary.replay_steps, 1);

    // two main steps, then the replay pass
    let hypers = h.hyper_log.borrow();
    assert_eq!(hypers.len(), 3);
    for groups in &hypers[..2] {
        assert!(groups.iter().all(|g| g.betas == DEFAULT_BETAS));
    }
    assert_eq!(hypers[2][0].betas, DEFAULT_BETAS);
    assert_eq!(hypers[2][1].betas, (0.5, DEFAULT_BETAS.1));

    assert_eq!(h.trainer.optimizer().hyper(0), GroupHyper::new(0.5));
    assert_eq!(h.trainer.optimizer().hyper(1), GroupHyper::new(0.5));
}

#[test]
fn test_importance_penalty_only_on_current_data() {
    let mut h = Harness::new(&[2, 2], 1, 4, |cfg| {
        cfg.start_state = 1;
        cfg.end_state = 1;
        cfg.sample_num = 1;
        cfg.mas = true;
    });
    let log = IterationLog::default();
    let mut training = h.recording_loop(&[], 0, Box::new(log.clone()));

    training.run(&mut h.trainer).unwrap();

    let iterations = log.iterations.borrow();
    assert_eq!(iterations.len(), 3);
    for losses in iterations.iter() {
        assert_eq!(losses.importance.is_some(), !losses.replay, "{losses}");
    }
    assert_eq!(iterations.iter().filter(|l| l.replay).count(), 1);
}

#[test]
fn test_agem_replaces_replay_training() {
    let mut h = Harness::new(&[2, 2], 1, 4, |cfg| {
        cfg.start_state = 1;
        cfg.end_state = 1;
        cfg.sample_num = 1;
        cfg.agem = true;
    });
    let mut training = h.training_loop(&[], 0);

    let summary = training.run(&mut h.trainer).unwrap();

    assert_eq!(summary.replay_steps, 0);
    // one reference batch per training iteration
    assert_eq!(h.tally.replay_forwards.get(), 2);
    assert!(h.trainer.projector().and_then(|p| p.reference()).is_some());
}

#[test]
fn test_classifier_warm_up_protects_known_classes() {
    let mut h = Harness::new(&[2, 2], 1, 4, |cfg| {
        cfg.start_state = 1;
        cfg.end_state = 1;
        cfg.sample_num = 1;
        cfg.states[1].warmup = vec![WarmupStage::layers(1, &["output"])];
    });
    let mut training = h.training_loop(&[], 0);
    let before = h.trainer.model().parameters();

    let summary = training.run(&mut h.trainer).unwrap();
    let after = h.trainer.model().parameters();

    assert_eq!(summary.replay_steps, 0);
    assert_eq!(h.tally.replay_forwards.get(), 0);
    assert_eq!(after["output.weight"][..4], before["output.weight"][..4]);
    assert_eq!(after["output.bias"][..2], before["output.bias"][..2]);
    assert_ne!(after["output.weight"][4..], before["output.weight"][4..]);
}

#[test]
fn test_final_correction_until_clean() {
    let mut h = Harness::new(&[2, 2], 1, 4, |cfg| {
        cfg.start_state = 1;
        cfg.end_state = 1;
        cfg.sample_num = 1;
        cfg.final_correction = true;
        cfg.enhance_error = true;
        cfg.states[1].warmup = vec![WarmupStage::layers(1, &["output"])];
    });
    let mut training = h.training_loop(&[], 3);

    let summary = training.run(&mut h.trainer).unwrap();

    assert_eq!(h.tally.enhance_backwards.get(), 3);
    assert_eq!(summary.correction_rounds, 4);
    assert_eq!(h.store.saved.borrow()[&(1, 1)].epoch_losses, None);

    // the ramp leaves a scaled rate behind; correction runs on the base rate
    let lrs = h.lr_log.borrow();
    assert_eq!(lrs.len(), 2 + 3);
    assert!((lrs[1] - 0.005).abs() < 1e-7);
    assert!(lrs[2..].iter().all(|&lr| lr == 0.5));
}

#[test]
fn test_final_correction_is_bounded() {
    let mut h = Harness::new(&[2, 2], 1, 4, |cfg| {
        cfg.start_state = 1;
        cfg.end_state = 1;
        cfg.sample_num = 1;
        cfg.final_correction = true;
        cfg.enhance_error = true;
        cfg.max_correction_rounds = 3;
        cfg.states[1].warmup = vec![WarmupStage::layers(1, &["output"])];
    });
    let mut training = h.training_loop(&[], 100);

    let summary = training.run(&mut h.trainer).unwrap();

    assert_eq!(summary.correction_rounds, 3);
    assert_eq!(h.tally.enhance_backwards.get(), 3);
}

#[test]
fn test_retention_every_fifth_epoch() {
    let mut h = Harness::new(&[2], 5, 2, |_| {});
    let mut training = h.training_loop(&[], 0);

    training.run(&mut h.trainer).unwrap();

    assert_eq!(h.store.deletions.get(), 3);
    let saved = h.store.saved.borrow();
    assert_eq!(saved.keys().copied().collect::<Vec<_>>(), vec![(0, 4), (0, 5)]);
}

#[test]
fn test_first_epoch_lr_ramp() {
    let mut h = Harness::new(&[2], 2, 4, |_| {});
    let mut training = h.training_loop(&[], 0);

    training.run(&mut h.trainer).unwrap();

    let lrs = h.lr_log.borrow();
    assert_eq!(lrs[0], 0.0);
    assert!((lrs[1] - 0.005).abs() < 1e-7);
    assert_eq!(lrs[2], 0.5);
}

struct CountingCorrection(Rc<Cell<usize>>);

impl BiasCorrection<MockModel> for CountingCorrection {
    fn run(
        &mut self,
        _model: &mut MockModel,
        _replay: Option<&ReplayBuffer>,
        _dataset: &dyn Dataset,
    ) -> retina_il::Result<()> {
        self.0.set(self.0.get() + 1);
        Ok(())
    }
}

#[test]
fn test_bias_correction_runs_once_after_final_state() {
    let mut h = Harness::new(&[2, 2], 1, 2, |cfg| {
        cfg.end_state = 1;
        cfg.bic = true;
    });
    let runs = Rc::new(Cell::new(0));
    let mut training = h
        .training_loop(&[], 0)
        .with_bias_correction(Box::new(CountingCorrection(runs.clone())));

    let summary = training.run(&mut h.trainer).unwrap();

    assert_eq!(summary.transitions, 1);
    assert_eq!(runs.get(), 1);
}
