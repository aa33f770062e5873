//! Small in-memory collaborators for driving the trainer in tests.
#![allow(dead_code)]

use retina_il::{
    Annotation, Batch, Checkpoint, CheckpointStore, Dataset, DetectionLoss, DetectionModel,
    Exemplar, FrozenModel, GroupHyper, HeadLayout, IlError, IterationLosses, LossTerm, LossTerms,
    ModelMode, Optimizer, ParamSet, Recorder, Result, TrainingConfig,
};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

/// Feature width of each output row.
pub const FEATURE_DIM: usize = 2;

/// Linear detector with one anchor and a fixed backbone.
#[derive(Debug, Clone)]
pub struct MockModel {
    params: ParamSet,
    grads: ParamSet,
    classes: usize,
    pub frozen: Vec<String>,
    pub mode: Option<ModelMode>,
}

impl MockModel {
    pub fn new(classes: usize) -> Self {
        let mut params = ParamSet::new();
        params.insert("backbone.w".into(), vec![0.5; 4]);
        params.insert("output.weight".into(), vec![0.1; classes * FEATURE_DIM]);
        params.insert("output.bias".into(), vec![0.0; classes]);
        let grads = zeroed(&params);
        Self {
            params,
            grads,
            classes,
            frozen: Vec::new(),
            mode: None,
        }
    }
}

fn zeroed(set: &ParamSet) -> ParamSet {
    set.iter()
        .map(|(name, values)| (name.clone(), vec![0.0; values.len()]))
        .collect()
}

impl DetectionModel for MockModel {
    fn num_classes(&self) -> usize {
        self.classes
    }

    fn expand_capacity(&mut self, num_new_class: usize) -> Result<()> {
        for set in [&mut self.params, &mut self.grads] {
            if let Some(weight) = set.get_mut("output.weight") {
                weight.extend(std::iter::repeat(0.0).take(num_new_class * FEATURE_DIM));
            }
            if let Some(bias) = set.get_mut("output.bias") {
                bias.extend(std::iter::repeat(0.0).take(num_new_class));
            }
        }
        self.classes += num_new_class;
        Ok(())
    }

    fn freeze(&mut self, layers: &[String]) {
        self.frozen = layers.to_vec();
    }

    fn unfreeze_all(&mut self) {
        self.frozen.clear();
    }

    fn set_mode(&mut self, mode: ModelMode) {
        self.mode = Some(mode);
    }

    fn parameters(&self) -> ParamSet {
        self.params.clone()
    }

    fn load_parameters(&mut self, params: ParamSet) -> Result<()> {
        for (name, values) in &self.params {
            let got = params.get(name).map_or(0, Vec::len);
            if got != values.len() {
                return Err(IlError::ShapeMismatch {
                    name: name.clone(),
                    expected: values.len(),
                    got,
                });
            }
        }
        self.params = params;
        Ok(())
    }

    fn gradients(&self) -> &ParamSet {
        &self.grads
    }

    fn gradients_mut(&mut self) -> &mut ParamSet {
        &mut self.grads
    }

    fn zero_grad(&mut self) {
        for grad in self.grads.values_mut() {
            grad.fill(0.0);
        }
    }

    fn classifier_head(&self) -> Option<HeadLayout> {
        Some(HeadLayout {
            weight: "output.weight".into(),
            bias: "output.bias".into(),
            num_anchors: 1,
        })
    }

    fn output_sensitivity(&mut self, batch: &Batch) -> Result<ParamSet> {
        let weight = batch.len() as f32;
        Ok(self
            .params
            .iter()
            .map(|(name, values)| (name.clone(), values.iter().map(|v| v * weight).collect()))
            .collect())
    }
}

/// Images of every state, addressed by `state * 1000 + index`.
#[derive(Debug, Clone)]
pub struct MockDataset {
    images: Vec<Vec<(u64, Vec<u32>)>>,
    state: usize,
    pub empty: BTreeSet<u64>,
}

impl MockDataset {
    pub fn new(images_per_state: usize, new_classes: &[usize], state: usize) -> Self {
        let mut offset = 0u32;
        let images = new_classes
            .iter()
            .enumerate()
            .map(|(s, &count)| {
                let state_images = (0..images_per_state)
                    .map(|i| {
                        let class = offset + (i % count.max(1)) as u32;
                        ((s * 1000 + i) as u64, vec![class])
                    })
                    .collect();
                offset += count as u32;
                state_images
            })
            .collect();
        Self {
            images,
            state,
            empty: BTreeSet::new(),
        }
    }

    fn lookup(&self, image_id: u64) -> Option<&(u64, Vec<u32>)> {
        self.images.iter().flatten().find(|(id, _)| *id == image_id)
    }

    fn batch_of<'a>(&self, entries: impl Iterator<Item = &'a (u64, Vec<u32>)>) -> Batch {
        let mut batch = Batch::default();
        for (id, classes) in entries {
            batch.image_ids.push(*id);
            batch.images.push(vec![1.0; 4]);
            let annotations = if self.empty.contains(id) {
                Vec::new()
            } else {
                classes
                    .iter()
                    .map(|&class_id| Annotation {
                        x1: 0.0,
                        y1: 0.0,
                        x2: 10.0,
                        y2: 10.0,
                        class_id,
                    })
                    .collect()
            };
            batch.annotations.push(annotations);
        }
        batch
    }
}

impl Dataset for MockDataset {
    fn len(&self) -> usize {
        self.images.get(self.state).map_or(0, Vec::len)
    }

    fn advance_state(&mut self) {
        self.state += 1;
    }

    fn get_batch(&self, indices: &[usize]) -> Result<Batch> {
        let current = self
            .images
            .get(self.state)
            .ok_or_else(|| IlError::Dataset(format!("no images for state {}", self.state)))?;
        let entries = indices
            .iter()
            .map(|&i| {
                current
                    .get(i)
                    .ok_or_else(|| IlError::Dataset(format!("index {} out of range", i)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(self.batch_of(entries.into_iter()))
    }

    fn load_images(&self, image_ids: &[u64]) -> Result<Batch> {
        let entries = image_ids
            .iter()
            .map(|&id| {
                self.lookup(id)
                    .ok_or_else(|| IlError::Dataset(format!("unknown image {}", id)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(self.batch_of(entries.into_iter()))
    }

    fn exemplars(&self, state: usize) -> Vec<Exemplar> {
        self.images
            .get(state)
            .map(|images| {
                images
                    .iter()
                    .map(|(id, classes)| Exemplar {
                        image_id: *id,
                        state,
                        classes: classes.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Shared view of what the mock loss saw.
#[derive(Debug, Default)]
pub struct LossTally {
    pub forwards: Cell<usize>,
    pub replay_forwards: Cell<usize>,
    pub backwards: Cell<usize>,
    pub enhance_backwards: Cell<usize>,
    pub saw_previous: Cell<bool>,
}

/// Constant loss per annotation with failure injection.
pub struct MockLoss {
    pub tally: Rc<LossTally>,
    /// Forward calls (0-based) that fail
    pub fail_on: BTreeSet<usize>,
    /// Replay forward calls that report a non-zero enhance term
    pub enhance_calls: usize,
}

impl MockLoss {
    pub fn new(tally: Rc<LossTally>) -> Self {
        Self {
            tally,
            fail_on: BTreeSet::new(),
            enhance_calls: 0,
        }
    }
}

impl DetectionLoss<MockModel> for MockLoss {
    fn forward(
        &mut self,
        _model: &mut MockModel,
        previous: Option<&FrozenModel<MockModel>>,
        batch: &Batch,
        is_replay: bool,
    ) -> Result<LossTerms> {
        let call = self.tally.forwards.get();
        self.tally.forwards.set(call + 1);
        if is_replay {
            self.tally.replay_forwards.set(self.tally.replay_forwards.get() + 1);
        }
        if previous.is_some() {
            self.tally.saw_previous.set(true);
        }
        if self.fail_on.contains(&call) {
            return Err(IlError::Iteration(format!("injected failure on call {}", call)));
        }

        let annotations = batch.num_annotations() as f32;
        let mut terms = LossTerms::new()
            .with(LossTerm::Classification, annotations)
            .with(LossTerm::Regression, annotations * 0.5);
        if is_replay && self.enhance_calls > 0 {
            self.enhance_calls -= 1;
            terms.set(LossTerm::Enhance, 0.25);
        }
        Ok(terms)
    }

    fn backward(&mut self, model: &mut MockModel, scale: f32, only: Option<LossTerm>) -> Result<()> {
        self.tally.backwards.set(self.tally.backwards.get() + 1);
        if only == Some(LossTerm::Enhance) {
            self.tally.enhance_backwards.set(self.tally.enhance_backwards.get() + 1);
        }
        for grad in model.gradients_mut().values_mut() {
            for g in grad.iter_mut() {
                *g += 0.01 * scale;
            }
        }
        Ok(())
    }
}

/// Plain SGD over two groups: feature (0) and output (1).
pub struct MockOptimizer {
    groups: Vec<GroupHyper>,
    pub steps: Rc<Cell<usize>>,
    pub lr_log: Rc<RefCell<Vec<f32>>>,
    /// Group table seen by every step
    pub hyper_log: Rc<RefCell<Vec<Vec<GroupHyper>>>>,
}

impl MockOptimizer {
    pub fn new(lr: f32) -> Self {
        Self {
            groups: vec![GroupHyper::new(lr), GroupHyper::new(lr)],
            steps: Rc::new(Cell::new(0)),
            lr_log: Rc::new(RefCell::new(Vec::new())),
            hyper_log: Rc::new(RefCell::new(Vec::new())),
        }
    }
}

impl Optimizer<MockModel> for MockOptimizer {
    fn num_groups(&self) -> usize {
        self.groups.len()
    }

    fn hyper(&self, group: usize) -> GroupHyper {
        self.groups[group]
    }

    fn set_hyper(&mut self, group: usize, hyper: GroupHyper) {
        self.groups[group] = hyper;
    }

    fn step(&mut self, model: &mut MockModel) -> Result<()> {
        let lr = self.groups[0].lr;
        self.lr_log.borrow_mut().push(lr);
        self.hyper_log.borrow_mut().push(self.groups.clone());
        let grads = model.gradients().clone();
        let mut params = model.parameters();
        for (name, values) in params.iter_mut() {
            if let Some(grad) = grads.get(name) {
                for (v, g) in values.iter_mut().zip(grad) {
                    *v -= lr * g;
                }
            }
        }
        model.load_parameters(params)?;
        self.steps.set(self.steps.get() + 1);
        Ok(())
    }

    fn state_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.steps.get().to_le_bytes().to_vec())
    }
}

/// Keeps every iteration's losses in a shared list.
#[derive(Clone, Default)]
pub struct IterationLog {
    pub iterations: Rc<RefCell<Vec<IterationLosses>>>,
}

impl Recorder for IterationLog {
    fn add_iter_loss(&mut self, losses: &IterationLosses) {
        self.iterations.borrow_mut().push(losses.clone());
    }

    fn record_epoch_loss(&mut self, _epoch: usize) {}

    fn next_state(&mut self) {}

    fn end_write(&mut self) {}
}

/// Checkpoints kept in a shared map.
#[derive(Clone, Default)]
pub struct MemoryCheckpointStore {
    pub saved: Rc<RefCell<BTreeMap<(usize, usize), Checkpoint>>>,
    pub deletions: Rc<Cell<usize>>,
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(&mut self, checkpoint: &Checkpoint) -> Result<()> {
        self.saved
            .borrow_mut()
            .insert((checkpoint.state, checkpoint.epoch), checkpoint.clone());
        Ok(())
    }

    fn load(&self, state: usize, epoch: Option<usize>) -> Result<Checkpoint> {
        let saved = self.saved.borrow();
        let found = match epoch {
            Some(epoch) => saved.get(&(state, epoch)),
            None => saved
                .range((state, 0)..=(state, usize::MAX))
                .next_back()
                .map(|(_, checkpoint)| checkpoint),
        };
        found
            .cloned()
            .ok_or_else(|| IlError::Checkpoint(format!("no checkpoint for state {}", state)))
    }

    fn delete_old(&mut self, state: usize, epoch: usize) -> Result<usize> {
        let mut saved = self.saved.borrow_mut();
        let stale: Vec<_> = saved
            .keys()
            .filter(|(s, e)| *s == state && e + 1 < epoch)
            .copied()
            .collect();
        for key in &stale {
            saved.remove(key);
        }
        self.deletions.set(self.deletions.get() + stale.len());
        Ok(stale.len())
    }
}

/// Checkpoint of a fresh model for `state`.
pub fn seed_checkpoint(store: &MemoryCheckpointStore, state: usize, classes: usize) {
    store.saved.borrow_mut().insert(
        (state, 1),
        Checkpoint {
            state,
            epoch: 1,
            params: MockModel::new(classes).parameters(),
            optimizer: Vec::new(),
            scheduler: Default::default(),
            loss_history: Vec::new(),
            epoch_losses: None,
        },
    );
}

/// Small run over `new_classes` with seeded randomness.
pub fn config(new_classes: &[usize], epochs: usize, ckp_path: &std::path::Path) -> TrainingConfig {
    TrainingConfig {
        states: retina_il::StateConfig::plan(new_classes, epochs),
        start_state: 0,
        end_state: 0,
        start_epoch: 1,
        end_epoch: epochs,
        batch_size: 2,
        ckp_path: ckp_path.to_path_buf(),
        seed: Some(7),
        ..Default::default()
    }
}
