//! Dataset seam and batch planning

use crate::Result;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

/// One ground-truth box
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    /// Class index in the global class order
    pub class_id: u32,
}

/// A collated mini-batch
#[derive(Debug, Clone, Default)]
pub struct Batch {
    /// Source image ids
    pub image_ids: Vec<u64>,
    /// Normalized image tensors, one per image
    pub images: Vec<Vec<f32>>,
    /// Annotations, one list per image
    pub annotations: Vec<Vec<Annotation>>,
}

impl Batch {
    /// Number of images
    pub fn len(&self) -> usize {
        self.image_ids.len()
    }

    /// Whether the batch holds no images
    pub fn is_empty(&self) -> bool {
        self.image_ids.is_empty()
    }

    /// Total annotations over all images
    pub fn num_annotations(&self) -> usize {
        self.annotations.iter().map(Vec::len).sum()
    }
}

/// A candidate replay sample contributed by a completed state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exemplar {
    /// Image id
    pub image_id: u64,
    /// State the image was trained in
    pub state: usize,
    /// Classes annotated in the image
    pub classes: Vec<u32>,
}

/// Training data for the incremental states
pub trait Dataset {
    /// Images visible in the current state
    fn len(&self) -> usize;

    /// Whether no image is visible
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Widen the visible-class window to the next state
    fn advance_state(&mut self);

    /// Width/height ratio of the image at `index`, for batch grouping
    fn aspect_ratio(&self, _index: usize) -> f32 {
        1.0
    }

    /// Collate the images at the given positions
    fn get_batch(&self, indices: &[usize]) -> Result<Batch>;

    /// Collate images by id, regardless of the visible window (replay)
    fn load_images(&self, image_ids: &[u64]) -> Result<Batch>;

    /// Replay candidates of a state
    fn exemplars(&self, state: usize) -> Vec<Exemplar>;
}

/// Plans index batches over a dataset, grouping images of similar aspect ratio
#[derive(Debug, Clone)]
pub struct DataLoader {
    batch_size: usize,
    drop_last: bool,
    groups: Vec<Vec<usize>>,
}

impl DataLoader {
    /// Build batches for the dataset as it is now
    pub fn new(dataset: &dyn Dataset, batch_size: usize, drop_last: bool) -> Self {
        let mut order: Vec<usize> = (0..dataset.len()).collect();
        order.sort_by(|&a, &b| {
            dataset
                .aspect_ratio(a)
                .partial_cmp(&dataset.aspect_ratio(b))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let batch_size = batch_size.max(1);
        let groups = order
            .chunks(batch_size)
            .filter(|chunk| !drop_last || chunk.len() == batch_size)
            .map(<[usize]>::to_vec)
            .collect();

        Self {
            batch_size,
            drop_last,
            groups,
        }
    }

    /// Batches per epoch
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Whether there are no batches
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Batch size
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Whether a short final batch is dropped
    pub fn drop_last(&self) -> bool {
        self.drop_last
    }

    /// Batch order for one epoch
    pub fn epoch(&self, rng: &mut StdRng) -> Vec<Vec<usize>> {
        let mut groups = self.groups.clone();
        groups.shuffle(rng);
        groups
    }
}
