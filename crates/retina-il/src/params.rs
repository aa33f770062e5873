//! Named parameter and gradient tensors
//!
//! Parameters and gradients travel as flat `f32` buffers keyed by parameter
//! name. The map is ordered, so flattening a set always yields the same layout.

use crate::{IlError, Result};
use std::collections::BTreeMap;

/// Named flat tensors (parameters or gradients)
pub type ParamSet = BTreeMap<String, Vec<f32>>;

/// Total number of scalars in a set
pub fn numel(set: &ParamSet) -> usize {
    set.values().map(Vec::len).sum()
}

/// Concatenate all tensors in name order
pub fn flatten(set: &ParamSet) -> Vec<f32> {
    let mut flat = Vec::with_capacity(numel(set));
    for values in set.values() {
        flat.extend_from_slice(values);
    }
    flat
}

/// Write a flat buffer back into `set`, in name order
pub fn unflatten_into(set: &mut ParamSet, flat: &[f32]) -> Result<()> {
    let expected = numel(set);
    if flat.len() != expected {
        return Err(IlError::ShapeMismatch {
            name: "flattened gradient".into(),
            expected,
            got: flat.len(),
        });
    }

    let mut offset = 0;
    for values in set.values_mut() {
        let n = values.len();
        values.copy_from_slice(&flat[offset..offset + n]);
        offset += n;
    }
    Ok(())
}

/// Dot product of two equally sized buffers
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Global L2 norm over every tensor in the set
pub fn global_norm(set: &ParamSet) -> f32 {
    set.values()
        .flat_map(|v| v.iter())
        .map(|g| g * g)
        .sum::<f32>()
        .sqrt()
}

/// Clip gradients by global norm; returns the norm before clipping
pub fn clip_grad_norm(grads: &mut ParamSet, max_norm: f32) -> f32 {
    let total_norm = global_norm(grads);

    if total_norm > max_norm {
        let scale = max_norm / (total_norm + 1e-6);
        for grad in grads.values_mut() {
            for g in grad.iter_mut() {
                *g *= scale;
            }
        }
    }

    total_norm
}

/// Add `other * factor` into `target` for every tensor present in both with equal length
pub fn add_scaled(target: &mut ParamSet, other: &ParamSet, factor: f32) {
    for (name, values) in target.iter_mut() {
        if let Some(src) = other.get(name) {
            if src.len() == values.len() {
                for (t, s) in values.iter_mut().zip(src) {
                    *t += s * factor;
                }
            }
        }
    }
}

/// Same names and shapes, all zeros
pub fn zeros_like(set: &ParamSet) -> ParamSet {
    set.iter()
        .map(|(name, values)| (name.clone(), vec![0.0; values.len()]))
        .collect()
}
