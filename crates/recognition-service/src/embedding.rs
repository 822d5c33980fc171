//! Embedding normalization and similarity.
//!
//! Gallery and probe vectors are scaled to unit length so that their inner
//! product is the cosine similarity. Accumulation happens in `f64`.

use crate::error::{RecognitionError, RecognitionResult};

/// Distance from ±1 under which a similarity is reported as exactly ±1
const SIMILARITY_SNAP_EPSILON: f64 = 1e-6;

/// L2 norm of `v`, accumulated in `f64`
pub fn l2_norm(v: &[f32]) -> f64 {
    v.iter()
        .map(|&x| {
            let x = x as f64;
            x * x
        })
        .sum::<f64>()
        .sqrt()
}

/// Scale `v` to unit length. The zero vector is returned unchanged.
pub fn l2_normalize(v: &[f32]) -> RecognitionResult<Vec<f32>> {
    if let Some(position) = v.iter().position(|x| !x.is_finite()) {
        return Err(RecognitionError::InvalidEmbedding(format!(
            "non-finite value at index {}",
            position
        )));
    }

    let norm = l2_norm(v);
    if norm == 0.0 {
        return Ok(vec![0.0; v.len()]);
    }

    Ok(v.iter().map(|&x| (x as f64 / norm) as f32).collect())
}

/// Inner product of two unit vectors, clamped to [-1, 1]
///
/// Both slices must have the same length.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(&x, &y)| x as f64 * y as f64)
        .sum();

    let clamped = dot.clamp(-1.0, 1.0);
    if 1.0 - clamped < SIMILARITY_SNAP_EPSILON {
        1.0
    } else if clamped + 1.0 < SIMILARITY_SNAP_EPSILON {
        -1.0
    } else {
        clamped as f32
    }
}
