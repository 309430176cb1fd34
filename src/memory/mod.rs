pub mod cache;
pub mod cluster;
pub mod entries;
pub mod ingest;
pub mod keywords;
pub mod patterns;
pub mod retrieval;
pub mod scheduler;
pub mod stats;
pub mod store;
pub mod temporal;
pub mod types;

use crate::error::{EngineError, Result};

/// Convert an f32 embedding slice to raw bytes for sqlite-vec.
pub fn embedding_to_bytes(embedding: &[f32]) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(
            embedding.as_ptr() as *const u8,
            embedding.len() * std::mem::size_of::<f32>(),
        )
    }
}

/// Cosine similarity. Zero vectors compare as 0.0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Cosine similarity that refuses to compare vectors of different lengths.
pub fn checked_similarity(query: &[f32], stored: &[f32]) -> Result<f32> {
    if query.len() != stored.len() {
        return Err(EngineError::DimensionMismatch {
            expected: query.len(),
            found: stored.len(),
        });
    }
    Ok(cosine_similarity(query, stored))
}

/// Mean of a set of vectors, L2-normalized. `None` for an empty set.
pub fn centroid<'a>(vectors: impl IntoIterator<Item = &'a [f32]>) -> Option<Vec<f32>> {
    let mut sum: Option<Vec<f32>> = None;
    let mut count = 0usize;
    for v in vectors {
        let acc = sum.get_or_insert_with(|| vec![0.0; v.len()]);
        if acc.len() != v.len() {
            continue;
        }
        for (a, x) in acc.iter_mut().zip(v) {
            *a += x;
        }
        count += 1;
    }
    let mut sum = sum?;
    if count == 0 {
        return None;
    }
    let norm: f32 = sum.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        sum.iter_mut().for_each(|x| *x /= norm);
    }
    Some(sum)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = vec![0.2, 0.4, 0.4];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_with_zero_vector_is_zero() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn checked_similarity_rejects_mismatched_dimensions() {
        let err = checked_similarity(&[1.0, 0.0, 0.0], &[1.0, 0.0]).unwrap_err();
        assert!(matches!(
            err,
            EngineError::DimensionMismatch { expected: 3, found: 2 }
        ));
    }

    #[test]
    fn centroid_is_normalized_mean() {
        let a = [1.0f32, 0.0];
        let b = [0.0f32, 1.0];
        let c = centroid([&a[..], &b[..]]).unwrap();
        assert!((c[0] - c[1]).abs() < 1e-6);
        let norm: f32 = c.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
        assert!(centroid(std::iter::empty::<&[f32]>()).is_none());
    }
}
