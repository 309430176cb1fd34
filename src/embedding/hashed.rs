//! Feature-hashing embedding provider.
//!
//! Each non-stopword token is hashed (FNV-1a) into one of `dimensions`
//! buckets with a hash-derived sign, weighted by sublinear term frequency,
//! and the result is L2-normalized. Texts sharing vocabulary get high cosine
//! similarity; it carries no semantics beyond word overlap. Used when the
//! ONNX runtime is not installed and as the test encoder.

use std::collections::HashMap;

use anyhow::Result;

use super::{l2_normalize, EmbeddingProvider};
use crate::memory::keywords::tokenize;

pub struct HashedEmbeddingProvider {
    dimensions: usize,
}

impl HashedEmbeddingProvider {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes
        .iter()
        .fold(OFFSET, |h, b| (h ^ u64::from(*b)).wrapping_mul(PRIME))
}

impl EmbeddingProvider for HashedEmbeddingProvider {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut counts: HashMap<String, u32> = HashMap::new();
        for token in tokenize(text) {
            *counts.entry(token).or_default() += 1;
        }

        let mut v = vec![0.0f32; self.dimensions];
        for (token, tf) in counts {
            let h = fnv1a(token.as_bytes());
            let bucket = (h % self.dimensions as u64) as usize;
            let sign = if (h >> 63) == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign * (1.0 + (tf as f32).ln());
        }
        l2_normalize(&mut v);
        Ok(v)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_id(&self) -> String {
        format!("hashed-{}", self.dimensions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::cosine_similarity;

    #[test]
    fn identical_text_is_identical_vector() {
        let p = HashedEmbeddingProvider::new(384);
        let a = p.embed("Nervous about the job interview tomorrow").unwrap();
        let b = p.embed("Nervous about the job interview tomorrow").unwrap();
        assert_eq!(a, b);
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn shared_vocabulary_scores_higher() {
        let p = HashedEmbeddingProvider::new(384);
        let q = p.embed("what did I write about my dog").unwrap();
        let dog = p.embed("Walked the dog by the river, the dog loved it").unwrap();
        let tax = p.embed("Filed quarterly taxes at the accountant").unwrap();
        assert!(cosine_similarity(&q, &dog) > 0.3);
        assert!(cosine_similarity(&q, &dog) > cosine_similarity(&q, &tax));
    }

    #[test]
    fn stopword_only_text_is_zero_vector() {
        let p = HashedEmbeddingProvider::new(16);
        let v = p.embed("and the of it").unwrap();
        assert!(v.iter().all(|x| *x == 0.0));
        assert_eq!(v.len(), 16);
    }
}
