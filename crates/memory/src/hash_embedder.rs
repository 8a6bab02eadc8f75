//! Deterministic feature-hashing embedder.
//!
//! Each lower-cased alphanumeric word is hashed (FNV-1a) into one of
//! `dimensions` buckets with a hash-derived sign, and the result is
//! L2-normalised. Texts sharing words get positive cosine similarity,
//! which is enough for tests and offline runs without an embedding server.

use async_trait::async_trait;
use tanren_core::error::MemoryError;
use tanren_core::memory::Embedder;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimensions: usize,
}

impl HashEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Synchronous form of [`Embedder::embed`].
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];

        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let hash = fnv1a(&word.to_lowercase());
            let bucket = (hash % self.dimensions as u64) as usize;
            let sign = if (hash >> 63) == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

fn fnv1a(s: &str) -> u64 {
    s.bytes()
        .fold(FNV_OFFSET, |h, b| (h ^ b as u64).wrapping_mul(FNV_PRIME))
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError> {
        Ok(self.embed_text(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::cosine_similarity;

    #[test]
    fn same_text_same_vector() {
        let e = HashEmbedder::default();
        assert_eq!(e.embed_text("Capital of Spain"), e.embed_text("capital of spain"));
    }

    #[test]
    fn vectors_are_unit_length() {
        let v = HashEmbedder::new(64).embed_text("the quick brown fox");
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert_eq!(v.len(), 64);
    }

    #[test]
    fn empty_text_is_zero_vector() {
        let v = HashEmbedder::new(8).embed_text("  ...  ");
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn shared_words_score_higher() {
        let e = HashEmbedder::new(1024);
        let query = e.embed_text("capital of Spain");
        let spain = e.embed_text("User: capital of Spain?\nAssistant: Madrid.");
        let france = e.embed_text("User: capital of France?\nAssistant: Paris.");
        assert!(cosine_similarity(&query, &spain) > cosine_similarity(&query, &france));
    }
}
