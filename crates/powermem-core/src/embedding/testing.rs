//! Deterministic hash-based fake embeddings (spec.md §8: "a mock LLM +
//! mock EmbeddingProvider, hash-based fake embeddings, so cosine similarity
//! is reproducible without a model"), gated behind `test-support`.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use async_trait::async_trait;

use crate::error::Result;

use super::EmbeddingProvider;

/// Hashes each word of the input into a small number of buckets of a
/// `dims`-length vector, then L2-normalizes. Two texts sharing more words
/// produce a higher cosine similarity — not semantically meaningful, but
/// deterministic and reproducible without a real model, which is all the
/// integration tests in spec.md §8 need.
pub struct HashEmbeddingProvider {
    dims: usize,
}

impl HashEmbeddingProvider {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }

    fn hash_vector(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0_f32; self.dims];
        for word in text.to_lowercase().split_whitespace() {
            let mut hasher = DefaultHasher::new();
            word.hash(&mut hasher);
            let bucket = (hasher.finish() as usize) % self.dims;
            vector[bucket] += 1.0;
        }
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vector {
                *x /= norm;
            }
        } else {
            // Empty/whitespace-only input: a deterministic non-zero vector
            // so downstream cosine math never divides by zero.
            vector[0] = 1.0;
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbeddingProvider {
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.hash_vector(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.hash_vector(t)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::cosine_similarity;

    #[tokio::test]
    async fn same_text_embeds_identically() {
        let provider = HashEmbeddingProvider::new(32);
        let a = provider.embed("the quick brown fox").await.unwrap();
        let b = provider.embed("the quick brown fox").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn shared_words_increase_similarity() {
        let provider = HashEmbeddingProvider::new(64);
        let a = provider.embed("alice likes hiking and coffee").await.unwrap();
        let b = provider.embed("alice likes hiking and tea").await.unwrap();
        let c = provider.embed("completely unrelated sentence here").await.unwrap();
        assert!(cosine_similarity(&a, &b) > cosine_similarity(&a, &c));
    }

    #[tokio::test]
    async fn output_has_configured_dims() {
        let provider = HashEmbeddingProvider::new(16);
        let v = provider.embed("hello world").await.unwrap();
        assert_eq!(v.len(), 16);
    }
}
