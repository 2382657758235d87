//! Embedding Provider (spec.md §3 "`embedding.length == store.configured_dim`";
//! §6 "embedder: { provider, model, dims, api_key, base_url }").
//!
//! Grounded in the teacher's `embeddings::local` module: the provider
//! abstraction, Matryoshka truncation, and vector-math helpers all follow its
//! shape, generalized from a hardcoded 256-dim constant to the configured
//! `EmbedderConfig.dims` since dimension is a per-store, not per-crate,
//! invariant here.

#[cfg(feature = "embeddings")]
pub mod local;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

use async_trait::async_trait;

use crate::error::Result;

/// A provider-agnostic text embedding backend. The one dimension invariant
/// the whole engine relies on: every vector this provider returns has
/// exactly `dims()` components (spec.md §3 invariant).
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn dims(&self) -> usize;
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Truncates to `dims` (Matryoshka representation learning: the first `dims`
/// components of a larger embedding are themselves a valid lower-dimensional
/// embedding) and L2-renormalizes. A no-op if `vector.len() <= dims`.
pub fn matryoshka_truncate(mut vector: Vec<f32>, dims: usize) -> Vec<f32> {
    if vector.len() > dims {
        vector.truncate(dims);
    }
    l2_normalize(&mut vector);
    vector
}

fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

/// Cosine similarity in `[-1, 1]`; `0.0` if the vectors differ in length.
#[inline]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0_f32;
    let mut norm_a = 0.0_f32;
    let mut norm_b = 0.0_f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = (norm_a * norm_b).sqrt();
    if denom > 0.0 { dot / denom } else { 0.0 }
}
