//! In-process HNSW index mirrored alongside the `memories` table's embedding
//! column (spec.md §4.2, §4.3). Keyed directly by the numeric value of a
//! fact's Snowflake id, which sidesteps the teacher's string-key/u64-key
//! translation table entirely.

use std::collections::HashSet;

use usearch::{Index, IndexOptions, MetricKind, ScalarKind};

use crate::error::{PowerMemError, Result};

pub struct VectorIndex {
    index: Index,
    dims: usize,
    present: HashSet<u64>,
}

impl VectorIndex {
    pub fn new(dims: usize) -> Result<Self> {
        let options = IndexOptions {
            dimensions: dims,
            metric: MetricKind::Cos,
            quantization: ScalarKind::F32,
            connectivity: 16,
            expansion_add: 128,
            expansion_search: 64,
            multi: false,
        };
        let index = Index::new(&options)
            .map_err(|e| PowerMemError::Fatal(format!("vector index init failed: {e}")))?;
        index
            .reserve(64)
            .map_err(|e| PowerMemError::Fatal(format!("vector index reserve failed: {e}")))?;
        Ok(Self {
            index,
            dims,
            present: HashSet::new(),
        })
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn len(&self) -> usize {
        self.present.len()
    }

    fn reserve_for(&self, extra: usize) -> Result<()> {
        let capacity = self.index.capacity();
        let size = self.index.size();
        if size + extra > capacity {
            let new_capacity = std::cmp::max(capacity * 2, size + extra);
            self.index
                .reserve(new_capacity)
                .map_err(|e| PowerMemError::Fatal(format!("vector index reserve failed: {e}")))?;
        }
        Ok(())
    }

    /// Inserts or replaces the vector for `key`. A no-op on dimension
    /// mismatch is not possible: callers must already have validated
    /// `vector.len() == store.configured_dim` (spec.md §3).
    pub fn upsert(&mut self, key: u64, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dims {
            return Err(PowerMemError::Validation(format!(
                "embedding has {} dims, index expects {}",
                vector.len(),
                self.dims
            )));
        }
        if self.present.contains(&key) {
            self.index
                .remove(key)
                .map_err(|e| PowerMemError::Fatal(format!("vector index remove failed: {e}")))?;
            self.present.remove(&key);
        }
        self.reserve_for(1)?;
        self.index
            .add(key, vector)
            .map_err(|e| PowerMemError::Fatal(format!("vector index add failed: {e}")))?;
        self.present.insert(key);
        Ok(())
    }

    pub fn remove(&mut self, key: u64) -> Result<()> {
        if self.present.remove(&key) {
            self.index
                .remove(key)
                .map_err(|e| PowerMemError::Fatal(format!("vector index remove failed: {e}")))?;
        }
        Ok(())
    }

    /// Returns up to `limit` `(key, similarity)` pairs, highest similarity
    /// first. Similarity is `1 - cosine_distance`, clamped to `[0, 1]`.
    ///
    /// This search is not scope-aware: the HNSW graph has no concept of a
    /// tenant partition, so callers over-fetch and post-filter by scope
    /// (`crate::store::sqlite`).
    pub fn search(&self, query: &[f32], limit: usize) -> Result<Vec<(u64, f32)>> {
        if query.len() != self.dims {
            return Err(PowerMemError::Validation(format!(
                "query has {} dims, index expects {}",
                query.len(),
                self.dims
            )));
        }
        if self.present.is_empty() || limit == 0 {
            return Ok(vec![]);
        }
        let matches = self
            .index
            .search(query, limit)
            .map_err(|e| PowerMemError::Fatal(format!("vector index search failed: {e}")))?;
        Ok(matches
            .keys
            .iter()
            .zip(matches.distances.iter())
            .map(|(k, d)| (*k, (1.0 - d).clamp(0.0, 1.0)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(seed: f32, dims: usize) -> Vec<f32> {
        (0..dims).map(|i| ((i as f32 + seed) / dims as f32).sin()).collect()
    }

    #[test]
    fn upsert_and_search_roundtrip() {
        let mut idx = VectorIndex::new(8).unwrap();
        idx.upsert(1, &v(1.0, 8)).unwrap();
        idx.upsert(2, &v(50.0, 8)).unwrap();
        assert_eq!(idx.len(), 2);

        let results = idx.search(&v(1.0, 8), 2).unwrap();
        assert_eq!(results[0].0, 1);
    }

    #[test]
    fn upsert_replaces_existing_key() {
        let mut idx = VectorIndex::new(8).unwrap();
        idx.upsert(1, &v(1.0, 8)).unwrap();
        idx.upsert(1, &v(2.0, 8)).unwrap();
        assert_eq!(idx.len(), 1);
    }

    #[test]
    fn remove_drops_key() {
        let mut idx = VectorIndex::new(8).unwrap();
        idx.upsert(1, &v(1.0, 8)).unwrap();
        idx.remove(1).unwrap();
        assert_eq!(idx.len(), 0);
    }

    #[test]
    fn rejects_dimension_mismatch() {
        let mut idx = VectorIndex::new(8).unwrap();
        assert!(idx.upsert(1, &[1.0, 2.0]).is_err());
    }
}
