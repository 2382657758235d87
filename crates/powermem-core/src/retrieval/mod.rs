//! Hybrid Retriever (C5, spec.md §4.5).
//!
//! Fans out a query across the vector, full-text, and graph branches
//! concurrently, fuses their rankings, reweights by recency, and returns a
//! bounded top-k — reinforcing every returned fact exactly once.

pub mod fusion;

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use lru::LruCache;
use tokio::sync::Mutex;

use crate::config::{FusionConfig, FusionMethod, IntelligentMemoryConfig};
use crate::ebbinghaus::{self, EbbinghausManager};
use crate::embedding::EmbeddingProvider;
use crate::error::{PowerMemError, Result};
use crate::graph::GraphEngine;
use crate::model::{MemoryFact, Scope};
use crate::store::{Filter, FullTextStore, TextParser, VectorStore};

use self::fusion::BranchResult;

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub k: usize,
    pub use_full_text: bool,
    pub use_graph: bool,
    pub fusion_method: FusionMethod,
    pub weights: (f32, f32, f32),
    pub rrf_k: f32,
    pub filter: Option<Filter>,
    pub text_parser: TextParser,
    pub reweight_by_recency: bool,
}

impl SearchOptions {
    pub fn new(k: usize, fusion: &FusionConfig) -> Self {
        Self {
            k,
            use_full_text: true,
            use_graph: true,
            fusion_method: fusion.method,
            weights: fusion.weights,
            rrf_k: fusion.rrf_k,
            filter: None,
            text_parser: TextParser::Space,
            reweight_by_recency: true,
        }
    }
}

/// A ranked result: the fact plus its final fused-and-reweighted score.
#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub fact: MemoryFact,
    pub score: f32,
}

impl PartialEq for ScoredCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.fact.id == other.fact.id
    }
}
impl Eq for ScoredCandidate {}

impl PartialOrd for ScoredCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// "Greater" means "ranks higher": higher fused score, then higher
/// `importance_score`, then newer `updated_at`, then lexicographically
/// smaller id (spec.md §4.5 "Tie-break").
impl Ord for ScoredCandidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .partial_cmp(&other.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| {
                self.fact
                    .metadata
                    .importance_score
                    .partial_cmp(&other.fact.metadata.importance_score)
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| self.fact.metadata.updated_at.cmp(&other.fact.metadata.updated_at))
            .then_with(|| other.fact.id.cmp(&self.fact.id))
    }
}

pub struct HybridRetriever {
    vector_store: Arc<dyn VectorStore>,
    full_text_store: Arc<dyn FullTextStore>,
    graph: Option<Arc<GraphEngine>>,
    embedder: Arc<dyn EmbeddingProvider>,
    ebbinghaus: Arc<EbbinghausManager>,
    intelligent_memory: IntelligentMemoryConfig,
    backend_timeout: Duration,
    /// Caches recent query embeddings (grounded in the teacher's
    /// `get_query_embedding`), avoiding a repeat embedding call for
    /// repeated or rapidly-paginated identical queries.
    query_cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl HybridRetriever {
    pub fn new(
        vector_store: Arc<dyn VectorStore>,
        full_text_store: Arc<dyn FullTextStore>,
        graph: Option<Arc<GraphEngine>>,
        embedder: Arc<dyn EmbeddingProvider>,
        ebbinghaus: Arc<EbbinghausManager>,
        intelligent_memory: IntelligentMemoryConfig,
        backend_timeout: Duration,
    ) -> Self {
        Self {
            vector_store,
            full_text_store,
            graph,
            embedder,
            ebbinghaus,
            intelligent_memory,
            backend_timeout,
            query_cache: Mutex::new(LruCache::new(NonZeroUsize::new(100).expect("100 is non-zero"))),
        }
    }

    async fn cached_embed(&self, query: &str) -> Result<Vec<f32>> {
        {
            let mut cache = self.query_cache.lock().await;
            if let Some(cached) = cache.get(query) {
                return Ok(cached.clone());
            }
        }
        let embedding = self.embedder.embed(query).await?;
        self.query_cache.lock().await.put(query.to_string(), embedding.clone());
        Ok(embedding)
    }

    pub async fn search(&self, query: &str, scope: &Scope, options: &SearchOptions) -> Result<Vec<ScoredCandidate>> {
        let span = tracing::debug_span!("hybrid_search", scope = ?scope, k = options.k);
        let _enter = span.enter();

        let filter = match &options.filter {
            Some(extra) => Filter::and([extra.clone(), Filter::Scope(scope.clone())]),
            None => Filter::Scope(scope.clone()),
        };
        let over_fetch = (options.k * 3).max(20);

        let use_graph = options.use_graph && self.graph.is_some();
        let enabled_branches = 1 + usize::from(options.use_full_text) + usize::from(use_graph);
        let vector_is_sole = enabled_branches == 1;

        let query_embedding = self.cached_embed(query).await?;

        let (vector_items, text_pairs, graph_items) = tokio::join!(
            self.run_branch("vector", vector_is_sole, self.vector_branch(&query_embedding, over_fetch, &filter)),
            self.run_branch("text", false, self.text_branch(options.use_full_text, query, over_fetch, &filter, options.text_parser)),
            self.run_branch("graph", false, self.graph_branch(use_graph, query, scope, &filter, over_fetch)),
        );

        let vector_items = vector_items?;
        let text_pairs = text_pairs.unwrap_or_default();
        let graph_items = graph_items.unwrap_or_default();

        let mut facts: HashMap<String, MemoryFact> = HashMap::new();
        for (id, _, fact) in vector_items.iter().chain(graph_items.iter()) {
            facts.entry(id.clone()).or_insert_with(|| fact.clone());
        }

        let vector_branch = BranchResult::from_scored(vector_items.iter().map(|(id, score, _)| (id.clone(), *score)).collect());
        let text_branch = BranchResult::from_scored(text_pairs);
        let graph_branch = BranchResult::from_scored(graph_items.iter().map(|(id, score, _)| (id.clone(), *score)).collect());

        let fused = match options.fusion_method {
            FusionMethod::Rrf => fusion::reciprocal_rank_fusion(&[vector_branch, text_branch, graph_branch], options.rrf_k),
            FusionMethod::Weighted => {
                let (wv, wt, wg) = options.weights;
                fusion::linear_combination(&[vector_branch, text_branch, graph_branch], &[wv, wt, wg])
            }
        };

        // Ids surfaced only by the text branch have no fact attached yet.
        for id in fused.keys() {
            if !facts.contains_key(id) {
                if let Some(fact) = self.vector_store.get(id).await? {
                    facts.insert(id.clone(), fact);
                }
            }
        }

        let mut heap: BinaryHeap<std::cmp::Reverse<ScoredCandidate>> = BinaryHeap::with_capacity(options.k + 1);
        for (id, fused_score) in fused {
            let Some(fact) = facts.get(&id) else { continue };
            let score = if options.reweight_by_recency {
                let elapsed_hours = (Utc::now() - fact.metadata.last_accessed).num_seconds() as f64 / 3600.0;
                let retention = ebbinghaus::retention(elapsed_hours.max(0.0), fact.metadata.retention_strength, &self.intelligent_memory);
                fused_score * retention as f32
            } else {
                fused_score
            };
            let candidate = ScoredCandidate { fact: fact.clone(), score };
            if heap.len() < options.k {
                heap.push(std::cmp::Reverse(candidate));
            } else if let Some(std::cmp::Reverse(worst)) = heap.peek() {
                if candidate > *worst {
                    heap.pop();
                    heap.push(std::cmp::Reverse(candidate));
                }
            }
        }

        let mut results: Vec<ScoredCandidate> = heap.into_iter().map(|std::cmp::Reverse(c)| c).collect();
        results.sort_by(|a, b| b.cmp(a));

        let ids: Vec<String> = results.iter().map(|c| c.fact.id.clone()).collect();
        if let Err(e) = self.ebbinghaus.reinforce_batch(&ids).await {
            tracing::warn!(error = %e, "post-search reinforcement failed");
        }

        Ok(results)
    }

    /// Runs one branch under `backend_timeout`. A failing or timed-out
    /// branch contributes an empty result unless it's the sole enabled
    /// branch, in which case the error propagates (spec.md §4.5 "Execution").
    async fn run_branch<T, Fut>(&self, label: &'static str, is_sole: bool, fut: Fut) -> Result<T>
    where
        T: Default,
        Fut: std::future::Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.backend_timeout, fut).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) if is_sole => Err(e),
            Ok(Err(e)) => {
                tracing::warn!(branch = label, error = %e, "retrieval branch failed, contributing empty result");
                Ok(T::default())
            }
            Err(_) => {
                if is_sole {
                    Err(PowerMemError::BackendUnavailable(format!("{label} branch timed out")))
                } else {
                    tracing::warn!(branch = label, "retrieval branch timed out, contributing empty result");
                    Ok(T::default())
                }
            }
        }
    }

    async fn vector_branch(&self, query_embedding: &[f32], k: usize, filter: &Filter) -> Result<Vec<(String, f32, MemoryFact)>> {
        self.vector_store.search(query_embedding, k, filter).await
    }

    async fn text_branch(&self, enabled: bool, query: &str, k: usize, filter: &Filter, parser: TextParser) -> Result<Vec<(String, f32)>> {
        if !enabled {
            return Ok(vec![]);
        }
        self.full_text_store.search(query, k, filter, parser).await
    }

    /// Extracts candidate entities from the query, validates them against
    /// the graph via bounded traversal, then searches the vector store with
    /// an entity-expanded query embedding. `GraphEdge` endpoints are entity
    /// ids rather than names, so this branch can't resolve traversal results
    /// back to memory ids directly; traversal instead gates whether the
    /// query is graph-connected at all, and the expanded embedding supplies
    /// the actual candidates.
    async fn graph_branch(&self, enabled: bool, query: &str, scope: &Scope, filter: &Filter, k: usize) -> Result<Vec<(String, f32, MemoryFact)>> {
        if !enabled {
            return Ok(vec![]);
        }
        let Some(graph) = &self.graph else { return Ok(vec![]) };

        let triples = graph.extract_triples(query, scope).await?;
        let mut seeds: Vec<String> = triples.into_iter().flat_map(|t| [t.subject, t.object]).collect();
        seeds.sort();
        seeds.dedup();
        if seeds.is_empty() {
            return Ok(vec![]);
        }

        let edges = graph.traverse(&seeds, scope, k).await?;
        if edges.is_empty() {
            return Ok(vec![]);
        }

        let expanded_query = format!("{query} {}", seeds.join(" "));
        let embedding = self.embedder.embed(&expanded_query).await?;
        self.vector_store.search(&embedding, k, filter).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FusionConfig;
    use crate::embedding::testing::HashEmbeddingProvider;
    use crate::model::{HistoryEvent, MemoryMetadata};
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use std::sync::Mutex as StdMutex;

    struct FakeVectorStore {
        facts: StdMutex<Vec<MemoryFact>>,
    }

    impl FakeVectorStore {
        fn new(facts: Vec<MemoryFact>) -> Self {
            Self { facts: StdMutex::new(facts) }
        }
    }

    #[async_trait]
    impl VectorStore for FakeVectorStore {
        async fn insert(&self, fact: &MemoryFact) -> Result<()> {
            self.facts.lock().unwrap().push(fact.clone());
            Ok(())
        }
        async fn upsert(&self, fact: &MemoryFact) -> Result<()> {
            let mut facts = self.facts.lock().unwrap();
            if let Some(existing) = facts.iter_mut().find(|f| f.id == fact.id) {
                *existing = fact.clone();
            } else {
                facts.push(fact.clone());
            }
            Ok(())
        }
        async fn delete(&self, id: &str) -> Result<()> {
            self.facts.lock().unwrap().retain(|f| f.id != id);
            Ok(())
        }
        async fn get(&self, id: &str) -> Result<Option<MemoryFact>> {
            Ok(self.facts.lock().unwrap().iter().find(|f| f.id == id).cloned())
        }
        async fn search(&self, vector: &[f32], k: usize, _filter: &Filter) -> Result<Vec<(String, f32, MemoryFact)>> {
            let facts = self.facts.lock().unwrap();
            let mut scored: Vec<(String, f32, MemoryFact)> = facts
                .iter()
                .map(|f| (f.id.clone(), crate::embedding::cosine_similarity(vector, &f.embedding), f.clone()))
                .collect();
            scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
            scored.truncate(k);
            Ok(scored)
        }
        async fn list(&self, _filter: &Filter, _limit: usize, _cursor: Option<&str>) -> Result<crate::store::Page<MemoryFact>> {
            Ok(crate::store::Page { items: self.facts.lock().unwrap().clone(), next_cursor: None })
        }
    }

    struct FakeFullTextStore;

    #[async_trait]
    impl FullTextStore for FakeFullTextStore {
        async fn search(&self, _text: &str, _k: usize, _filter: &Filter, _parser: TextParser) -> Result<Vec<(String, f32)>> {
            Ok(vec![])
        }
    }

    struct FakeHistoryStore {
        events: StdMutex<Vec<HistoryEvent>>,
    }

    impl FakeHistoryStore {
        fn new() -> Self {
            Self { events: StdMutex::new(vec![]) }
        }
    }

    #[async_trait]
    impl crate::store::HistoryStore for FakeHistoryStore {
        async fn append(&self, event: HistoryEvent) -> Result<()> {
            self.events.lock().unwrap().push(event);
            Ok(())
        }
        async fn list(&self, memory_id: &str) -> Result<Vec<HistoryEvent>> {
            Ok(self.events.lock().unwrap().iter().filter(|e| e.memory_id == memory_id).cloned().collect())
        }
    }

    fn fact(id: &str, embedding: Vec<f32>, last_accessed: chrono::DateTime<Utc>, importance: f64) -> MemoryFact {
        let mut metadata = MemoryMetadata::new(Utc::now());
        metadata.last_accessed = last_accessed;
        metadata.importance_score = importance;
        MemoryFact {
            id: id.to_string(),
            content: id.to_string(),
            embedding,
            scope: Scope::empty(),
            metadata,
            hash: MemoryFact::content_hash(id),
        }
    }

    fn retriever(facts: Vec<MemoryFact>) -> HybridRetriever {
        let vector_store = Arc::new(FakeVectorStore::new(facts));
        let full_text_store = Arc::new(FakeFullTextStore);
        let history_store = Arc::new(FakeHistoryStore::new());
        let config = IntelligentMemoryConfig::default();
        let ebbinghaus = Arc::new(EbbinghausManager::new(vector_store.clone(), history_store, config.clone()));
        let embedder = Arc::new(HashEmbeddingProvider::new(32));
        HybridRetriever::new(vector_store, full_text_store, None, embedder, ebbinghaus, config, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn recency_reweighting_ranks_recently_accessed_fact_first() {
        let embedding = HashEmbeddingProvider::new(32).embed("alice likes coffee").await.unwrap();
        let recent = fact("1", embedding.clone(), Utc::now() - ChronoDuration::hours(1), 0.5);
        let stale = fact("2", embedding, Utc::now() - ChronoDuration::days(30), 0.5);
        let retriever = retriever(vec![recent, stale]);

        let mut options = SearchOptions::new(2, &FusionConfig::default());
        options.use_full_text = false;
        options.fusion_method = FusionMethod::Weighted;
        options.weights = (1.0, 0.0, 0.0);

        let results = retriever.search("alice likes coffee", &Scope::empty(), &options).await.unwrap();
        assert_eq!(results[0].fact.id, "1");
    }

    #[tokio::test]
    async fn disabling_recency_reweight_breaks_ties_by_importance() {
        let embedding = HashEmbeddingProvider::new(32).embed("alice likes coffee").await.unwrap();
        let recent = fact("1", embedding.clone(), Utc::now() - ChronoDuration::hours(1), 0.5);
        let stale_but_important = fact("2", embedding, Utc::now() - ChronoDuration::days(30), 0.9);
        let retriever = retriever(vec![recent, stale_but_important]);

        let mut options = SearchOptions::new(2, &FusionConfig::default());
        options.use_full_text = false;
        options.reweight_by_recency = false;
        options.fusion_method = FusionMethod::Weighted;
        options.weights = (1.0, 0.0, 0.0);

        let results = retriever.search("alice likes coffee", &Scope::empty(), &options).await.unwrap();
        assert_eq!(results[0].fact.id, "2");
    }

    #[tokio::test]
    async fn fused_top_k_is_bounded_and_drawn_from_candidates() {
        let embedder = HashEmbeddingProvider::new(32);
        let mut facts = Vec::new();
        let mut ids = std::collections::HashSet::new();
        for (i, word) in ["apple", "banana", "cherry", "date", "elderberry"].iter().enumerate() {
            let embedding = embedder.embed(word).await.unwrap();
            let id = (i + 1).to_string();
            ids.insert(id.clone());
            facts.push(fact(&id, embedding, Utc::now(), 0.5));
        }
        let retriever = retriever(facts);

        let options = SearchOptions::new(3, &FusionConfig::default());
        let results = retriever.search("apple banana cherry date elderberry", &Scope::empty(), &options).await.unwrap();

        assert!(results.len() <= 3);
        for r in &results {
            assert!(ids.contains(&r.fact.id));
        }
    }
}
