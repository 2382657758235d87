//! Memory Engine Facade (C9, spec.md §4.9).
//!
//! Owns every backend and sub-component and wires them into the public API.
//! Concurrency is engine-owned rather than scattered per component
//! (REDESIGN FLAGS, spec.md §9): a bounded worker semaphore caps total
//! in-flight operations, and a fixed-size stripe of per-id locks serializes
//! mutations against the same fact without a single crate-wide mutex.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, Semaphore, SemaphorePermit};

use crate::config::EngineConfig;
use crate::ebbinghaus::{tier_for_score, EbbinghausManager, ImportanceEvaluator, MaintenanceReport};
use crate::embedding::EmbeddingProvider;
use crate::error::{PowerMemError, Result};
use crate::extract::ExtractionRequest;
use crate::extract::FactExtractor;
use crate::graph::{GraphEngine, ReconciliationCache};
use crate::llm::LlmClient;
use crate::model::{HistoryEvent, HistoryEventKind, MemoryFact, MemoryMetadata, Scope, Tier, UserProfile};
use crate::planner::{Action, MutationPlanner, PlannedOp};
use crate::profile_builder::ProfileBuilder;
use crate::retrieval::{HybridRetriever, SearchOptions};
use crate::scope::{canonicalize_scope, is_group_read, require_read_scope, require_write_scope, RawScope, ReadAccess};
use crate::store::id::SnowflakeGenerator;
use crate::store::{Filter, FullTextStore, GraphStore, HistoryStore, Page, ProfileStore, VectorStore};

/// One fact's outcome within an [`MemoryEngine::add`] call.
#[derive(Debug, Clone)]
pub struct FactResult {
    pub id: String,
    pub memory: Option<MemoryFact>,
    pub action: Action,
}

#[derive(Debug, Clone, Default)]
pub struct AddOutcome {
    pub results: Vec<FactResult>,
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub fact: MemoryFact,
    pub score: f32,
}

#[derive(Debug, Clone, Default)]
pub struct SearchOutcome {
    pub results: Vec<SearchHit>,
}

/// A partial update to an existing fact. `None` fields are left untouched;
/// `memory_type` uses a double `Option` so a caller can explicitly clear it.
#[derive(Debug, Clone, Default)]
pub struct FactUpdate {
    pub content: Option<String>,
    pub memory_type: Option<Option<String>>,
    pub extra: Option<BTreeMap<String, Value>>,
}

pub struct MemoryEngine {
    config: EngineConfig,

    vector_store: Arc<dyn VectorStore>,
    history_store: Arc<dyn HistoryStore>,
    profile_store: Arc<dyn ProfileStore>,
    embedder: Arc<dyn EmbeddingProvider>,

    extractor: FactExtractor,
    planner: MutationPlanner,
    graph: Option<Arc<GraphEngine>>,
    importance: ImportanceEvaluator,
    ebbinghaus: Arc<EbbinghausManager>,
    profile_builder: Arc<ProfileBuilder>,
    retriever: HybridRetriever,

    id_gen: SnowflakeGenerator,
    worker_pool: Arc<Semaphore>,
    mutation_locks: Vec<AsyncMutex<()>>,
}

impl MemoryEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EngineConfig,
        vector_store: Arc<dyn VectorStore>,
        full_text_store: Arc<dyn FullTextStore>,
        history_store: Arc<dyn HistoryStore>,
        graph_store: Option<Arc<dyn GraphStore>>,
        profile_store: Arc<dyn ProfileStore>,
        llm: Arc<dyn LlmClient>,
        embedder: Arc<dyn EmbeddingProvider>,
        node_id: u64,
    ) -> Result<Self> {
        let max_retries = config.concurrency.llm_max_retries;

        let extractor = FactExtractor::new(Arc::clone(&llm), config.prompts.fact_extraction.clone(), max_retries);
        let planner = MutationPlanner::new(Arc::clone(&vector_store), Arc::clone(&llm), config.prompts.update_memory.clone(), max_retries);
        let importance = ImportanceEvaluator::new(Arc::clone(&llm), config.prompts.importance_evaluation.clone(), max_retries);
        let ebbinghaus = Arc::new(EbbinghausManager::new(Arc::clone(&vector_store), Arc::clone(&history_store), config.intelligent_memory.clone()));
        let profile_builder = Arc::new(ProfileBuilder::new(
            Arc::clone(&profile_store),
            Arc::clone(&llm),
            config.prompts.profile_consolidation.clone(),
            max_retries,
        ));

        let graph = if config.graph_store.enabled {
            let store = graph_store.ok_or_else(|| {
                PowerMemError::Validation("graph_store.enabled is true but no GraphStore backend was supplied".to_string())
            })?;
            Some(Arc::new(GraphEngine::new(
                store,
                Arc::clone(&llm),
                config.prompts.extract_relations.clone(),
                config.prompts.update_graph.clone(),
                max_retries,
                config.graph_store.max_hop,
                config.graph_store.max_edges_per_hop,
            )))
        } else {
            None
        };

        let retriever = HybridRetriever::new(
            Arc::clone(&vector_store),
            full_text_store,
            graph.clone(),
            Arc::clone(&embedder),
            Arc::clone(&ebbinghaus),
            config.intelligent_memory.clone(),
            config.concurrency.backend_timeout,
        );

        let id_gen = SnowflakeGenerator::new(node_id)?;
        let worker_pool = Arc::new(Semaphore::new(config.concurrency.max_in_flight));
        let mutation_locks = (0..config.concurrency.lock_stripes.max(1)).map(|_| AsyncMutex::new(())).collect();

        Ok(Self {
            config,
            vector_store,
            history_store,
            profile_store,
            embedder,
            extractor,
            planner,
            graph,
            importance,
            ebbinghaus,
            profile_builder,
            retriever,
            id_gen,
            worker_pool,
            mutation_locks,
        })
    }

    async fn acquire_permit(&self) -> Result<SemaphorePermit<'_>> {
        self.worker_pool
            .acquire()
            .await
            .map_err(|_| PowerMemError::Fatal("engine worker pool semaphore was closed".to_string()))
    }

    /// Maps an id to one of `lock_stripes` mutation locks (spec.md §5
    /// "Shared-resource locking"), so concurrent mutations only serialize
    /// against the (rare) case of hashing to the same stripe.
    fn stripe_for(&self, id: &str) -> &AsyncMutex<()> {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        id.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.mutation_locks.len();
        &self.mutation_locks[idx]
    }

    async fn append_history(&self, memory_id: &str, prev: Option<String>, new: Option<String>, kind: HistoryEventKind) -> Result<()> {
        self.history_store
            .append(HistoryEvent {
                event_id: 0,
                memory_id: memory_id.to_string(),
                prev_value: prev,
                new_value: new,
                event: kind,
                actor: None,
                timestamp: Utc::now(),
            })
            .await
    }

    /// Ingests triples for `content` into the graph. Logged and swallowed on
    /// failure — the vector/scalar store is the source of truth (spec.md
    /// §4.9 failure semantics: "graph store failure after vector store
    /// success: log a partial-failure warning, keep the vector result,
    /// leave the graph to catch up on the next mention").
    async fn ingest_graph(&self, content: &str, scope: &Scope, cache: &mut ReconciliationCache) {
        let Some(graph) = &self.graph else { return };
        if let Err(e) = graph.ingest_fact(content, scope, cache).await {
            tracing::warn!(error = %e, "graph ingestion failed after a successful vector store write");
        }
    }

    /// Extracts facts from `request`, plans and applies a mutation per fact,
    /// and kicks off a best-effort profile rebuild. Per spec.md §4.9 failure
    /// semantics: extraction failure yields zero facts and an empty, non-error
    /// outcome; a vector store write failure fails the whole call.
    pub async fn add(&self, request: ExtractionRequest, raw_scope: RawScope) -> Result<AddOutcome> {
        let _permit = self.acquire_permit().await?;
        let scope = canonicalize_scope(raw_scope);
        require_write_scope(&scope)?;

        let outcome = self.extractor.extract(request).await?;
        if outcome.facts.is_empty() {
            return Ok(AddOutcome::default());
        }

        let embeddings = self.embedder.embed_batch(&outcome.facts).await?;
        let mut results = Vec::with_capacity(outcome.facts.len());
        let mut graph_cache = ReconciliationCache::new();
        let mut touched_contents = Vec::new();

        for (content, embedding) in outcome.facts.into_iter().zip(embeddings.into_iter()) {
            let hash = MemoryFact::content_hash(&content);
            let plan = self.planner.plan(&content, &embedding, &hash, &scope).await?;
            for op in plan.operations {
                let result = self.apply_op(op, &content, &embedding, &hash, &scope, &mut graph_cache).await?;
                if let Some(memory) = &result.memory {
                    touched_contents.push(memory.content.clone());
                }
                results.push(result);
            }
        }

        if !touched_contents.is_empty() {
            let profile_builder = Arc::clone(&self.profile_builder);
            let profile_scope = scope.clone();
            tokio::spawn(async move {
                profile_builder.rebuild(&profile_scope, &touched_contents).await;
            });
        }

        Ok(AddOutcome { results })
    }

    async fn apply_op(
        &self,
        op: PlannedOp,
        content: &str,
        embedding: &[f32],
        hash: &str,
        scope: &Scope,
        graph_cache: &mut ReconciliationCache,
    ) -> Result<FactResult> {
        match op.action {
            Action::Add => {
                let id = self.id_gen.next_id_string()?;
                let importance = self.importance.evaluate(content).await;
                let mut metadata = MemoryMetadata::new(Utc::now());
                metadata.importance_score = importance.score;
                metadata.tier = tier_for_score(importance.score);

                let fact = MemoryFact {
                    id,
                    content: content.to_string(),
                    embedding: embedding.to_vec(),
                    scope: scope.clone(),
                    metadata,
                    hash: hash.to_string(),
                };
                self.vector_store.insert(&fact).await?;
                self.append_history(&fact.id, None, Some(fact.content.clone()), HistoryEventKind::Add).await?;
                self.ingest_graph(&fact.content, scope, graph_cache).await;
                Ok(FactResult { id: fact.id.clone(), memory: Some(fact), action: Action::Add })
            }
            Action::Update => {
                let Some(id) = op.memory_id else {
                    return Ok(FactResult { id: String::new(), memory: None, action: Action::None });
                };
                let _guard = self.stripe_for(&id).lock().await;
                let Some(mut fact) = self.vector_store.get(&id).await? else {
                    return Ok(FactResult { id, memory: None, action: Action::None });
                };
                let prev_content = fact.content.clone();
                let new_content = op.content.unwrap_or_else(|| content.to_string());
                fact.embedding = self.embedder.embed(&new_content).await?;
                fact.hash = MemoryFact::content_hash(&new_content);
                fact.content = new_content;
                fact.metadata.updated_at = Utc::now();
                self.vector_store.upsert(&fact).await?;
                self.append_history(&fact.id, Some(prev_content), Some(fact.content.clone()), HistoryEventKind::Update).await?;
                self.ingest_graph(&fact.content, scope, graph_cache).await;
                Ok(FactResult { id: fact.id.clone(), memory: Some(fact), action: Action::Update })
            }
            Action::Delete => {
                let Some(id) = op.memory_id else {
                    return Ok(FactResult { id: String::new(), memory: None, action: Action::None });
                };
                let _guard = self.stripe_for(&id).lock().await;
                let Some(fact) = self.vector_store.get(&id).await? else {
                    return Ok(FactResult { id, memory: None, action: Action::None });
                };
                self.vector_store.delete(&id).await?;
                self.append_history(&id, Some(fact.content), None, HistoryEventKind::Delete).await?;
                Ok(FactResult { id, memory: None, action: Action::Delete })
            }
            Action::None => Ok(FactResult { id: op.memory_id.unwrap_or_default(), memory: None, action: Action::None }),
        }
    }

    pub async fn search(&self, query: &str, raw_scope: RawScope, options: SearchOptions) -> Result<SearchOutcome> {
        let _permit = self.acquire_permit().await?;
        let scope = canonicalize_scope(raw_scope);
        require_read_scope(&scope, ReadAccess::Scoped)?;
        if is_group_read(&scope) {
            tracing::debug!(scope = ?scope, "search is a group read, spanning multiple users or agents");
        }
        let candidates = self.retriever.search(query, &scope, &options).await?;
        Ok(SearchOutcome {
            results: candidates.into_iter().map(|c| SearchHit { fact: c.fact, score: c.score }).collect(),
        })
    }

    pub async fn get(&self, id: &str) -> Result<Option<MemoryFact>> {
        let _permit = self.acquire_permit().await?;
        self.vector_store.get(id).await
    }

    pub async fn get_all(&self, raw_scope: RawScope, filter: Option<Filter>, limit: usize, cursor: Option<&str>) -> Result<Page<MemoryFact>> {
        let _permit = self.acquire_permit().await?;
        let scope = canonicalize_scope(raw_scope);
        require_read_scope(&scope, ReadAccess::Scoped)?;
        let combined = match filter {
            Some(f) => Filter::and([f, Filter::Scope(scope)]),
            None => Filter::Scope(scope),
        };
        self.vector_store.list(&combined, limit, cursor).await
    }

    pub async fn update(&self, id: &str, update: FactUpdate) -> Result<MemoryFact> {
        let _permit = self.acquire_permit().await?;
        let _guard = self.stripe_for(id).lock().await;
        let Some(mut fact) = self.vector_store.get(id).await? else {
            return Err(PowerMemError::NotFound(id.to_string()));
        };
        let prev_content = fact.content.clone();

        if let Some(content) = update.content {
            fact.embedding = self.embedder.embed(&content).await?;
            fact.hash = MemoryFact::content_hash(&content);
            fact.content = content;
        }
        if let Some(memory_type) = update.memory_type {
            fact.metadata.memory_type = memory_type;
        }
        if let Some(extra) = update.extra {
            fact.metadata.extra = extra;
        }
        fact.metadata.updated_at = Utc::now();

        self.vector_store.upsert(&fact).await?;
        self.append_history(&fact.id, Some(prev_content), Some(fact.content.clone()), HistoryEventKind::Update).await?;
        Ok(fact)
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let _permit = self.acquire_permit().await?;
        let _guard = self.stripe_for(id).lock().await;
        let Some(fact) = self.vector_store.get(id).await? else {
            return Err(PowerMemError::NotFound(id.to_string()));
        };
        self.vector_store.delete(id).await?;
        self.append_history(id, Some(fact.content), None, HistoryEventKind::Delete).await
    }

    /// Deletes every fact in `scope`: a soft archive (grace-period cleanup
    /// picks it up later) when `archive_grace_days > 0`, otherwise an
    /// immediate hard delete (spec.md §4.9 "delete_all").
    pub async fn delete_all(&self, raw_scope: RawScope) -> Result<usize> {
        let _permit = self.acquire_permit().await?;
        let scope = canonicalize_scope(raw_scope);
        require_write_scope(&scope)?;
        let soft = self.config.intelligent_memory.archive_grace_days > 0;

        let filter = Filter::Scope(scope);
        let mut cursor: Option<String> = None;
        let mut count = 0usize;
        loop {
            let page = self.vector_store.list(&filter, 200, cursor.as_deref()).await?;
            for mut fact in page.items {
                let _guard = self.stripe_for(&fact.id).lock().await;
                if soft {
                    fact.metadata.tier = Tier::Archived;
                    fact.metadata.updated_at = Utc::now();
                    self.vector_store.upsert(&fact).await?;
                } else {
                    self.vector_store.delete(&fact.id).await?;
                }
                self.append_history(&fact.id, Some(fact.content), None, HistoryEventKind::Delete).await?;
                count += 1;
            }
            match page.next_cursor {
                Some(c) => cursor = Some(c),
                None => break,
            }
        }
        Ok(count)
    }

    /// Unconditional hard wipe of every fact and the profile in `scope`.
    /// Always scope-scoped (`require_write_scope`): never an unfiltered
    /// delete across the whole store (spec.md §4.9 "reset").
    pub async fn reset(&self, raw_scope: RawScope) -> Result<usize> {
        let _permit = self.acquire_permit().await?;
        let scope = canonicalize_scope(raw_scope);
        require_write_scope(&scope)?;

        let filter = Filter::Scope(scope.clone());
        let mut cursor: Option<String> = None;
        let mut count = 0usize;
        loop {
            let page = self.vector_store.list(&filter, 200, cursor.as_deref()).await?;
            for fact in page.items {
                let _guard = self.stripe_for(&fact.id).lock().await;
                self.vector_store.delete(&fact.id).await?;
                self.append_history(&fact.id, Some(fact.content), None, HistoryEventKind::Delete).await?;
                count += 1;
            }
            match page.next_cursor {
                Some(c) => cursor = Some(c),
                None => break,
            }
        }
        self.profile_store.delete(&scope).await?;
        Ok(count)
    }

    pub async fn history(&self, id: &str) -> Result<Vec<HistoryEvent>> {
        let _permit = self.acquire_permit().await?;
        self.history_store.list(id).await
    }

    pub async fn profile(&self, raw_scope: RawScope) -> Result<Option<UserProfile>> {
        let _permit = self.acquire_permit().await?;
        let scope = canonicalize_scope(raw_scope);
        require_read_scope(&scope, ReadAccess::Scoped)?;
        self.profile_store.get(&scope).await
    }

    pub async fn delete_profile(&self, raw_scope: RawScope) -> Result<()> {
        let _permit = self.acquire_permit().await?;
        let scope = canonicalize_scope(raw_scope);
        require_write_scope(&scope)?;
        self.profile_store.delete(&scope).await
    }

    /// Runs the Ebbinghaus promotion/demotion/cleanup sweep (spec.md §4.7).
    /// Intended to be called periodically by the embedding application, not
    /// from inside any other engine operation.
    pub async fn run_maintenance(&self) -> Result<MaintenanceReport> {
        let _permit = self.acquire_permit().await?;
        self.ebbinghaus.run_maintenance().await
    }
}
