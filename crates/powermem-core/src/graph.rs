//! Graph Engine (C6, spec.md §4.6).
//!
//! Extracts subject-relation-object triples from ingested facts, maintains
//! the entity/edge graph (reobservation bumps `mentions`, contradicting
//! relations are reconciled via a second LLM call), and serves bounded
//! multi-hop traversal for the graph branch of the hybrid retriever.
//!
//! Traversal itself (BFS, cycle detection, per-hop caps) lives in
//! `store::sqlite`'s `GraphStore::neighbors` impl (grounded in the teacher's
//! `get_memory_subgraph`); this module only fans out across seed entities,
//! merges, and ranks.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;

use crate::error::Result;
use crate::llm::{parse_structured, prompts, LlmClient, LlmRequest};
use crate::model::{GraphEdge, GraphEntity, Scope};
use crate::retry::with_backoff;
use crate::store::GraphStore;

/// Sentinel subject/object PowerMem asks the extraction LLM to use for
/// first-person references, rewritten to the scope's concrete `user_id`
/// before persistence (spec.md §4.6 "Extraction").
pub const USER_ID_SENTINEL: &str = "USER_ID";

#[derive(Debug, Clone, Deserialize)]
pub struct RawTriple {
    pub subject: String,
    pub relation: String,
    pub object: String,
}

#[derive(Debug, Deserialize)]
struct TripleExtraction {
    triples: Vec<RawTriple>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationVerdict {
    Supersedes,
    Coexists,
}

#[derive(Debug, Deserialize)]
struct ReconciliationResponse {
    classification: RelationVerdict,
    #[allow(dead_code)]
    #[serde(default)]
    reasoning: Option<String>,
}

/// Caches reconciliation verdicts for `(source_id, target_id)` pairs across
/// every fact in one `add` call, so a fact that yields several triples
/// touching the same entity pair doesn't pay for the same LLM call twice
/// (spec.md §4.6, SPEC_FULL.md §4.6).
#[derive(Debug, Default)]
pub struct ReconciliationCache(HashMap<(String, String), RelationVerdict>);

impl ReconciliationCache {
    pub fn new() -> Self {
        Self::default()
    }
}

pub struct GraphEngine {
    store: Arc<dyn GraphStore>,
    llm: Arc<dyn LlmClient>,
    extract_prompt_override: Option<String>,
    reconcile_prompt_override: Option<String>,
    max_retries: u32,
    max_hop: u8,
    max_edges_per_hop: usize,
}

impl GraphEngine {
    pub fn new(
        store: Arc<dyn GraphStore>,
        llm: Arc<dyn LlmClient>,
        extract_prompt_override: Option<String>,
        reconcile_prompt_override: Option<String>,
        max_retries: u32,
        max_hop: u8,
        max_edges_per_hop: usize,
    ) -> Self {
        Self {
            store,
            llm,
            extract_prompt_override,
            reconcile_prompt_override,
            max_retries,
            // Hard cap of 3 regardless of configuration (spec.md §4.6).
            max_hop: max_hop.min(3),
            max_edges_per_hop,
        }
    }

    async fn call_llm(&self, system: &str, user: String) -> Result<Option<String>> {
        let llm = Arc::clone(&self.llm);
        let req = LlmRequest::oneshot(system.to_string(), user, 0.0);
        match with_backoff(self.max_retries, Duration::from_millis(200), || {
            let llm = Arc::clone(&llm);
            let req = req.clone();
            async move { llm.complete(req).await }
        })
        .await
        {
            Ok(text) => Ok(Some(text)),
            Err(e) => {
                tracing::warn!(error = %e, "graph engine LLM call failed");
                Ok(None)
            }
        }
    }

    /// Extracts triples from `text`, rewriting `USER_ID_SENTINEL` references
    /// to `scope.user_id` (spec.md §4.6 "Extraction"). Degrades to an empty
    /// list on any LLM or parse failure — extraction never raises, matching
    /// the fact extractor's failure posture.
    pub async fn extract_triples(&self, text: &str, scope: &Scope) -> Result<Vec<RawTriple>> {
        let system = prompts::resolve(&self.extract_prompt_override, prompts::EXTRACT_RELATIONS);
        let Some(completion) = self.call_llm(system, text.to_string()).await? else {
            return Ok(vec![]);
        };

        let parsed = match parse_structured::<TripleExtraction>(&completion) {
            Ok(p) => p,
            Err(warning) => {
                tracing::warn!(warning = %warning, "relation extraction response failed to parse");
                return Ok(vec![]);
            }
        };

        let user_id = scope.user_id.as_deref();
        Ok(parsed
            .triples
            .into_iter()
            .map(|t| RawTriple {
                subject: rewrite_sentinel(&t.subject, user_id),
                relation: t.relation,
                object: rewrite_sentinel(&t.object, user_id),
            })
            .collect())
    }

    async fn reconcile(&self, existing_relation: &str, new_relation: &str, subject: &str, object: &str) -> RelationVerdict {
        let system = prompts::resolve(&self.reconcile_prompt_override, prompts::UPDATE_GRAPH);
        let user = format!(
            "Entities: {subject} -> {object}\nExisting relation: {existing_relation}\nNew relation: {new_relation}"
        );
        match self.call_llm(system, user).await {
            Ok(Some(text)) => match parse_structured::<ReconciliationResponse>(&text) {
                Ok(parsed) => parsed.classification,
                Err(warning) => {
                    tracing::warn!(warning = %warning, "relation reconciliation response failed to parse, defaulting to COEXISTS");
                    RelationVerdict::Coexists
                }
            },
            _ => RelationVerdict::Coexists,
        }
    }

    /// Ingests one triple: upserts both entities, bumps `mentions` on
    /// reobservation, and reconciles against any existing relation between
    /// the same two entities with a different relation label.
    pub async fn ingest_triple(&self, triple: &RawTriple, scope: &Scope, cache: &mut ReconciliationCache) -> Result<GraphEdge> {
        let source = self
            .store
            .upsert_entity(&GraphEntity {
                id: String::new(),
                name: triple.subject.clone(),
                entity_type: None,
                scope: scope.clone(),
            })
            .await?;
        let target = self
            .store
            .upsert_entity(&GraphEntity {
                id: String::new(),
                name: triple.object.clone(),
                entity_type: None,
                scope: scope.clone(),
            })
            .await?;

        let existing = self.store.find_edge(&source.id, &target.id, scope).await?;
        for other in existing.iter().filter(|e| e.relation != triple.relation) {
            let key = (source.id.clone(), target.id.clone());
            let verdict = if let Some(v) = cache.0.get(&key) {
                *v
            } else {
                let v = self.reconcile(&other.relation, &triple.relation, &triple.subject, &triple.object).await;
                cache.0.insert(key, v);
                v
            };
            if verdict == RelationVerdict::Supersedes {
                tracing::debug!(edge_id = %other.id, "reconciliation superseded existing relation, deleting");
                self.store.delete_edge(&other.id).await?;
            }
        }

        let now = Utc::now();
        self.store
            .upsert_edge(&GraphEdge {
                id: String::new(),
                source_entity: source.id,
                relation: triple.relation.clone(),
                target_entity: target.id,
                scope: scope.clone(),
                mentions: 1,
                created_at: now,
                updated_at: now,
            })
            .await
    }

    /// Full per-fact pipeline: extract then ingest every triple.
    pub async fn ingest_fact(&self, text: &str, scope: &Scope, cache: &mut ReconciliationCache) -> Result<Vec<GraphEdge>> {
        let triples = self.extract_triples(text, scope).await?;
        let mut edges = Vec::with_capacity(triples.len());
        for triple in &triples {
            edges.push(self.ingest_triple(triple, scope, cache).await?);
        }
        Ok(edges)
    }

    /// Bounded multi-hop traversal from one or more seed entity names,
    /// merged, deduplicated, and ranked by `(mentions desc, updated_at
    /// desc)` with early termination once `k` unique edges are collected
    /// (spec.md §4.6 "Traversal").
    pub async fn traverse(&self, seed_entities: &[String], scope: &Scope, k: usize) -> Result<Vec<GraphEdge>> {
        let mut seen = HashSet::new();
        let mut edges = Vec::new();
        for seed in seed_entities {
            let found = self.store.neighbors(seed, scope, self.max_hop, self.max_edges_per_hop).await?;
            for edge in found {
                if seen.insert(edge.id.clone()) {
                    edges.push(edge);
                }
            }
        }
        edges.sort_by(|a, b| b.mentions.cmp(&a.mentions).then(b.updated_at.cmp(&a.updated_at)));
        edges.truncate(k);
        Ok(edges)
    }
}

fn rewrite_sentinel(value: &str, user_id: Option<&str>) -> String {
    if value.eq_ignore_ascii_case(USER_ID_SENTINEL) {
        user_id.unwrap_or(USER_ID_SENTINEL).to_string()
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::EchoLlmClient;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex as StdMutex;

    struct FakeGraphStore {
        entities: StdMutex<Vec<GraphEntity>>,
        edges: StdMutex<Vec<GraphEdge>>,
    }

    impl FakeGraphStore {
        fn new() -> Self {
            Self { entities: StdMutex::new(vec![]), edges: StdMutex::new(vec![]) }
        }
    }

    #[async_trait]
    impl GraphStore for FakeGraphStore {
        async fn upsert_entity(&self, entity: &GraphEntity) -> Result<GraphEntity> {
            let mut entities = self.entities.lock().unwrap();
            let normalized = GraphEntity::normalize_name(&entity.name);
            if let Some(found) = entities.iter().find(|e| GraphEntity::normalize_name(&e.name) == normalized) {
                return Ok(found.clone());
            }
            let stored = GraphEntity { id: format!("e{}", entities.len() + 1), ..entity.clone() };
            entities.push(stored.clone());
            Ok(stored)
        }

        async fn upsert_edge(&self, edge: &GraphEdge) -> Result<GraphEdge> {
            let mut edges = self.edges.lock().unwrap();
            if let Some(found) = edges.iter_mut().find(|e| {
                e.source_entity == edge.source_entity && e.target_entity == edge.target_entity && e.relation == edge.relation
            }) {
                found.mentions += 1;
                found.updated_at = Utc::now();
                return Ok(found.clone());
            }
            let stored = GraphEdge { id: format!("ed{}", edges.len() + 1), ..edge.clone() };
            edges.push(stored.clone());
            Ok(stored)
        }

        async fn delete_edge(&self, id: &str) -> Result<()> {
            self.edges.lock().unwrap().retain(|e| e.id != id);
            Ok(())
        }

        async fn find_edge(&self, source: &str, target: &str, _scope: &Scope) -> Result<Vec<GraphEdge>> {
            Ok(self.edges.lock().unwrap().iter().filter(|e| e.source_entity == source && e.target_entity == target).cloned().collect())
        }

        async fn neighbors(&self, entity: &str, _scope: &Scope, _hop: u8, _max_edges: usize) -> Result<Vec<GraphEdge>> {
            let entities = self.entities.lock().unwrap();
            let Some(e) = entities.iter().find(|e| GraphEntity::normalize_name(&e.name) == GraphEntity::normalize_name(entity)) else {
                return Ok(vec![]);
            };
            Ok(self.edges.lock().unwrap().iter().filter(|edge| edge.source_entity == e.id || edge.target_entity == e.id).cloned().collect())
        }
    }

    #[tokio::test]
    async fn ingest_fact_extracts_and_persists_triples() {
        let store = Arc::new(FakeGraphStore::new());
        let llm = Arc::new(EchoLlmClient::new(r#"{"triples": [{"subject": "alice", "relation": "works_at", "object": "acme"}]}"#));
        let engine = GraphEngine::new(store, llm, None, None, 3, 2, 20);
        let mut cache = ReconciliationCache::new();
        let edges = engine.ingest_fact("alice works at acme", &Scope::empty(), &mut cache).await.unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].relation, "works_at");
    }

    #[tokio::test]
    async fn reobserving_same_triple_increments_mentions() {
        let store = Arc::new(FakeGraphStore::new());
        let llm = Arc::new(EchoLlmClient::new(r#"{"triples": [{"subject": "alice", "relation": "works_at", "object": "acme"}]}"#));
        let engine = GraphEngine::new(store, llm, None, None, 3, 2, 20);
        let mut cache = ReconciliationCache::new();
        engine.ingest_fact("alice works at acme", &Scope::empty(), &mut cache).await.unwrap();
        let edges = engine.ingest_fact("alice still works at acme", &Scope::empty(), &mut cache).await.unwrap();
        assert_eq!(edges[0].mentions, 2);
    }

    #[tokio::test]
    async fn sentinel_is_rewritten_to_scope_user_id() {
        let store = Arc::new(FakeGraphStore::new());
        let llm = Arc::new(EchoLlmClient::new(r#"{"triples": [{"subject": "USER_ID", "relation": "likes", "object": "coffee"}]}"#));
        let engine = GraphEngine::new(store, llm, None, None, 3, 2, 20);
        let scope = Scope { user_id: Some("u1".to_string()), ..Scope::empty() };
        let triples = engine.extract_triples("i like coffee", &scope).await.unwrap();
        assert_eq!(triples[0].subject, "u1");
    }

    #[tokio::test]
    async fn traverse_merges_and_ranks_by_mentions() {
        let store = Arc::new(FakeGraphStore::new());
        let llm = Arc::new(EchoLlmClient::new(r#"{"triples": []}"#));
        let engine = GraphEngine::new(store.clone(), llm, None, None, 3, 2, 20);
        let a = store.upsert_entity(&GraphEntity { id: String::new(), name: "alice".to_string(), entity_type: None, scope: Scope::empty() }).await.unwrap();
        let b = store.upsert_entity(&GraphEntity { id: String::new(), name: "bob".to_string(), entity_type: None, scope: Scope::empty() }).await.unwrap();
        store.upsert_edge(&GraphEdge { id: String::new(), source_entity: a.id.clone(), relation: "knows".to_string(), target_entity: b.id.clone(), scope: Scope::empty(), mentions: 1, created_at: Utc::now(), updated_at: Utc::now() }).await.unwrap();
        let edges = engine.traverse(&["alice".to_string()], &Scope::empty(), 10).await.unwrap();
        assert_eq!(edges.len(), 1);
    }
}
