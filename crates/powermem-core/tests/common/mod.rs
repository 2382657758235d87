//! Shared fixtures for the engine-level scenario tests (spec.md §8).
//!
//! `ScenarioLlm` recognizes which component is calling (by comparing the
//! system prompt against the built-in constants in
//! `powermem_core::llm::prompts`) and answers deterministically, rather than
//! depending on a fixed call order — the engine's exact sequence of LLM
//! round trips is an implementation detail, not something a scenario test
//! should pin down.

use std::sync::Arc;

use async_trait::async_trait;
use powermem_core::config::EngineConfig;
use powermem_core::engine::MemoryEngine;
use powermem_core::error::Result;
use powermem_core::llm::{prompts, LlmClient, LlmRequest};
use powermem_core::store::sqlite::SqliteStore;
use powermem_core::store::{FullTextStore, GraphStore, HistoryStore, ProfileStore, VectorStore};

pub const DIMS: usize = 64;

pub struct ScenarioLlm;

#[async_trait]
impl LlmClient for ScenarioLlm {
    async fn complete(&self, request: LlmRequest) -> Result<String> {
        let system = request.messages[0].content.as_str();
        let user = request.messages[1].content.as_str();

        if system == prompts::FACT_EXTRACTION {
            return Ok(serde_json::json!({ "facts": [user.trim()] }).to_string());
        }
        if system == prompts::IMPORTANCE_EVALUATION {
            return Ok(r#"{"score": 0.8, "novelty": 0.8, "relevance": 0.8, "emotional_weight": 0.5}"#.to_string());
        }
        if system == prompts::UPDATE_MEMORY {
            return Ok(match find_candidate_id(user) {
                Some(id) => serde_json::json!({
                    "operations": [{
                        "action": "UPDATE",
                        "memory_id": id,
                        "new_content": new_fact_content(user),
                        "reasoning": "new statement supersedes the prior one",
                    }]
                })
                .to_string(),
                None => r#"{"operations": [{"action": "ADD"}]}"#.to_string(),
            });
        }
        if system == prompts::EXTRACT_RELATIONS {
            return Ok(extract_triples_for(user));
        }
        if system == prompts::UPDATE_GRAPH {
            return Ok(r#"{"classification": "COEXISTS"}"#.to_string());
        }
        if system == prompts::PROFILE_CONSOLIDATION {
            return Ok(r#"{"profile_text": "a short profile", "topics": []}"#.to_string());
        }
        Ok("{}".to_string())
    }
}

fn find_candidate_id(user: &str) -> Option<String> {
    let idx = user.find("id=")?;
    let rest = &user[idx + 3..];
    let end = rest.find(' ').unwrap_or(rest.len());
    Some(rest[..end].to_string())
}

fn new_fact_content(user: &str) -> String {
    let mut lines = user.lines();
    lines.next();
    lines.next().unwrap_or("").to_string()
}

/// Extracts a handful of fixed subject-relation-object triples by keyword
/// matching on the input, just enough to drive the graph multi-hop scenario
/// without a real extraction model.
fn extract_triples_for(user: &str) -> String {
    let lower = user.to_lowercase();
    let mut triples = Vec::new();
    if lower.contains("manager") && lower.contains("alice") && lower.contains("bob") {
        triples.push(("alice", "manages", "bob"));
    }
    if lower.contains("works on") && lower.contains("bob") && lower.contains("project x") {
        triples.push(("bob", "works_on", "project x"));
    }
    if lower.contains("alice") && lower.contains("project") && !triples.iter().any(|(s, _, _)| *s == "alice") {
        triples.push(("alice", "related_to", "project"));
    }
    let triples: Vec<_> = triples
        .into_iter()
        .map(|(s, r, o)| serde_json::json!({ "subject": s, "relation": r, "object": o }))
        .collect();
    serde_json::json!({ "triples": triples }).to_string()
}

/// Builds a `MemoryEngine` over a fresh in-memory `SqliteStore`, reusing it
/// for every store role the engine needs. Returns the store too, so tests
/// can seed or inspect state directly.
pub fn build_engine(llm: Arc<dyn LlmClient>, graph_enabled: bool) -> (Arc<SqliteStore>, MemoryEngine) {
    let store = Arc::new(SqliteStore::open_in_memory(DIMS).expect("in-memory sqlite store"));
    let embedder = Arc::new(powermem_core::embedding::testing::HashEmbeddingProvider::new(DIMS));

    let mut config = EngineConfig::default();
    config.graph_store.enabled = graph_enabled;

    let graph_store: Option<Arc<dyn GraphStore>> = if graph_enabled { Some(Arc::clone(&store) as Arc<dyn GraphStore>) } else { None };

    let engine = MemoryEngine::new(
        config,
        Arc::clone(&store) as Arc<dyn VectorStore>,
        Arc::clone(&store) as Arc<dyn FullTextStore>,
        Arc::clone(&store) as Arc<dyn HistoryStore>,
        graph_store,
        Arc::clone(&store) as Arc<dyn ProfileStore>,
        llm,
        embedder,
        1,
    )
    .expect("engine construction");

    (store, engine)
}
