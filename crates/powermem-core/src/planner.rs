//! Mutation Planner (C4, spec.md §4.4).
//!
//! Decides whether a newly extracted fact should be added standalone,
//! merged into an existing memory, supersede (delete) one, or be discarded
//! as already represented — reconciling against the nearest existing
//! memories in the same scope.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::error::Result;
use crate::llm::{parse_structured, prompts, LlmClient, LlmRequest};
use crate::model::{MemoryFact, Scope};
use crate::retry::with_backoff;
use crate::store::{Filter, VectorStore};

const DEFAULT_NEIGHBOR_K: usize = 5;
const DEFAULT_NEIGHBOR_THRESHOLD: f32 = 0.7;

/// Mirrors the `aither-mem0`-style `Action` enum, generalized with a `None`
/// variant for "already represented, discard" (spec.md §4.4 step 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Add,
    Update,
    Delete,
    None,
}

#[derive(Debug, Clone)]
pub struct PlannedOp {
    pub action: Action,
    pub memory_id: Option<String>,
    pub content: Option<String>,
    pub reasoning: String,
}

#[derive(Debug, Clone)]
pub struct MutationPlan {
    pub operations: Vec<PlannedOp>,
}

#[derive(Debug, Deserialize)]
struct RawPlannedOp {
    action: Action,
    #[serde(default)]
    memory_id: Option<String>,
    #[serde(default)]
    new_content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlannerResponse {
    operations: Vec<RawPlannedOp>,
}

pub struct MutationPlanner {
    vector_store: Arc<dyn VectorStore>,
    llm: Arc<dyn LlmClient>,
    prompt_override: Option<String>,
    max_retries: u32,
    neighbor_k: usize,
    neighbor_threshold: f32,
}

impl MutationPlanner {
    pub fn new(vector_store: Arc<dyn VectorStore>, llm: Arc<dyn LlmClient>, prompt_override: Option<String>, max_retries: u32) -> Self {
        Self {
            vector_store,
            llm,
            prompt_override,
            max_retries,
            neighbor_k: DEFAULT_NEIGHBOR_K,
            neighbor_threshold: DEFAULT_NEIGHBOR_THRESHOLD,
        }
    }

    pub fn with_neighbor_params(mut self, k: usize, threshold: f32) -> Self {
        self.neighbor_k = k;
        self.neighbor_threshold = threshold;
        self
    }

    /// Builds a plan for a single new fact. `fact_content`/`fact_embedding`
    /// describe the fact before it has an id; `hash` is its content
    /// fingerprint, used for the idempotence short-circuit.
    pub async fn plan(&self, fact_content: &str, fact_embedding: &[f32], hash: &str, scope: &Scope) -> Result<MutationPlan> {
        let span = tracing::debug_span!("plan_mutation", scope = ?scope);
        let _enter = span.enter();

        let candidates = self
            .vector_store
            .search(fact_embedding, self.neighbor_k, &Filter::Scope(scope.clone()))
            .await?;
        let candidates: Vec<MemoryFact> = candidates
            .into_iter()
            .filter(|(_, score, _)| *score >= self.neighbor_threshold)
            .map(|(_, _, fact)| fact)
            .collect();

        // Idempotence short-circuit (spec.md §4.4 step 4): never issues the
        // LLM round trip when the content hash already exists in scope.
        if let Some(existing) = candidates.iter().find(|c| c.hash == hash) {
            tracing::debug!(memory_id = %existing.id, "fact hash matches existing memory, forcing NONE");
            return Ok(MutationPlan {
                operations: vec![PlannedOp {
                    action: Action::None,
                    memory_id: Some(existing.id.clone()),
                    content: None,
                    reasoning: "content hash matches an existing memory".to_string(),
                }],
            });
        }

        if candidates.is_empty() {
            return Ok(MutationPlan {
                operations: vec![PlannedOp {
                    action: Action::Add,
                    memory_id: None,
                    content: Some(fact_content.to_string()),
                    reasoning: "no similar existing memories in scope".to_string(),
                }],
            });
        }

        let system_prompt = prompts::resolve(&self.prompt_override, prompts::UPDATE_MEMORY);
        let user_prompt = build_user_prompt(fact_content, &candidates);

        let llm = Arc::clone(&self.llm);
        let req = LlmRequest::oneshot(system_prompt, user_prompt, 0.0);
        let completion = with_backoff(self.max_retries, Duration::from_millis(200), || {
            let llm = Arc::clone(&llm);
            let req = req.clone();
            async move { llm.complete(req).await }
        })
        .await;

        let text = match completion {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(error = %e, "mutation planner LLM call failed, defaulting to ADD");
                return Ok(MutationPlan {
                    operations: vec![PlannedOp {
                        action: Action::Add,
                        memory_id: None,
                        content: Some(fact_content.to_string()),
                        reasoning: format!("planner LLM call failed: {e}"),
                    }],
                });
            }
        };

        let known_ids: std::collections::HashSet<&str> = candidates.iter().map(|c| c.id.as_str()).collect();

        match parse_structured::<PlannerResponse>(&text) {
            Ok(parsed) => {
                let operations = parsed
                    .operations
                    .into_iter()
                    .map(|op| validate_op(op, &known_ids, fact_content))
                    .collect();
                Ok(MutationPlan { operations })
            }
            Err(warning) => {
                tracing::warn!(warning = %warning, "mutation planner response failed to parse, defaulting to ADD");
                Ok(MutationPlan {
                    operations: vec![PlannedOp {
                        action: Action::Add,
                        memory_id: None,
                        content: Some(fact_content.to_string()),
                        reasoning: "planner response failed to parse".to_string(),
                    }],
                })
            }
        }
    }
}

/// Downgrades an operation referencing an unknown `memory_id` to `Add`
/// (spec.md §4.4 step 3), logging the downgrade.
fn validate_op(op: RawPlannedOp, known_ids: &std::collections::HashSet<&str>, fact_content: &str) -> PlannedOp {
    let reasoning = op.reasoning.unwrap_or_default();
    let references_known_id = match &op.memory_id {
        Some(id) => known_ids.contains(id.as_str()),
        None => true,
    };
    if matches!(op.action, Action::Update | Action::Delete) && !references_known_id {
        tracing::warn!(memory_id = ?op.memory_id, "planner referenced unknown memory id, downgrading to ADD");
        return PlannedOp {
            action: Action::Add,
            memory_id: None,
            content: Some(fact_content.to_string()),
            reasoning: "referenced an unknown memory id".to_string(),
        };
    }
    PlannedOp { action: op.action, memory_id: op.memory_id, content: op.new_content, reasoning }
}

fn build_user_prompt(fact_content: &str, candidates: &[MemoryFact]) -> String {
    let mut prompt = format!("New fact:\n{fact_content}\n\nCandidate existing memories:\n");
    for c in candidates {
        prompt.push_str(&format!("- id={} content={}\n", c.id, c.content));
    }
    prompt
}
