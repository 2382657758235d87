//! GraphEntity / GraphEdge — the knowledge graph maintained by `crate::graph`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Scope;

/// A named entity, unique per `(normalized_name, scope)` (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphEntity {
    pub id: String,
    pub name: String,
    pub entity_type: Option<String>,
    pub scope: Scope,
}

impl GraphEntity {
    pub fn normalize_name(name: &str) -> String {
        name.trim().to_lowercase()
    }
}

/// A directed, typed relation between two entities in the same scope.
///
/// `mentions` is bumped every time the same `(source, relation, target)`
/// triple is reobserved during ingestion (spec.md §3, §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphEdge {
    pub id: String,
    pub source_entity: String,
    pub relation: String,
    pub target_entity: String,
    pub scope: Scope,
    pub mentions: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
