//! MemoryFact — the atomic, self-contained unit of memory.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Scope;

/// Coarse lifecycle state of a fact (see the Ebbinghaus manager, `crate::ebbinghaus`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Newly created, not yet reinforced enough to promote.
    #[default]
    Working,
    ShortTerm,
    LongTerm,
    Archived,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Working => "working",
            Tier::ShortTerm => "short_term",
            Tier::LongTerm => "long_term",
            Tier::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "short_term" => Tier::ShortTerm,
            "long_term" => Tier::LongTerm,
            "archived" => Tier::Archived,
            _ => Tier::Working,
        }
    }
}

/// Open-ended key/value metadata. Fields the engine actually reasons about
/// are typed; anything else a caller attaches rides along in `extra`.
///
/// Combines typed and untyped config the way a single config record should
/// (REDESIGN FLAGS, spec.md §9) rather than blending them ad hoc per call site.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryMetadata {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    #[serde(default)]
    pub access_count: i64,
    #[serde(default = "default_importance")]
    pub importance_score: f64,
    #[serde(default)]
    pub memory_type: Option<String>,
    #[serde(default)]
    pub retention_strength: f64,
    #[serde(default)]
    pub tier: Tier,
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

fn default_importance() -> f64 {
    0.5
}

impl MemoryMetadata {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            created_at: now,
            updated_at: now,
            last_accessed: now,
            access_count: 0,
            importance_score: default_importance(),
            memory_type: None,
            retention_strength: 1.0,
            tier: Tier::Working,
            extra: BTreeMap::new(),
        }
    }
}

/// An atomic, standalone natural-language statement derived from a
/// conversation (or supplied verbatim when extraction is bypassed).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryFact {
    /// Time-ordered 64-bit id, serialized as a decimal string at the API
    /// boundary (see `crate::store::id`).
    pub id: String,
    pub content: String,
    /// Dense embedding vector; length is a store-level invariant
    /// (`embedding.len() == store.configured_dim`, spec.md §3).
    pub embedding: Vec<f32>,
    pub scope: Scope,
    pub metadata: MemoryMetadata,
    /// Content fingerprint used for idempotent re-ingestion (spec.md §4.4 step 4).
    pub hash: String,
}

impl MemoryFact {
    pub fn content_hash(content: &str) -> String {
        use std::hash::{Hash, Hasher};
        // A fast, stable fingerprint is sufficient here: the hash is only
        // ever compared for equality within one store's scope, never used
        // as a security boundary.
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        content.trim().to_lowercase().hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }
}

/// Caller-supplied content for a single fact before it has an id or embedding.
#[derive(Debug, Clone)]
pub struct MemoryFactInput {
    pub content: String,
    pub memory_type: Option<String>,
    pub source: Option<String>,
}
