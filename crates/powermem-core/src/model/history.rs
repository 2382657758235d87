//! HistoryEvent — append-only audit trail for every mutating operation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The three mutation kinds a [`HistoryEvent`] can record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryEventKind {
    Add,
    Update,
    Delete,
}

impl HistoryEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            HistoryEventKind::Add => "add",
            HistoryEventKind::Update => "update",
            HistoryEventKind::Delete => "delete",
        }
    }
}

/// One append-only record of a mutation against a [`crate::model::MemoryFact`].
///
/// Invariant: every mutating operation writes exactly one `HistoryEvent`
/// (spec.md §3), and events for a given `memory_id` are strictly ordered.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEvent {
    pub event_id: i64,
    pub memory_id: String,
    pub prev_value: Option<String>,
    pub new_value: Option<String>,
    pub event: HistoryEventKind,
    pub actor: Option<String>,
    pub timestamp: DateTime<Utc>,
}
