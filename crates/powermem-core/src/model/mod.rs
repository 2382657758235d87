//! Core data model: knowledge facts, history, graph entities/edges, profiles.
//!
//! Combines the lifecycle state a memory fact carries (tier, retention
//! strength, access bookkeeping) with the scope it is partitioned under.

mod fact;
mod graph;
mod history;
mod profile;

pub use fact::{MemoryFact, MemoryFactInput, MemoryMetadata, Tier};
pub use graph::{GraphEdge, GraphEntity};
pub use history::{HistoryEvent, HistoryEventKind};
pub use profile::UserProfile;

use serde::{Deserialize, Serialize};

/// Tenant partition: `(user_id, agent_id, run_id, actor_id)`.
///
/// Empty/whitespace-only identifiers are canonicalized to `None` by
/// [`crate::scope::ScopeResolver`] before a `Scope` is ever constructed, so
/// every `Scope` value in the system is already canonical.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub user_id: Option<String>,
    pub agent_id: Option<String>,
    pub run_id: Option<String>,
    pub actor_id: Option<String>,
}

impl Scope {
    /// A scope with no identifiers set at all.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether this scope carries no identifiers whatsoever.
    pub fn is_empty(&self) -> bool {
        self.user_id.is_none()
            && self.agent_id.is_none()
            && self.run_id.is_none()
            && self.actor_id.is_none()
    }
}
