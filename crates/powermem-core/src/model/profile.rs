//! UserProfile — the consolidated natural-language profile built by `crate::profile_builder`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// At most one profile exists per `(user_id, agent_id, run_id)` triple
/// (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub user_id: String,
    pub agent_id: Option<String>,
    pub run_id: Option<String>,
    pub profile_text: String,
    pub topics: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
