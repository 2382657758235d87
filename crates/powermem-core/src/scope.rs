//! Scope Resolver (C1)
//!
//! Derives canonical partition keys and access rules from the raw
//! `(user_id, agent_id, run_id, actor_id)` identifiers a caller supplies.
//! Pure and side-effect-free so it can be tested exhaustively without a
//! store.

use crate::error::{PowerMemError, Result};
use crate::model::Scope;

/// Raw, caller-supplied identifiers before canonicalization.
#[derive(Debug, Clone, Default)]
pub struct RawScope {
    pub user_id: Option<String>,
    pub agent_id: Option<String>,
    pub run_id: Option<String>,
    pub actor_id: Option<String>,
}

/// Whether a read is permitted to span every scope (internal maintenance
/// jobs only — external callers must always supply at least one identifier).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadAccess {
    /// Ordinary external caller; an empty scope is rejected.
    Scoped,
    /// Internal caller (e.g. a maintenance sweep) explicitly opting into an
    /// unfiltered read across all scopes.
    Unfiltered,
}

fn canonicalize(raw: Option<String>) -> Option<String> {
    match raw {
        Some(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(_) => {
            tracing::debug!("scope identifier dropped: empty or whitespace-only");
            None
        }
        None => None,
    }
}

/// Canonicalizes a [`RawScope`] into a [`Scope`], dropping empty/whitespace
/// identifiers (spec.md §4.1 "Canonicalization").
pub fn canonicalize_scope(raw: RawScope) -> Scope {
    Scope {
        user_id: canonicalize(raw.user_id),
        agent_id: canonicalize(raw.agent_id),
        run_id: canonicalize(raw.run_id),
        actor_id: canonicalize(raw.actor_id),
    }
}

/// Validates that a scope is acceptable for a write.
///
/// Writes require at least one of `user_id` or `agent_id` (spec.md §4.1).
pub fn require_write_scope(scope: &Scope) -> Result<()> {
    if scope.user_id.is_none() && scope.agent_id.is_none() {
        return Err(PowerMemError::Validation(
            "write requires at least one of user_id or agent_id".to_string(),
        ));
    }
    Ok(())
}

/// Validates that a scope is acceptable for a read, given the caller's
/// access class.
///
/// External callers must supply at least one identifier; only an internal
/// caller that explicitly requests [`ReadAccess::Unfiltered`] may read with
/// an empty scope (spec.md §4.1).
pub fn require_read_scope(scope: &Scope, access: ReadAccess) -> Result<()> {
    if scope.is_empty() && access == ReadAccess::Scoped {
        return Err(PowerMemError::Validation(
            "read requires at least one scope identifier unless explicitly unfiltered".to_string(),
        ));
    }
    Ok(())
}

/// Whether a read scope is a "group" read that spans multiple users or
/// multiple agents, per the sharing rules in spec.md §4.1:
///
/// - `agent_id` set, `user_id` absent → agent-group memory (spans all users
///   under that agent).
/// - `user_id` set, `agent_id` absent → user-group memory (spans all agents
///   for that user).
/// - all three identifiers present → strictly scoped, no group sharing.
pub fn is_group_read(scope: &Scope) -> bool {
    match (&scope.user_id, &scope.agent_id) {
        (None, Some(_)) => true,
        (Some(_), None) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(user: Option<&str>, agent: Option<&str>) -> RawScope {
        RawScope {
            user_id: user.map(str::to_string),
            agent_id: agent.map(str::to_string),
            run_id: None,
            actor_id: None,
        }
    }

    #[test]
    fn whitespace_identifiers_are_dropped() {
        let scope = canonicalize_scope(raw(Some("   "), Some("a1")));
        assert!(scope.user_id.is_none());
        assert_eq!(scope.agent_id.as_deref(), Some("a1"));
    }

    #[test]
    fn write_requires_user_or_agent() {
        let empty = Scope::empty();
        assert!(require_write_scope(&empty).is_err());

        let with_user = canonicalize_scope(raw(Some("u1"), None));
        assert!(require_write_scope(&with_user).is_ok());
    }

    #[test]
    fn read_requires_scope_unless_unfiltered() {
        let empty = Scope::empty();
        assert!(require_read_scope(&empty, ReadAccess::Scoped).is_err());
        assert!(require_read_scope(&empty, ReadAccess::Unfiltered).is_ok());
    }

    #[test]
    fn group_reads_detected() {
        let agent_only = canonicalize_scope(raw(None, Some("a1")));
        assert!(is_group_read(&agent_only));

        let user_only = canonicalize_scope(raw(Some("u1"), None));
        assert!(is_group_read(&user_only));

        let both = canonicalize_scope(raw(Some("u1"), Some("a1")));
        assert!(!is_group_read(&both));
    }
}
