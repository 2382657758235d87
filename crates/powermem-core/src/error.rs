//! Error kinds surfaced uniformly across the engine.
//!
//! Mirrors the error taxonomy of the memory engine specification: most kinds
//! propagate to the caller, `ParseWarning` is logged and swallowed (it never
//! appears as an `Err` — see [`crate::extract`] and [`crate::planner`]), and
//! `Fatal` is never retried or auto-recovered.

use thiserror::Error;

/// Unified error type for every public `powermem_core` operation.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum PowerMemError {
    /// Bad input: missing scope on a write, vector dimension mismatch caught
    /// at the API boundary, oversize content, malformed filter.
    #[error("validation error: {0}")]
    Validation(String),

    /// The requested id does not exist in the store.
    #[error("not found: {0}")]
    NotFound(String),

    /// A store or LLM call failed transiently, including after retries.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A compare-and-set race was lost; the caller may retry.
    #[error("conflict: {0}")]
    Conflict(String),

    /// An invariant was violated (e.g. embedding dimension mismatch against
    /// the store's configured dimension). Never auto-recovered.
    #[error("fatal invariant violation: {0}")]
    Fatal(String),
}

impl From<rusqlite::Error> for PowerMemError {
    fn from(err: rusqlite::Error) -> Self {
        PowerMemError::BackendUnavailable(format!("sqlite: {err}"))
    }
}

impl From<std::io::Error> for PowerMemError {
    fn from(err: std::io::Error) -> Self {
        PowerMemError::BackendUnavailable(format!("io: {err}"))
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PowerMemError>;
