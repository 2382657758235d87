//! Store Abstractions (C2)
//!
//! Uniform async contracts over vector, full-text, history, graph, and
//! profile backends. `Filter` is the sole authorization gate exposed to any
//! backend (spec.md §4.2): every query a component issues is expressed as a
//! `Filter`, compiled by the backend into its native query language.

pub mod id;
pub mod migrations;
pub mod sqlite;
#[cfg(feature = "vector-search")]
pub mod vector_index;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{GraphEdge, GraphEntity, HistoryEvent, MemoryFact, Scope, UserProfile};

/// A single comparison or boolean combinator over scope fields and
/// free-form metadata (spec.md §4.2).
#[derive(Debug, Clone)]
pub enum Filter {
    Eq(String, serde_json::Value),
    Ne(String, serde_json::Value),
    Gt(String, serde_json::Value),
    Gte(String, serde_json::Value),
    Lt(String, serde_json::Value),
    Lte(String, serde_json::Value),
    In(String, Vec<serde_json::Value>),
    Nin(String, Vec<serde_json::Value>),
    Like(String, String),
    Ilike(String, String),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    /// Scopes the query to the given partition. Always ANDed in by the
    /// caller; never something a caller can override from free-form input.
    Scope(Scope),
}

impl Filter {
    pub fn and(filters: impl IntoIterator<Item = Filter>) -> Filter {
        Filter::And(filters.into_iter().collect())
    }
}

/// A page of results plus an opaque cursor for the next page, or `None` if
/// there isn't one.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

/// Dense vector storage and approximate-nearest-neighbor search.
///
/// Scores are normalized similarity in `[0, 1]`, higher is better, regardless
/// of the backend's native distance metric (spec.md §4.2).
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn insert(&self, fact: &MemoryFact) -> Result<()>;
    async fn upsert(&self, fact: &MemoryFact) -> Result<()>;
    async fn delete(&self, id: &str) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Option<MemoryFact>>;
    async fn search(
        &self,
        vector: &[f32],
        k: usize,
        filter: &Filter,
    ) -> Result<Vec<(String, f32, MemoryFact)>>;
    async fn list(&self, filter: &Filter, limit: usize, cursor: Option<&str>) -> Result<Page<MemoryFact>>;
}

/// Lexical (BM25/FTS) search, possibly backed by the same physical store as
/// [`VectorStore`].
#[async_trait]
pub trait FullTextStore: Send + Sync {
    async fn search(
        &self,
        text: &str,
        k: usize,
        filter: &Filter,
        parser: TextParser,
    ) -> Result<Vec<(String, f32)>>;
}

/// Full-text tokenizer/parser selection (spec.md §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextParser {
    Ik,
    Ngram,
    Ngram2,
    Beng,
    Space,
}

/// Append-only mutation audit trail.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append(&self, event: HistoryEvent) -> Result<()>;
    async fn list(&self, memory_id: &str) -> Result<Vec<HistoryEvent>>;
}

/// Entity/relation storage and bounded traversal.
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn upsert_entity(&self, entity: &GraphEntity) -> Result<GraphEntity>;
    async fn upsert_edge(&self, edge: &GraphEdge) -> Result<GraphEdge>;
    async fn delete_edge(&self, id: &str) -> Result<()>;
    async fn find_edge(
        &self,
        source: &str,
        target: &str,
        scope: &Scope,
    ) -> Result<Vec<GraphEdge>>;
    async fn neighbors(
        &self,
        entity: &str,
        scope: &Scope,
        hop: u8,
        max_edges: usize,
    ) -> Result<Vec<GraphEdge>>;
}

/// Per-`(user_id, agent_id, run_id)` natural-language profile storage.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn get(&self, scope: &Scope) -> Result<Option<UserProfile>>;
    async fn upsert(&self, profile: &UserProfile) -> Result<()>;
    async fn delete(&self, scope: &Scope) -> Result<()>;
}
