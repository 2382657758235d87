//! SQLite-backed implementation of the [`super::VectorStore`],
//! [`super::FullTextStore`], [`super::HistoryStore`], [`super::GraphStore`]
//! and [`super::ProfileStore`] contracts.
//!
//! Follows the teacher's reader/writer `Mutex<Connection>` split so the
//! struct stays `Send + Sync` without locking the whole store for concurrent
//! reads, but every query now runs `tokio::task::spawn_blocking` since the
//! store traits are `async fn` (spec.md §4.2, §5).

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use crate::error::{PowerMemError, Result};
use crate::model::{GraphEdge, GraphEntity, HistoryEvent, HistoryEventKind, MemoryFact, MemoryMetadata, Scope, UserProfile};

use super::migrations::apply_migrations;
use super::{Filter, FullTextStore, GraphStore, HistoryStore, Page, ProfileStore, TextParser, VectorStore};

#[cfg(feature = "vector-search")]
use super::vector_index::VectorIndex;

/// SQLite-backed store, implementing every store trait over one database.
pub struct SqliteStore {
    writer: Arc<Mutex<Connection>>,
    reader: Arc<Mutex<Connection>>,
    #[cfg(feature = "vector-search")]
    vector_index: Arc<Mutex<VectorIndex>>,
    dims: usize,
}

/// Runs a blocking closure on the tokio blocking pool, collapsing a join
/// panic into a [`PowerMemError::Fatal`] (spec.md §5: a single panicking
/// task must not take the whole engine down).
async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(e) => Err(PowerMemError::Fatal(format!("store task panicked: {e}"))),
    }
}

fn lock_conn(conn: &Mutex<Connection>) -> Result<std::sync::MutexGuard<'_, Connection>> {
    conn.lock()
        .map_err(|_| PowerMemError::Fatal("connection lock poisoned".to_string()))
}

fn embedding_to_blob(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn blob_to_embedding(b: &[u8]) -> Vec<f32> {
    b.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Strips FTS5 special characters out of a user query and quotes each term
/// as a prefix match, so stray punctuation can't produce an FTS5 syntax
/// error (mirrors the teacher's `sanitize_fts5_query`).
fn sanitize_fts5_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|term| {
            let cleaned: String = term.chars().filter(|c| *c != '"').collect();
            format!("\"{cleaned}\"*")
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn json_to_sql(v: &serde_json::Value) -> SqlValue {
    match v {
        serde_json::Value::Null => SqlValue::Null,
        serde_json::Value::Bool(b) => SqlValue::Integer(if *b { 1 } else { 0 }),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else {
                SqlValue::Real(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

/// Columns of `memories` a [`Filter`] can reference directly; anything else
/// is assumed to be a top-level key under the flattened `metadata` JSON
/// column and compiled as a `json_extract` expression.
const KNOWN_COLUMNS: &[&str] = &[
    "id", "user_id", "agent_id", "run_id", "actor_id", "content", "hash",
    "tier", "importance_score", "retention_strength", "access_count",
    "created_at", "updated_at", "last_accessed",
];

fn column_expr(field: &str) -> String {
    if KNOWN_COLUMNS.contains(&field) {
        field.to_string()
    } else {
        let escaped = field.replace('\'', "");
        format!("json_extract(metadata, '$.{escaped}')")
    }
}

/// Compiles a [`Filter`] tree into a SQL boolean expression plus its bound
/// parameters, in encounter order. `Filter::Scope` intentionally only
/// constrains the identifiers the caller set (spec.md §4.1 group reads):
/// a `Scope { agent_id: Some(_), .. }` with no `user_id` matches every
/// user under that agent.
fn compile_filter(filter: &Filter, params: &mut Vec<SqlValue>) -> String {
    match filter {
        Filter::Eq(field, v) => {
            params.push(json_to_sql(v));
            format!("{} = ?", column_expr(field))
        }
        Filter::Ne(field, v) => {
            params.push(json_to_sql(v));
            format!("{} != ?", column_expr(field))
        }
        Filter::Gt(field, v) => {
            params.push(json_to_sql(v));
            format!("{} > ?", column_expr(field))
        }
        Filter::Gte(field, v) => {
            params.push(json_to_sql(v));
            format!("{} >= ?", column_expr(field))
        }
        Filter::Lt(field, v) => {
            params.push(json_to_sql(v));
            format!("{} < ?", column_expr(field))
        }
        Filter::Lte(field, v) => {
            params.push(json_to_sql(v));
            format!("{} <= ?", column_expr(field))
        }
        Filter::In(field, values) => {
            if values.is_empty() {
                return "0".to_string();
            }
            let placeholders = values.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
            for v in values {
                params.push(json_to_sql(v));
            }
            format!("{} IN ({})", column_expr(field), placeholders)
        }
        Filter::Nin(field, values) => {
            if values.is_empty() {
                return "1".to_string();
            }
            let placeholders = values.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
            for v in values {
                params.push(json_to_sql(v));
            }
            format!("{} NOT IN ({})", column_expr(field), placeholders)
        }
        Filter::Like(field, pattern) => {
            params.push(SqlValue::Text(pattern.clone()));
            format!("{} LIKE ?", column_expr(field))
        }
        Filter::Ilike(field, pattern) => {
            params.push(SqlValue::Text(pattern.to_lowercase()));
            format!("LOWER({}) LIKE ?", column_expr(field))
        }
        Filter::And(filters) => {
            if filters.is_empty() {
                return "1".to_string();
            }
            let parts: Vec<String> = filters.iter().map(|f| compile_filter(f, params)).collect();
            format!("({})", parts.join(" AND "))
        }
        Filter::Or(filters) => {
            if filters.is_empty() {
                return "0".to_string();
            }
            let parts: Vec<String> = filters.iter().map(|f| compile_filter(f, params)).collect();
            format!("({})", parts.join(" OR "))
        }
        Filter::Scope(scope) => {
            let mut parts = Vec::new();
            if let Some(v) = &scope.user_id {
                params.push(SqlValue::Text(v.clone()));
                parts.push("user_id = ?".to_string());
            }
            if let Some(v) = &scope.agent_id {
                params.push(SqlValue::Text(v.clone()));
                parts.push("agent_id = ?".to_string());
            }
            if let Some(v) = &scope.run_id {
                params.push(SqlValue::Text(v.clone()));
                parts.push("run_id = ?".to_string());
            }
            if let Some(v) = &scope.actor_id {
                params.push(SqlValue::Text(v.clone()));
                parts.push("actor_id = ?".to_string());
            }
            if parts.is_empty() {
                "1".to_string()
            } else {
                format!("({})", parts.join(" AND "))
            }
        }
    }
}

/// Strict `column = value` / `column IS NULL` matcher, for tables where a
/// scope is a hard identity (entities, edges, profiles) rather than a
/// group-sharable partition.
fn eq_or_is(col: &str, opt: &Option<String>, params: &mut Vec<SqlValue>) -> String {
    match opt {
        Some(v) => {
            params.push(SqlValue::Text(v.clone()));
            format!("{col} = ?")
        }
        None => format!("{col} IS NULL"),
    }
}

fn scope_identity_clause(scope: &Scope, params: &mut Vec<SqlValue>) -> String {
    let parts = [
        eq_or_is("user_id", &scope.user_id, params),
        eq_or_is("agent_id", &scope.agent_id, params),
        eq_or_is("run_id", &scope.run_id, params),
        eq_or_is("actor_id", &scope.actor_id, params),
    ];
    parts.join(" AND ")
}

/// Like [`scope_identity_clause`] but for `user_profiles`, which has no
/// `actor_id` column (a profile is keyed by `(user_id, agent_id, run_id)`
/// only, spec.md §3).
fn profile_scope_clause(scope: &Scope, params: &mut Vec<SqlValue>) -> String {
    let parts = [
        eq_or_is("user_id", &scope.user_id, params),
        eq_or_is("agent_id", &scope.agent_id, params),
        eq_or_is("run_id", &scope.run_id, params),
    ];
    parts.join(" AND ")
}

fn row_to_fact(row: &Row) -> rusqlite::Result<MemoryFact> {
    let id: String = row.get("id")?;
    let content: String = row.get("content")?;
    let hash: String = row.get("hash")?;
    let embedding_blob: Option<Vec<u8>> = row.get("embedding")?;
    let embedding = embedding_blob.map(|b| blob_to_embedding(&b)).unwrap_or_default();
    let metadata_json: String = row.get("metadata")?;
    let metadata: MemoryMetadata = serde_json::from_str(&metadata_json).unwrap_or_else(|_| MemoryMetadata::new(Utc::now()));
    let scope = Scope {
        user_id: row.get("user_id")?,
        agent_id: row.get("agent_id")?,
        run_id: row.get("run_id")?,
        actor_id: row.get("actor_id")?,
    };
    Ok(MemoryFact {
        id,
        content,
        embedding,
        scope,
        metadata,
        hash,
    })
}

fn row_to_history(row: &Row) -> rusqlite::Result<HistoryEvent> {
    let event_str: String = row.get("event")?;
    let ts_str: String = row.get("ts")?;
    Ok(HistoryEvent {
        event_id: row.get("event_id")?,
        memory_id: row.get("memory_id")?,
        prev_value: row.get("prev_value")?,
        new_value: row.get("new_value")?,
        event: match event_str.as_str() {
            "update" => HistoryEventKind::Update,
            "delete" => HistoryEventKind::Delete,
            _ => HistoryEventKind::Add,
        },
        actor: row.get("actor")?,
        timestamp: DateTime::parse_from_rfc3339(&ts_str).map(|dt| dt.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now()),
    })
}

fn row_to_entity(row: &Row) -> rusqlite::Result<GraphEntity> {
    Ok(GraphEntity {
        id: row.get("id")?,
        name: row.get("name")?,
        entity_type: row.get("entity_type")?,
        scope: Scope {
            user_id: row.get("user_id")?,
            agent_id: row.get("agent_id")?,
            run_id: row.get("run_id")?,
            actor_id: row.get("actor_id")?,
        },
    })
}

fn row_to_edge(row: &Row) -> rusqlite::Result<GraphEdge> {
    let created: String = row.get("created_at")?;
    let updated: String = row.get("updated_at")?;
    Ok(GraphEdge {
        id: row.get("id")?,
        source_entity: row.get("source_id")?,
        relation: row.get("relation")?,
        target_entity: row.get("target_id")?,
        scope: Scope {
            user_id: row.get("user_id")?,
            agent_id: row.get("agent_id")?,
            run_id: row.get("run_id")?,
            actor_id: row.get("actor_id")?,
        },
        mentions: row.get("mentions")?,
        created_at: DateTime::parse_from_rfc3339(&created).map(|dt| dt.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now()),
        updated_at: DateTime::parse_from_rfc3339(&updated).map(|dt| dt.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now()),
    })
}

fn row_to_profile(row: &Row) -> rusqlite::Result<UserProfile> {
    let created: String = row.get("created_at")?;
    let updated: String = row.get("updated_at")?;
    let topics_json: String = row.get("topics")?;
    Ok(UserProfile {
        user_id: row.get("user_id")?,
        agent_id: row.get("agent_id")?,
        run_id: row.get("run_id")?,
        profile_text: row.get("profile_text")?,
        topics: serde_json::from_str(&topics_json).unwrap_or_default(),
        created_at: DateTime::parse_from_rfc3339(&created).map(|dt| dt.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now()),
        updated_at: DateTime::parse_from_rfc3339(&updated).map(|dt| dt.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now()),
    })
}

impl SqliteStore {
    /// Applies the PRAGMAs the teacher tunes its connections with (WAL,
    /// normal sync, a generous page cache, foreign keys on).
    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -64000;
             PRAGMA temp_store = MEMORY;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(())
    }

    /// Opens (creating if absent) the store at `db_path`, or under the
    /// platform data directory when `None` (spec.md §6 `vectorStore.connection`).
    pub fn new(db_path: Option<PathBuf>, dims: usize) -> Result<Self> {
        let path = match db_path {
            Some(p) => p,
            None => {
                let proj_dirs = ProjectDirs::from("dev", "powermem", "powermem")
                    .ok_or_else(|| PowerMemError::Fatal("could not determine project directories".to_string()))?;
                let data_dir = proj_dirs.data_dir();
                std::fs::create_dir_all(data_dir)?;
                data_dir.join("powermem.db")
            }
        };

        let writer_conn = Connection::open(&path)?;
        Self::configure_connection(&writer_conn)?;
        apply_migrations(&writer_conn)?;

        let reader_conn = Connection::open(&path)?;
        Self::configure_connection(&reader_conn)?;

        let store = Self {
            writer: Arc::new(Mutex::new(writer_conn)),
            reader: Arc::new(Mutex::new(reader_conn)),
            #[cfg(feature = "vector-search")]
            vector_index: Arc::new(Mutex::new(VectorIndex::new(dims)?)),
            dims,
        };

        #[cfg(feature = "vector-search")]
        store.load_embeddings_into_index()?;

        Ok(store)
    }

    /// Opens an in-memory store, for tests and short-lived processes.
    ///
    /// A bare `Connection::open_in_memory()` gives every connection its own
    /// private database, which would defeat the reader/writer split; a
    /// named shared-cache URI keeps both connections pointed at the same
    /// in-memory database for the lifetime of this `SqliteStore`.
    pub fn open_in_memory(dims: usize) -> Result<Self> {
        static COUNTER: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
        let n = COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let uri = format!("file:powermem-mem-{n}?mode=memory&cache=shared");

        let flags = rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
            | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
            | rusqlite::OpenFlags::SQLITE_OPEN_URI
            | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let writer_conn = Connection::open_with_flags(&uri, flags)?;
        Self::configure_connection(&writer_conn)?;
        apply_migrations(&writer_conn)?;

        let reader_conn = Connection::open_with_flags(&uri, flags)?;
        Self::configure_connection(&reader_conn)?;

        let store = Self {
            writer: Arc::new(Mutex::new(writer_conn)),
            reader: Arc::new(Mutex::new(reader_conn)),
            #[cfg(feature = "vector-search")]
            vector_index: Arc::new(Mutex::new(VectorIndex::new(dims)?)),
            dims,
        };

        #[cfg(feature = "vector-search")]
        store.load_embeddings_into_index()?;

        Ok(store)
    }

    #[cfg(feature = "vector-search")]
    fn load_embeddings_into_index(&self) -> Result<()> {
        let reader = lock_conn(&self.reader)?;
        let mut stmt = reader.prepare(
            "SELECT id, embedding FROM memories WHERE embedding IS NOT NULL AND embedding_dims = ?1",
        )?;
        let rows: Vec<(String, Vec<u8>)> = stmt
            .query_map(params![self.dims as i64], |row| Ok((row.get(0)?, row.get(1)?)))?
            .filter_map(|r| r.ok())
            .collect();
        drop(stmt);
        drop(reader);

        let mut index = self
            .vector_index
            .lock()
            .map_err(|_| PowerMemError::Fatal("vector index lock poisoned".to_string()))?;
        for (id, blob) in rows {
            if let Ok(key) = id.parse::<u64>() {
                let vector = blob_to_embedding(&blob);
                if let Err(e) = index.upsert(key, &vector) {
                    tracing::warn!(id = %id, error = %e, "failed to load embedding into vector index");
                }
            }
        }
        Ok(())
    }

}

#[async_trait]
impl VectorStore for SqliteStore {
    async fn insert(&self, fact: &MemoryFact) -> Result<()> {
        self.upsert(fact).await
    }

    async fn upsert(&self, fact: &MemoryFact) -> Result<()> {
        let writer = self.writer.clone();
        #[cfg(feature = "vector-search")]
        let vector_index = self.vector_index.clone();
        let dims = self.dims;
        let fact = fact.clone();

        blocking(move || {
            if !fact.embedding.is_empty() && fact.embedding.len() != dims {
                return Err(PowerMemError::Validation(format!(
                    "embedding has {} dims, store configured for {}",
                    fact.embedding.len(),
                    dims
                )));
            }
            let metadata_json = serde_json::to_string(&fact.metadata)
                .map_err(|e| PowerMemError::Fatal(format!("metadata serialization failed: {e}")))?;
            let embedding_blob = if fact.embedding.is_empty() {
                None
            } else {
                Some(embedding_to_blob(&fact.embedding))
            };

            let conn = lock_conn(&writer)?;
            conn.execute(
                "INSERT INTO memories (
                    id, user_id, agent_id, run_id, actor_id, content, hash,
                    embedding, embedding_dims, metadata, tier, importance_score,
                    retention_strength, access_count, created_at, updated_at, last_accessed
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
                ON CONFLICT(id) DO UPDATE SET
                    content = excluded.content,
                    hash = excluded.hash,
                    embedding = excluded.embedding,
                    embedding_dims = excluded.embedding_dims,
                    metadata = excluded.metadata,
                    tier = excluded.tier,
                    importance_score = excluded.importance_score,
                    retention_strength = excluded.retention_strength,
                    access_count = excluded.access_count,
                    updated_at = excluded.updated_at,
                    last_accessed = excluded.last_accessed",
                params![
                    fact.id,
                    fact.scope.user_id,
                    fact.scope.agent_id,
                    fact.scope.run_id,
                    fact.scope.actor_id,
                    fact.content,
                    fact.hash,
                    embedding_blob,
                    fact.embedding.len() as i64,
                    metadata_json,
                    fact.metadata.tier.as_str(),
                    fact.metadata.importance_score,
                    fact.metadata.retention_strength,
                    fact.metadata.access_count,
                    fact.metadata.created_at.to_rfc3339(),
                    fact.metadata.updated_at.to_rfc3339(),
                    fact.metadata.last_accessed.to_rfc3339(),
                ],
            )?;
            drop(conn);

            #[cfg(feature = "vector-search")]
            if !fact.embedding.is_empty() {
                if let Ok(key) = fact.id.parse::<u64>() {
                    let mut index = vector_index
                        .lock()
                        .map_err(|_| PowerMemError::Fatal("vector index lock poisoned".to_string()))?;
                    index.upsert(key, &fact.embedding)?;
                }
            }
            Ok(())
        })
        .await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let writer = self.writer.clone();
        #[cfg(feature = "vector-search")]
        let vector_index = self.vector_index.clone();
        let id = id.to_string();

        blocking(move || {
            let conn = lock_conn(&writer)?;
            conn.execute("DELETE FROM memories WHERE id = ?1", params![id])?;
            drop(conn);

            #[cfg(feature = "vector-search")]
            if let Ok(key) = id.parse::<u64>() {
                let mut index = vector_index
                    .lock()
                    .map_err(|_| PowerMemError::Fatal("vector index lock poisoned".to_string()))?;
                index.remove(key)?;
            }
            Ok(())
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<Option<MemoryFact>> {
        let reader = self.reader.clone();
        let id = id.to_string();
        blocking(move || {
            let conn = lock_conn(&reader)?;
            conn.query_row("SELECT * FROM memories WHERE id = ?1", params![id], row_to_fact)
                .optional()
                .map_err(PowerMemError::from)
        })
        .await
    }

    async fn search(&self, vector: &[f32], k: usize, filter: &Filter) -> Result<Vec<(String, f32, MemoryFact)>> {
        #[cfg(not(feature = "vector-search"))]
        {
            let _ = (vector, k, filter);
            return Ok(vec![]);
        }

        #[cfg(feature = "vector-search")]
        {
            let reader = self.reader.clone();
            let vector_index = self.vector_index.clone();
            let vector = vector.to_vec();
            let filter = filter.clone();

            blocking(move || {
                let mut params: Vec<SqlValue> = Vec::new();
                let where_clause = compile_filter(&filter, &mut params);

                let conn = lock_conn(&reader)?;
                let sql = format!("SELECT id FROM memories WHERE {where_clause}");
                let mut stmt = conn.prepare(&sql)?;
                let allowed: HashSet<String> = stmt
                    .query_map(params_from_iter(params), |row| row.get::<_, String>(0))?
                    .filter_map(|r| r.ok())
                    .collect();
                drop(stmt);

                if allowed.is_empty() {
                    return Ok(vec![]);
                }

                // The HNSW graph isn't scope-aware; over-fetch then filter
                // by the allowed id set, capped so a huge scope can't force
                // an unbounded index scan.
                let candidate_factor = 8;
                let fetch_limit = std::cmp::max(k, std::cmp::min(k.saturating_mul(candidate_factor), 512));
                let index = vector_index
                    .lock()
                    .map_err(|_| PowerMemError::Fatal("vector index lock poisoned".to_string()))?;
                let hits = index.search(&vector, fetch_limit)?;
                drop(index);

                let mut kept: Vec<(String, f32)> = hits
                    .into_iter()
                    .map(|(key, score)| (key.to_string(), score))
                    .filter(|(id, _)| allowed.contains(id))
                    .take(k)
                    .collect();
                kept.sort_by(|a, b| b.1.total_cmp(&a.1));

                let mut out = Vec::with_capacity(kept.len());
                for (id, score) in kept {
                    if let Some(fact) = conn
                        .query_row("SELECT * FROM memories WHERE id = ?1", params![id], row_to_fact)
                        .optional()?
                    {
                        out.push((id, score, fact));
                    }
                }
                Ok(out)
            })
            .await
        }
    }

    async fn list(&self, filter: &Filter, limit: usize, cursor: Option<&str>) -> Result<Page<MemoryFact>> {
        let reader = self.reader.clone();
        let filter = filter.clone();
        let cursor = cursor.map(str::to_string);

        blocking(move || {
            let mut params: Vec<SqlValue> = Vec::new();
            let where_clause = compile_filter(&filter, &mut params);
            let conn = lock_conn(&reader)?;

            let sql = if let Some(after_id) = &cursor {
                params.push(SqlValue::Text(after_id.clone()));
                format!("SELECT * FROM memories WHERE ({where_clause}) AND id > ? ORDER BY id ASC LIMIT {}", limit + 1)
            } else {
                format!("SELECT * FROM memories WHERE ({where_clause}) ORDER BY id ASC LIMIT {}", limit + 1)
            };

            let mut stmt = conn.prepare(&sql)?;
            let mut items: Vec<MemoryFact> = stmt
                .query_map(params_from_iter(params), row_to_fact)?
                .filter_map(|r| r.ok())
                .collect();

            let next_cursor = if items.len() > limit {
                items.truncate(limit);
                items.last().map(|f| f.id.clone())
            } else {
                None
            };

            Ok(Page { items, next_cursor })
        })
        .await
    }
}

#[async_trait]
impl FullTextStore for SqliteStore {
    /// `parser` selects a tokenizer in backends that support one per query;
    /// the `memories_fts` virtual table is built with a single tokenizer
    /// (`unicode61`, migration V1) fixed at table-creation time, so every
    /// `TextParser` variant behaves identically here. Logged rather than
    /// silently ignored, since a caller asking for `Ngram` and getting
    /// `unicode61` word-matching is a real behavioral gap on this backend.
    async fn search(&self, text: &str, k: usize, filter: &Filter, parser: TextParser) -> Result<Vec<(String, f32)>> {
        if !matches!(parser, TextParser::Ik) {
            tracing::debug!(?parser, "sqlite full-text store ignores TextParser; unicode61 tokenizer always applies");
        }

        let reader = self.reader.clone();
        let text = sanitize_fts5_query(text);
        let filter = filter.clone();

        blocking(move || {
            if text.trim().is_empty() {
                return Ok(vec![]);
            }

            let mut params: Vec<SqlValue> = Vec::new();
            let where_clause = compile_filter(&filter, &mut params);
            params.insert(0, SqlValue::Text(text));

            let conn = lock_conn(&reader)?;
            let sql = format!(
                "SELECT m.id, rank FROM memories m
                 JOIN memories_fts fts ON m.rowid = fts.rowid
                 WHERE memories_fts MATCH ?1 AND ({where_clause})
                 ORDER BY rank
                 LIMIT {k}"
            );
            let mut stmt = conn.prepare(&sql)?;
            let results: Vec<(String, f32)> = stmt
                .query_map(params_from_iter(params), |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)? as f32))
                })?
                .filter_map(|r| r.ok())
                // FTS5 `rank` is negative and smaller-is-better; flip and
                // normalize into a positive, descending `[0, 1]` score.
                .map(|(id, rank)| (id, (-rank).max(0.0)))
                .collect();

            if results.is_empty() {
                return Ok(results);
            }
            let max_score = results.iter().map(|(_, s)| *s).fold(0.0_f32, f32::max);
            if max_score > 0.0 {
                Ok(results.into_iter().map(|(id, s)| (id, s / max_score)).collect())
            } else {
                Ok(results)
            }
        })
        .await
    }
}

#[async_trait]
impl HistoryStore for SqliteStore {
    async fn append(&self, event: HistoryEvent) -> Result<()> {
        let writer = self.writer.clone();
        blocking(move || {
            let conn = lock_conn(&writer)?;
            conn.execute(
                "INSERT INTO memory_history (memory_id, event, prev_value, new_value, actor, ts)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    event.memory_id,
                    event.event.as_str(),
                    event.prev_value,
                    event.new_value,
                    event.actor,
                    event.timestamp.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn list(&self, memory_id: &str) -> Result<Vec<HistoryEvent>> {
        let reader = self.reader.clone();
        let memory_id = memory_id.to_string();
        blocking(move || {
            let conn = lock_conn(&reader)?;
            let mut stmt = conn.prepare(
                "SELECT * FROM memory_history WHERE memory_id = ?1 ORDER BY event_id ASC",
            )?;
            let events = stmt
                .query_map(params![memory_id], row_to_history)?
                .filter_map(|r| r.ok())
                .collect();
            Ok(events)
        })
        .await
    }
}

#[async_trait]
impl GraphStore for SqliteStore {
    async fn upsert_entity(&self, entity: &GraphEntity) -> Result<GraphEntity> {
        let writer = self.writer.clone();
        let entity = entity.clone();
        blocking(move || {
            let normalized = GraphEntity::normalize_name(&entity.name);
            let conn = lock_conn(&writer)?;

            let mut scope_params: Vec<SqlValue> = Vec::new();
            let scope_clause = scope_identity_clause(&entity.scope, &mut scope_params);
            let existing: Option<GraphEntity> = {
                let sql = format!(
                    "SELECT * FROM entities WHERE normalized_name = ?1 AND {scope_clause}"
                );
                let mut stmt = conn.prepare(&sql)?;
                let mut all_params: Vec<SqlValue> = vec![SqlValue::Text(normalized.clone())];
                all_params.extend(scope_params);
                stmt.query_row(params_from_iter(all_params), row_to_entity).optional()?
            };

            if let Some(found) = existing {
                return Ok(found);
            }

            conn.execute(
                "INSERT INTO entities (id, name, normalized_name, entity_type, user_id, agent_id, run_id, actor_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    entity.id,
                    entity.name,
                    normalized,
                    entity.entity_type,
                    entity.scope.user_id,
                    entity.scope.agent_id,
                    entity.scope.run_id,
                    entity.scope.actor_id,
                ],
            )?;
            Ok(entity)
        })
        .await
    }

    async fn upsert_edge(&self, edge: &GraphEdge) -> Result<GraphEdge> {
        let writer = self.writer.clone();
        let edge = edge.clone();
        blocking(move || {
            let conn = lock_conn(&writer)?;

            let mut scope_params: Vec<SqlValue> = Vec::new();
            let scope_clause = scope_identity_clause(&edge.scope, &mut scope_params);
            let existing: Option<GraphEdge> = {
                let sql = format!(
                    "SELECT * FROM edges WHERE source_id = ?1 AND target_id = ?2 AND relation = ?3 AND {scope_clause}"
                );
                let mut stmt = conn.prepare(&sql)?;
                let mut all_params: Vec<SqlValue> = vec![
                    SqlValue::Text(edge.source_entity.clone()),
                    SqlValue::Text(edge.target_entity.clone()),
                    SqlValue::Text(edge.relation.clone()),
                ];
                all_params.extend(scope_params);
                stmt.query_row(params_from_iter(all_params), row_to_edge).optional()?
            };

            if let Some(mut found) = existing {
                found.mentions += 1;
                found.updated_at = edge.updated_at;
                conn.execute(
                    "UPDATE edges SET mentions = ?1, updated_at = ?2 WHERE id = ?3",
                    params![found.mentions, found.updated_at.to_rfc3339(), found.id],
                )?;
                return Ok(found);
            }

            conn.execute(
                "INSERT INTO edges (id, source_id, relation, target_id, user_id, agent_id, run_id, actor_id, mentions, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    edge.id,
                    edge.source_entity,
                    edge.relation,
                    edge.target_entity,
                    edge.scope.user_id,
                    edge.scope.agent_id,
                    edge.scope.run_id,
                    edge.scope.actor_id,
                    edge.mentions,
                    edge.created_at.to_rfc3339(),
                    edge.updated_at.to_rfc3339(),
                ],
            )?;
            Ok(edge)
        })
        .await
    }

    async fn delete_edge(&self, id: &str) -> Result<()> {
        let writer = self.writer.clone();
        let id = id.to_string();
        blocking(move || {
            let conn = lock_conn(&writer)?;
            conn.execute("DELETE FROM edges WHERE id = ?1", params![id])?;
            Ok(())
        })
        .await
    }

    async fn find_edge(&self, source: &str, target: &str, scope: &Scope) -> Result<Vec<GraphEdge>> {
        let reader = self.reader.clone();
        let source = source.to_string();
        let target = target.to_string();
        let scope = scope.clone();
        blocking(move || {
            let conn = lock_conn(&reader)?;
            let mut scope_params: Vec<SqlValue> = Vec::new();
            let scope_clause = scope_identity_clause(&scope, &mut scope_params);
            let sql = format!(
                "SELECT * FROM edges WHERE source_id = ?1 AND target_id = ?2 AND {scope_clause}"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut all_params: Vec<SqlValue> = vec![SqlValue::Text(source), SqlValue::Text(target)];
            all_params.extend(scope_params);
            let edges = stmt
                .query_map(params_from_iter(all_params), row_to_edge)?
                .filter_map(|r| r.ok())
                .collect();
            Ok(edges)
        })
        .await
    }

    /// Bounded breadth-first traversal, capped at `max_edges` total edges
    /// returned, expanding outward from `entity`'s name up to `hop` levels
    /// (spec.md §4.6). Runs entirely under one reader connection so the
    /// graph can't shift mid-traversal.
    async fn neighbors(&self, entity: &str, scope: &Scope, hop: u8, max_edges: usize) -> Result<Vec<GraphEdge>> {
        let reader = self.reader.clone();
        let entity = entity.to_string();
        let scope = scope.clone();
        blocking(move || {
            let conn = lock_conn(&reader)?;
            let normalized = GraphEntity::normalize_name(&entity);

            let mut scope_params: Vec<SqlValue> = Vec::new();
            let scope_clause = scope_identity_clause(&scope, &mut scope_params);
            let start_id: Option<String> = {
                let sql = format!("SELECT id FROM entities WHERE normalized_name = ?1 AND {scope_clause}");
                let mut stmt = conn.prepare(&sql)?;
                let mut all_params: Vec<SqlValue> = vec![SqlValue::Text(normalized)];
                all_params.extend(scope_params.clone());
                stmt.query_row(params_from_iter(all_params), |row| row.get(0)).optional()?
            };

            let Some(start_id) = start_id else {
                return Ok(vec![]);
            };

            let mut frontier: HashSet<String> = HashSet::from([start_id]);
            let mut visited_entities: HashSet<String> = frontier.clone();
            let mut seen_edges: HashSet<String> = HashSet::new();
            let mut results: Vec<GraphEdge> = Vec::new();

            for _ in 0..hop {
                if frontier.is_empty() || results.len() >= max_edges {
                    break;
                }
                let placeholders = frontier.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
                let mut scope_params: Vec<SqlValue> = Vec::new();
                let scope_clause = scope_identity_clause(&scope, &mut scope_params);
                let sql = format!(
                    "SELECT * FROM edges WHERE (source_id IN ({placeholders}) OR target_id IN ({placeholders})) AND {scope_clause}"
                );
                let mut stmt = conn.prepare(&sql)?;
                let mut all_params: Vec<SqlValue> = frontier.iter().map(|id| SqlValue::Text(id.clone())).collect();
                all_params.extend(frontier.iter().map(|id| SqlValue::Text(id.clone())));
                all_params.extend(scope_params);

                let edges: Vec<GraphEdge> = stmt
                    .query_map(params_from_iter(all_params), row_to_edge)?
                    .filter_map(|r| r.ok())
                    .collect();

                let mut next_frontier = HashSet::new();
                for edge in edges {
                    if results.len() >= max_edges {
                        break;
                    }
                    if seen_edges.insert(edge.id.clone()) {
                        if visited_entities.insert(edge.target_entity.clone()) {
                            next_frontier.insert(edge.target_entity.clone());
                        }
                        if visited_entities.insert(edge.source_entity.clone()) {
                            next_frontier.insert(edge.source_entity.clone());
                        }
                        results.push(edge);
                    }
                }
                frontier = next_frontier;
            }

            Ok(results)
        })
        .await
    }
}

#[async_trait]
impl ProfileStore for SqliteStore {
    async fn get(&self, scope: &Scope) -> Result<Option<UserProfile>> {
        let reader = self.reader.clone();
        let scope = scope.clone();
        blocking(move || {
            let conn = lock_conn(&reader)?;
            let mut params: Vec<SqlValue> = Vec::new();
            let clause = profile_scope_clause(&scope, &mut params);
            let sql = format!("SELECT * FROM user_profiles WHERE {clause}");
            conn.query_row(&sql, params_from_iter(params), row_to_profile)
                .optional()
                .map_err(PowerMemError::from)
        })
        .await
    }

    async fn upsert(&self, profile: &UserProfile) -> Result<()> {
        let writer = self.writer.clone();
        let profile = profile.clone();
        blocking(move || {
            let conn = lock_conn(&writer)?;
            let topics_json = serde_json::to_string(&profile.topics)
                .map_err(|e| PowerMemError::Fatal(format!("topics serialization failed: {e}")))?;
            conn.execute(
                "INSERT INTO user_profiles (id, user_id, agent_id, run_id, profile_text, topics, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET
                    profile_text = excluded.profile_text,
                    topics = excluded.topics,
                    updated_at = excluded.updated_at",
                params![
                    format!("{}:{}:{}", profile.user_id, profile.agent_id.as_deref().unwrap_or(""), profile.run_id.as_deref().unwrap_or("")),
                    profile.user_id,
                    profile.agent_id,
                    profile.run_id,
                    profile.profile_text,
                    topics_json,
                    profile.created_at.to_rfc3339(),
                    profile.updated_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, scope: &Scope) -> Result<()> {
        let writer = self.writer.clone();
        let scope = scope.clone();
        blocking(move || {
            let conn = lock_conn(&writer)?;
            let mut params: Vec<SqlValue> = Vec::new();
            let clause = profile_scope_clause(&scope, &mut params);
            let sql = format!("DELETE FROM user_profiles WHERE {clause}");
            conn.execute(&sql, params_from_iter(params))?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MemoryFact, MemoryMetadata};

    fn fact(id: &str, content: &str, scope: Scope, embedding: Vec<f32>) -> MemoryFact {
        let now = Utc::now();
        MemoryFact {
            id: id.to_string(),
            content: content.to_string(),
            embedding,
            scope,
            metadata: MemoryMetadata::new(now),
            hash: MemoryFact::content_hash(content),
        }
    }

    fn user_scope(user: &str) -> Scope {
        Scope {
            user_id: Some(user.to_string()),
            agent_id: None,
            run_id: None,
            actor_id: None,
        }
    }

    #[tokio::test]
    async fn insert_and_get_roundtrip() {
        let store = SqliteStore::open_in_memory(4).unwrap();
        let f = fact("1", "likes coffee", user_scope("u1"), vec![0.1, 0.2, 0.3, 0.4]);
        store.insert(&f).await.unwrap();

        let got = store.get("1").await.unwrap().unwrap();
        assert_eq!(got.content, "likes coffee");
        assert_eq!(got.embedding, vec![0.1, 0.2, 0.3, 0.4]);
    }

    #[tokio::test]
    async fn upsert_overwrites_content() {
        let store = SqliteStore::open_in_memory(4).unwrap();
        let mut f = fact("1", "likes coffee", user_scope("u1"), vec![0.1, 0.2, 0.3, 0.4]);
        store.insert(&f).await.unwrap();

        f.content = "likes tea".to_string();
        store.upsert(&f).await.unwrap();

        let got = store.get("1").await.unwrap().unwrap();
        assert_eq!(got.content, "likes tea");
    }

    #[tokio::test]
    async fn delete_removes_row() {
        let store = SqliteStore::open_in_memory(4).unwrap();
        let f = fact("1", "likes coffee", user_scope("u1"), vec![0.1, 0.2, 0.3, 0.4]);
        store.insert(&f).await.unwrap();
        store.delete("1").await.unwrap();
        assert!(store.get("1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_respects_scope_filter() {
        let store = SqliteStore::open_in_memory(4).unwrap();
        store.insert(&fact("1", "a", user_scope("u1"), vec![0.1, 0.2, 0.3, 0.4])).await.unwrap();
        store.insert(&fact("2", "b", user_scope("u2"), vec![0.1, 0.2, 0.3, 0.4])).await.unwrap();

        let page = store
            .list(&Filter::Scope(user_scope("u1")), 10, None)
            .await
            .unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].id, "1");
    }

    #[cfg(feature = "vector-search")]
    #[tokio::test]
    async fn vector_search_filters_by_scope() {
        let store = SqliteStore::open_in_memory(4).unwrap();
        store.insert(&fact("1", "a", user_scope("u1"), vec![1.0, 0.0, 0.0, 0.0])).await.unwrap();
        store.insert(&fact("2", "b", user_scope("u2"), vec![1.0, 0.0, 0.0, 0.0])).await.unwrap();

        let results = store
            .search(&[1.0, 0.0, 0.0, 0.0], 10, &Filter::Scope(user_scope("u1")))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "1");
    }

    #[tokio::test]
    async fn history_events_are_ordered() {
        let store = SqliteStore::open_in_memory(4).unwrap();
        store
            .append(HistoryEvent {
                event_id: 0,
                memory_id: "1".to_string(),
                prev_value: None,
                new_value: Some("a".to_string()),
                event: HistoryEventKind::Add,
                actor: None,
                timestamp: Utc::now(),
            })
            .await
            .unwrap();
        store
            .append(HistoryEvent {
                event_id: 0,
                memory_id: "1".to_string(),
                prev_value: Some("a".to_string()),
                new_value: Some("b".to_string()),
                event: HistoryEventKind::Update,
                actor: None,
                timestamp: Utc::now(),
            })
            .await
            .unwrap();

        let events = store.list("1").await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event, HistoryEventKind::Add);
        assert_eq!(events[1].event, HistoryEventKind::Update);
    }

    #[tokio::test]
    async fn upsert_entity_dedupes_by_normalized_name() {
        let store = SqliteStore::open_in_memory(4).unwrap();
        let scope = user_scope("u1");
        let e1 = GraphEntity { id: "e1".to_string(), name: "Alice".to_string(), entity_type: None, scope: scope.clone() };
        let e2 = GraphEntity { id: "e2".to_string(), name: "ALICE".to_string(), entity_type: None, scope: scope.clone() };

        let first = store.upsert_entity(&e1).await.unwrap();
        let second = store.upsert_entity(&e2).await.unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn upsert_edge_increments_mentions_on_reobservation() {
        let store = SqliteStore::open_in_memory(4).unwrap();
        let scope = user_scope("u1");
        store
            .upsert_entity(&GraphEntity { id: "alice".to_string(), name: "Alice".to_string(), entity_type: None, scope: scope.clone() })
            .await
            .unwrap();
        store
            .upsert_entity(&GraphEntity { id: "bob".to_string(), name: "Bob".to_string(), entity_type: None, scope: scope.clone() })
            .await
            .unwrap();

        let now = Utc::now();
        let edge = GraphEdge {
            id: "edge1".to_string(),
            source_entity: "alice".to_string(),
            relation: "knows".to_string(),
            target_entity: "bob".to_string(),
            scope: scope.clone(),
            mentions: 1,
            created_at: now,
            updated_at: now,
        };
        let first = store.upsert_edge(&edge).await.unwrap();
        assert_eq!(first.mentions, 1);

        let second = store.upsert_edge(&edge).await.unwrap();
        assert_eq!(second.mentions, 2);
        assert_eq!(second.id, first.id);
    }

    #[tokio::test]
    async fn neighbors_traverses_one_hop() {
        let store = SqliteStore::open_in_memory(4).unwrap();
        let scope = user_scope("u1");
        store
            .upsert_entity(&GraphEntity { id: "alice".to_string(), name: "Alice".to_string(), entity_type: None, scope: scope.clone() })
            .await
            .unwrap();
        store
            .upsert_entity(&GraphEntity { id: "bob".to_string(), name: "Bob".to_string(), entity_type: None, scope: scope.clone() })
            .await
            .unwrap();

        let now = Utc::now();
        store
            .upsert_edge(&GraphEdge {
                id: "edge1".to_string(),
                source_entity: "alice".to_string(),
                relation: "knows".to_string(),
                target_entity: "bob".to_string(),
                scope: scope.clone(),
                mentions: 1,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();

        let edges = store.neighbors("Alice", &scope, 1, 10).await.unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].relation, "knows");
    }

    #[tokio::test]
    async fn profile_upsert_is_idempotent_per_scope() {
        let store = SqliteStore::open_in_memory(4).unwrap();
        let scope = user_scope("u1");
        let now = Utc::now();
        let profile = UserProfile {
            user_id: "u1".to_string(),
            agent_id: None,
            run_id: None,
            profile_text: "likes coffee".to_string(),
            topics: vec!["coffee".to_string()],
            created_at: now,
            updated_at: now,
        };
        store.upsert(&profile).await.unwrap();
        store.upsert(&profile).await.unwrap();

        let got = store.get(&scope).await.unwrap().unwrap();
        assert_eq!(got.profile_text, "likes coffee");
    }
}
