//! PowerMem core: a persistent memory substrate for LLM applications.
//!
//! Combines hybrid (vector + full-text + graph) retrieval, an Ebbinghaus
//! forgetting-curve lifecycle, and a consolidated user profile behind one
//! engine facade (`crate::engine::MemoryEngine`). See `DESIGN.md` at the
//! workspace root for how each component is grounded.

pub mod config;
pub mod ebbinghaus;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod extract;
pub mod graph;
pub mod llm;
pub mod model;
pub mod planner;
pub mod profile_builder;
pub mod retrieval;
pub mod retry;
pub mod scope;
pub mod store;

pub use config::EngineConfig;
pub use engine::{AddOutcome, FactResult, FactUpdate, MemoryEngine, SearchHit, SearchOutcome};
pub use error::{PowerMemError, Result};
pub use model::{MemoryFact, Scope, Tier};
pub use scope::RawScope;
