//! Typed engine configuration.
//!
//! A single typed record replaces the source system's per-instance config
//! dictionaries and dynamic provider-by-name loading (REDESIGN FLAGS,
//! spec.md §9): every provider variant is a Rust enum/struct field, and the
//! only untyped escape hatch is the narrow `extra` maps on individual
//! sub-configs, for pass-through tuning knobs that don't warrant a typed
//! field yet.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Top-level engine configuration (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    pub llm: LlmConfig,
    pub embedder: EmbedderConfig,
    pub vector_store: VectorStoreConfig,
    pub graph_store: GraphStoreConfig,
    pub intelligent_memory: IntelligentMemoryConfig,
    pub fusion: FusionConfig,
    pub prompts: PromptsConfig,
    pub concurrency: ConcurrencyConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            llm: LlmConfig::default(),
            embedder: EmbedderConfig::default(),
            vector_store: VectorStoreConfig::default(),
            graph_store: GraphStoreConfig::default(),
            intelligent_memory: IntelligentMemoryConfig::default(),
            fusion: FusionConfig::default(),
            prompts: PromptsConfig::default(),
            concurrency: ConcurrencyConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmConfig {
    pub provider: String,
    pub model: String,
    pub temperature: f32,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub extra: BTreeMap<String, Value>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            temperature: 0.0,
            api_key: None,
            base_url: None,
            max_tokens: None,
            extra: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbedderConfig {
    pub provider: String,
    pub model: String,
    /// Required and immutable per store (spec.md §3 invariants).
    pub dims: usize,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            provider: "local".to_string(),
            model: "nomic-ai/nomic-embed-text-v1.5".to_string(),
            dims: 256,
            api_key: None,
            base_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorStoreConfig {
    pub provider: String,
    pub collection: String,
    pub connection: Option<String>,
    pub index_type: String,
    pub metric: String,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            provider: "sqlite".to_string(),
            collection: "memories".to_string(),
            connection: None,
            index_type: "hnsw".to_string(),
            metric: "cosine".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphStoreConfig {
    pub enabled: bool,
    pub provider: String,
    pub connection: Option<String>,
    pub max_hop: u8,
    pub max_edges_per_hop: usize,
}

impl Default for GraphStoreConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            provider: "sqlite".to_string(),
            connection: None,
            max_hop: 2,
            max_edges_per_hop: 20,
        }
    }
}

/// Thresholds the Ebbinghaus manager (`crate::ebbinghaus`) uses (spec.md §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntelligentMemoryConfig {
    pub enabled: bool,
    /// λ in `R(t) = max(R_min, exp(-λ·t/S))`. Default chosen so `R(1h) = 0.44`.
    pub retention_lambda: f64,
    pub r_min: f64,
    pub r_reinforce_alpha: f64,
    pub s_max: f64,
    pub archive_grace_days: i64,
    pub working_to_short_term_access_count: i64,
    pub short_term_to_long_term_access_count: i64,
    pub short_term_to_long_term_strength: f64,
    pub short_term_to_archived_retention: f64,
    /// Open Question (spec.md §9): whether LONG_TERM can ever be archived by
    /// sustained inactivity alone. Defaults to `false` ("never"), per the
    /// spec's own recommendation.
    pub allow_long_term_decay: bool,
}

impl Default for IntelligentMemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            // -ln(0.44) ≈ 0.8210
            retention_lambda: -(0.44_f64.ln()),
            r_min: 0.20,
            r_reinforce_alpha: 0.25,
            s_max: 10.0,
            archive_grace_days: 30,
            working_to_short_term_access_count: 3,
            short_term_to_long_term_access_count: 10,
            short_term_to_long_term_strength: 3.0,
            short_term_to_archived_retention: 0.25,
            allow_long_term_decay: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FusionMethod {
    #[default]
    Rrf,
    Weighted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FusionConfig {
    pub method: FusionMethod,
    /// (vector, text, graph)
    pub weights: (f32, f32, f32),
    pub rrf_k: f32,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            method: FusionMethod::Rrf,
            weights: (0.6, 0.3, 0.1),
            rrf_k: 60.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptsConfig {
    pub fact_extraction: Option<String>,
    pub update_memory: Option<String>,
    pub importance_evaluation: Option<String>,
    pub extract_relations: Option<String>,
    pub update_graph: Option<String>,
    pub delete_relations: Option<String>,
    pub profile_consolidation: Option<String>,
}

impl Default for PromptsConfig {
    fn default() -> Self {
        Self {
            fact_extraction: None,
            update_memory: None,
            importance_evaluation: None,
            extract_relations: None,
            update_graph: None,
            delete_relations: None,
            profile_consolidation: None,
        }
    }
}

/// Engine-owned worker pool and timeout configuration (spec.md §5).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConcurrencyConfig {
    pub max_in_flight: usize,
    #[serde(with = "duration_secs")]
    pub backend_timeout: Duration,
    pub lock_stripes: usize,
    pub llm_max_retries: u32,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 32,
            backend_timeout: Duration::from_secs(30),
            lock_stripes: 1024,
            llm_max_retries: 3,
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_retention_lambda_matches_spec() {
        let cfg = IntelligentMemoryConfig::default();
        let r1h = (-cfg.retention_lambda).exp();
        assert!((r1h - 0.44).abs() < 1e-6);
    }

    #[test]
    fn long_term_decay_defaults_to_never() {
        assert!(!IntelligentMemoryConfig::default().allow_long_term_decay);
    }
}
