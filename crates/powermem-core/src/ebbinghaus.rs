//! Ebbinghaus Manager (C7, spec.md §4.7).
//!
//! Replaces the teacher's FSRS-6 scheduler with the simpler, fully-specified
//! forgetting curve named in the spec (`R(t) = max(R_min, exp(-λ·t/S))`),
//! keeping the teacher's `retrievability_with_decay` shape (elapsed time +
//! per-item strength in, retention fraction out) and its
//! `strengthen_batch_on_access`/`run_consolidation`/`gc_below_retention`
//! structure for reinforcement, promotion, and cleanup.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use crate::config::IntelligentMemoryConfig;
use crate::error::Result;
use crate::llm::{parse_structured, prompts, LlmClient, LlmRequest};
use crate::model::{HistoryEvent, HistoryEventKind, MemoryFact, Tier};
use crate::retry::with_backoff;
use crate::store::{Filter, HistoryStore, VectorStore};

/// A tolerance below which a retention value is treated as "at the floor"
/// for archival cleanup purposes (spec.md §4.7 "Cleanup").
const RETENTION_EPSILON: f64 = 1e-6;

/// `R(t) = max(R_min, exp(-λ·t/S))`. `elapsed_hours` is time since
/// `last_accessed`; `strength` is the fact's `retention_strength`.
pub fn retention(elapsed_hours: f64, strength: f64, cfg: &IntelligentMemoryConfig) -> f64 {
    let strength = if strength <= 0.0 { f64::EPSILON } else { strength };
    let r = (-cfg.retention_lambda * elapsed_hours / strength).exp();
    r.max(cfg.r_min)
}

/// Current retention for a fact, given its own `last_accessed`/`retention_strength`.
pub fn retention_now(fact: &MemoryFact, cfg: &IntelligentMemoryConfig) -> f64 {
    let elapsed_hours = (Utc::now() - fact.metadata.last_accessed).num_seconds() as f64 / 3600.0;
    retention(elapsed_hours.max(0.0), fact.metadata.retention_strength, cfg)
}

/// Applies the access-bookkeeping rule in place (spec.md §4.7 "Reinforcement
/// on access"): `access_count += 1`, `last_accessed = now`,
/// `retention_strength <- min(S_max, S * (1 + alpha))`.
pub fn reinforce(fact: &mut MemoryFact, cfg: &IntelligentMemoryConfig) {
    fact.metadata.access_count += 1;
    fact.metadata.last_accessed = Utc::now();
    fact.metadata.retention_strength = (fact.metadata.retention_strength * (1.0 + cfg.r_reinforce_alpha)).min(cfg.s_max);
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImportanceScore {
    pub score: f64,
    #[serde(default)]
    pub novelty: Option<f64>,
    #[serde(default)]
    pub relevance: Option<f64>,
    #[serde(default)]
    pub emotional_weight: Option<f64>,
}

/// LLM-driven scorer used to pick a fact's initial tier (spec.md §4.7
/// "Initial tier assignment").
pub struct ImportanceEvaluator {
    llm: Arc<dyn LlmClient>,
    prompt_override: Option<String>,
    max_retries: u32,
}

impl ImportanceEvaluator {
    pub fn new(llm: Arc<dyn LlmClient>, prompt_override: Option<String>, max_retries: u32) -> Self {
        Self { llm, prompt_override, max_retries }
    }

    /// On any LLM or parse failure, falls back to a neutral `0.5` score
    /// (maps to `SHORT_TERM`) rather than raising — tier assignment is never
    /// allowed to block `add`.
    pub async fn evaluate(&self, content: &str) -> ImportanceScore {
        let system = prompts::resolve(&self.prompt_override, prompts::IMPORTANCE_EVALUATION);
        let llm = Arc::clone(&self.llm);
        let req = LlmRequest::oneshot(system.to_string(), content.to_string(), 0.0);
        let completion = with_backoff(self.max_retries, Duration::from_millis(200), || {
            let llm = Arc::clone(&llm);
            let req = req.clone();
            async move { llm.complete(req).await }
        })
        .await;

        match completion {
            Ok(text) => match parse_structured::<ImportanceScore>(&text) {
                Ok(score) => score,
                Err(warning) => {
                    tracing::warn!(warning = %warning, "importance evaluation response failed to parse, defaulting to neutral");
                    ImportanceScore { score: 0.5, novelty: None, relevance: None, emotional_weight: None }
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "importance evaluation LLM call failed, defaulting to neutral");
                ImportanceScore { score: 0.5, novelty: None, relevance: None, emotional_weight: None }
            }
        }
    }
}

/// Maps an importance score to an initial tier (spec.md §4.7 thresholds).
pub fn tier_for_score(score: f64) -> Tier {
    if score >= 0.75 {
        Tier::LongTerm
    } else if score >= 0.4 {
        Tier::ShortTerm
    } else {
        Tier::Working
    }
}

#[derive(Debug, Clone, Default)]
pub struct MaintenanceReport {
    pub promoted: usize,
    pub demoted_to_archived: usize,
    pub deleted: usize,
}

/// Owns the promotion/demotion/cleanup maintenance sweep.
pub struct EbbinghausManager {
    vector_store: Arc<dyn VectorStore>,
    history_store: Arc<dyn HistoryStore>,
    config: IntelligentMemoryConfig,
}

impl EbbinghausManager {
    pub fn new(vector_store: Arc<dyn VectorStore>, history_store: Arc<dyn HistoryStore>, config: IntelligentMemoryConfig) -> Self {
        Self { vector_store, history_store, config }
    }

    /// Single-statement-equivalent batch reinforcement (grounded in the
    /// teacher's `strengthen_batch_on_access`): fetches, reinforces, and
    /// writes back every id concurrently. The store trait has no native bulk
    /// update, so this is a fan-out of individual upserts rather than one
    /// SQL statement — noted as a simplification relative to the teacher.
    pub async fn reinforce_batch(&self, ids: &[String]) -> Result<()> {
        let futures = ids.iter().map(|id| self.reinforce_one(id));
        futures::future::try_join_all(futures).await?;
        Ok(())
    }

    async fn reinforce_one(&self, id: &str) -> Result<()> {
        let Some(mut fact) = self.vector_store.get(id).await? else {
            return Ok(());
        };
        reinforce(&mut fact, &self.config);
        self.vector_store.upsert(&fact).await
    }

    /// Promotion/demotion/cleanup sweep over `WORKING`, `SHORT_TERM`, and
    /// `ARCHIVED` tiers (`LONG_TERM` is parameterized to "never" decay per
    /// the Open Question in spec.md §9, defaulting to `false`).
    pub async fn run_maintenance(&self) -> Result<MaintenanceReport> {
        let mut report = MaintenanceReport::default();
        self.process_working_tier(&mut report).await?;
        self.process_short_term_tier(&mut report).await?;
        self.process_archived_tier(&mut report).await?;
        if self.config.allow_long_term_decay {
            tracing::warn!("allow_long_term_decay is set but LONG_TERM sweeping is not implemented; treating as never-decay");
        }
        Ok(report)
    }

    async fn each_in_tier<F>(&self, tier: Tier, mut f: F) -> Result<()>
    where
        F: FnMut(MemoryFact) -> Option<MemoryFact>,
    {
        let filter = Filter::Eq("tier".to_string(), json!(tier.as_str()));
        let mut cursor: Option<String> = None;
        loop {
            let page = self.vector_store.list(&filter, 200, cursor.as_deref()).await?;
            for fact in page.items {
                if let Some(updated) = f(fact) {
                    self.vector_store.upsert(&updated).await?;
                }
            }
            match page.next_cursor {
                Some(c) => cursor = Some(c),
                None => break,
            }
        }
        Ok(())
    }

    async fn process_working_tier(&self, report: &mut MaintenanceReport) -> Result<()> {
        let threshold = self.config.working_to_short_term_access_count;
        let promoted = std::cell::Cell::new(0usize);
        self.each_in_tier(Tier::Working, |mut fact| {
            if fact.metadata.access_count >= threshold {
                fact.metadata.tier = Tier::ShortTerm;
                fact.metadata.updated_at = Utc::now();
                promoted.set(promoted.get() + 1);
                Some(fact)
            } else {
                None
            }
        })
        .await?;
        report.promoted += promoted.get();
        Ok(())
    }

    async fn process_short_term_tier(&self, report: &mut MaintenanceReport) -> Result<()> {
        let cfg = self.config.clone();
        let promoted = std::cell::Cell::new(0usize);
        let archived = std::cell::Cell::new(0usize);
        self.each_in_tier(Tier::ShortTerm, |mut fact| {
            if fact.metadata.access_count >= cfg.short_term_to_long_term_access_count
                || fact.metadata.retention_strength >= cfg.short_term_to_long_term_strength
            {
                fact.metadata.tier = Tier::LongTerm;
                fact.metadata.updated_at = Utc::now();
                promoted.set(promoted.get() + 1);
                return Some(fact);
            }
            if retention_now(&fact, &cfg) < cfg.short_term_to_archived_retention {
                fact.metadata.tier = Tier::Archived;
                fact.metadata.updated_at = Utc::now();
                archived.set(archived.get() + 1);
                return Some(fact);
            }
            None
        })
        .await?;
        report.promoted += promoted.get();
        report.demoted_to_archived += archived.get();
        Ok(())
    }

    async fn process_archived_tier(&self, report: &mut MaintenanceReport) -> Result<()> {
        let filter = Filter::Eq("tier".to_string(), json!(Tier::Archived.as_str()));
        let mut cursor: Option<String> = None;
        let mut to_delete = Vec::new();
        loop {
            let page = self.vector_store.list(&filter, 200, cursor.as_deref()).await?;
            for fact in page.items {
                let grace_elapsed_days = (Utc::now() - fact.metadata.updated_at).num_days();
                let at_floor = retention_now(&fact, &self.config) < self.config.r_min + RETENTION_EPSILON;
                if at_floor && grace_elapsed_days > self.config.archive_grace_days {
                    to_delete.push(fact);
                }
            }
            match page.next_cursor {
                Some(c) => cursor = Some(c),
                None => break,
            }
        }

        for fact in to_delete {
            self.vector_store.delete(&fact.id).await?;
            self.history_store
                .append(HistoryEvent {
                    event_id: 0,
                    memory_id: fact.id,
                    prev_value: Some(fact.content),
                    new_value: None,
                    event: HistoryEventKind::Delete,
                    actor: Some("ebbinghaus::maintenance".to_string()),
                    timestamp: Utc::now(),
                })
                .await?;
            report.deleted += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> IntelligentMemoryConfig {
        IntelligentMemoryConfig::default()
    }

    #[test]
    fn retention_at_zero_elapsed_is_one() {
        assert!((retention(0.0, 1.0, &cfg()) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn retention_at_one_hour_matches_spec_default() {
        let r = retention(1.0, 1.0, &cfg());
        assert!((r - 0.44).abs() < 1e-3);
    }

    #[test]
    fn retention_never_drops_below_r_min() {
        let r = retention(10_000.0, 1.0, &cfg());
        assert!((r - cfg().r_min).abs() < 1e-9);
    }

    #[test]
    fn retention_is_monotone_non_increasing() {
        let c = cfg();
        let mut prev = retention(0.0, 1.0, &c);
        for h in [1.0, 2.0, 5.0, 10.0, 100.0] {
            let r = retention(h, 1.0, &c);
            assert!(r <= prev + 1e-12);
            prev = r;
        }
    }

    #[test]
    fn tier_thresholds_match_spec() {
        assert_eq!(tier_for_score(0.9), Tier::LongTerm);
        assert_eq!(tier_for_score(0.75), Tier::LongTerm);
        assert_eq!(tier_for_score(0.5), Tier::ShortTerm);
        assert_eq!(tier_for_score(0.4), Tier::ShortTerm);
        assert_eq!(tier_for_score(0.1), Tier::Working);
    }

    #[test]
    fn reinforce_increments_access_count_and_strength() {
        use crate::model::{MemoryMetadata, Scope};
        let mut fact = MemoryFact {
            id: "1".to_string(),
            content: "x".to_string(),
            embedding: vec![],
            scope: Scope::empty(),
            metadata: MemoryMetadata::new(Utc::now()),
            hash: "h".to_string(),
        };
        let c = cfg();
        reinforce(&mut fact, &c);
        assert_eq!(fact.metadata.access_count, 1);
        assert!((fact.metadata.retention_strength - 1.25).abs() < 1e-9);
    }

    #[test]
    fn reinforce_caps_strength_at_s_max() {
        use crate::model::{MemoryMetadata, Scope};
        let c = cfg();
        let mut fact = MemoryFact {
            id: "1".to_string(),
            content: "x".to_string(),
            embedding: vec![],
            scope: Scope::empty(),
            metadata: MemoryMetadata::new(Utc::now()),
            hash: "h".to_string(),
        };
        fact.metadata.retention_strength = c.s_max;
        reinforce(&mut fact, &c);
        assert_eq!(fact.metadata.retention_strength, c.s_max);
    }
}
