//! User Profile Builder (C8, spec.md §4.8).
//!
//! Consolidates a user's recent facts into a short natural-language profile
//! plus a topic list. Runs best-effort, off the critical path of `add`: the
//! engine spawns [`ProfileBuilder::rebuild`] via `tokio::spawn` and never
//! observes its failures.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::llm::{parse_structured, prompts, LlmClient, LlmRequest};
use crate::model::{Scope, UserProfile};
use crate::retry::with_backoff;
use crate::store::ProfileStore;

#[derive(Debug, Deserialize)]
struct ProfileResponse {
    profile_text: String,
    #[serde(default)]
    topics: Vec<String>,
}

pub struct ProfileBuilder {
    profile_store: Arc<dyn ProfileStore>,
    llm: Arc<dyn LlmClient>,
    prompt_override: Option<String>,
    max_retries: u32,
}

impl ProfileBuilder {
    pub fn new(profile_store: Arc<dyn ProfileStore>, llm: Arc<dyn LlmClient>, prompt_override: Option<String>, max_retries: u32) -> Self {
        Self { profile_store, llm, prompt_override, max_retries }
    }

    /// Consolidates `recent_facts` into a profile for `scope` and writes it
    /// if it differs from what's stored. Never returns an error; all
    /// failures are logged and swallowed, per spec.md §4.8/§4.9.
    pub async fn rebuild(&self, scope: &Scope, recent_facts: &[String]) {
        let Some(user_id) = scope.user_id.clone() else {
            tracing::debug!("profile rebuild skipped: scope has no user_id");
            return;
        };
        if recent_facts.is_empty() {
            return;
        }

        let existing = match self.profile_store.get(scope).await {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "profile rebuild: failed to load existing profile, aborting");
                return;
            }
        };

        let system_prompt = self.system_prompt();
        let user_prompt = build_user_prompt(existing.as_ref(), recent_facts);

        let llm = Arc::clone(&self.llm);
        let req = LlmRequest::oneshot(system_prompt, user_prompt, 0.2);
        let completion = with_backoff(self.max_retries, Duration::from_millis(200), || {
            let llm = Arc::clone(&llm);
            let req = req.clone();
            async move { llm.complete(req).await }
        })
        .await;

        let text = match completion {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(error = %e, "profile consolidation LLM call failed, leaving profile unchanged");
                return;
            }
        };

        let parsed = match parse_structured::<ProfileResponse>(&text) {
            Ok(parsed) => parsed,
            Err(warning) => {
                tracing::warn!(warning = %warning, "profile consolidation response failed to parse, leaving profile unchanged");
                return;
            }
        };

        if let Some(existing) = &existing {
            if existing.profile_text == parsed.profile_text && existing.topics == parsed.topics {
                tracing::debug!("profile unchanged, skipping write");
                return;
            }
        }

        let now = chrono::Utc::now();
        let profile = UserProfile {
            user_id,
            agent_id: scope.agent_id.clone(),
            run_id: scope.run_id.clone(),
            profile_text: parsed.profile_text,
            topics: parsed.topics,
            created_at: existing.as_ref().map(|p| p.created_at).unwrap_or(now),
            updated_at: now,
        };

        if let Err(e) = self.profile_store.upsert(&profile).await {
            tracing::warn!(error = %e, "profile rebuild: failed to persist consolidated profile");
        }
    }

    fn system_prompt(&self) -> &str {
        prompts::resolve(&self.prompt_override, prompts::PROFILE_CONSOLIDATION)
    }
}

fn build_user_prompt(existing: Option<&UserProfile>, recent_facts: &[String]) -> String {
    let mut prompt = String::new();
    match existing {
        Some(p) => prompt.push_str(&format!("Current profile:\n{}\n\n", p.profile_text)),
        None => prompt.push_str("Current profile: (none yet)\n\n"),
    }
    prompt.push_str("Recently added or updated facts:\n");
    for fact in recent_facts {
        prompt.push_str(&format!("- {fact}\n"));
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::{EchoLlmClient, FailingLlmClient};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;

    struct FakeProfileStore {
        stored: Mutex<Option<UserProfile>>,
    }

    impl FakeProfileStore {
        fn empty() -> Self {
            Self { stored: Mutex::new(None) }
        }

        fn with(profile: UserProfile) -> Self {
            Self { stored: Mutex::new(Some(profile)) }
        }
    }

    #[async_trait]
    impl ProfileStore for FakeProfileStore {
        async fn get(&self, _scope: &Scope) -> crate::error::Result<Option<UserProfile>> {
            Ok(self.stored.lock().unwrap().clone())
        }
        async fn upsert(&self, profile: &UserProfile) -> crate::error::Result<()> {
            *self.stored.lock().unwrap() = Some(profile.clone());
            Ok(())
        }
        async fn delete(&self, _scope: &Scope) -> crate::error::Result<()> {
            *self.stored.lock().unwrap() = None;
            Ok(())
        }
    }

    fn scope() -> Scope {
        Scope { user_id: Some("u1".to_string()), agent_id: None, run_id: None, actor_id: None }
    }

    #[tokio::test]
    async fn writes_new_profile_when_none_exists() {
        let store = Arc::new(FakeProfileStore::empty());
        let llm = Arc::new(EchoLlmClient::new(r#"{"profile_text": "likes coffee", "topics": ["beverages"]}"#));
        let builder = ProfileBuilder::new(store.clone(), llm, None, 3);
        builder.rebuild(&scope(), &["alice likes coffee".to_string()]).await;
        let stored = store.stored.lock().unwrap().clone().unwrap();
        assert_eq!(stored.profile_text, "likes coffee");
        assert_eq!(stored.topics, vec!["beverages".to_string()]);
    }

    #[tokio::test]
    async fn skips_write_when_profile_is_byte_equal() {
        let existing = UserProfile {
            user_id: "u1".to_string(),
            agent_id: None,
            run_id: None,
            profile_text: "likes coffee".to_string(),
            topics: vec!["beverages".to_string()],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let created_at = existing.created_at;
        let store = Arc::new(FakeProfileStore::with(existing));
        let llm = Arc::new(EchoLlmClient::new(r#"{"profile_text": "likes coffee", "topics": ["beverages"]}"#));
        let builder = ProfileBuilder::new(store.clone(), llm, None, 3);
        builder.rebuild(&scope(), &["alice likes coffee".to_string()]).await;
        let stored = store.stored.lock().unwrap().clone().unwrap();
        assert_eq!(stored.created_at, created_at);
    }

    #[tokio::test]
    async fn llm_failure_leaves_profile_untouched() {
        let store = Arc::new(FakeProfileStore::empty());
        let llm = Arc::new(FailingLlmClient);
        let builder = ProfileBuilder::new(store.clone(), llm, None, 2);
        builder.rebuild(&scope(), &["alice likes coffee".to_string()]).await;
        assert!(store.stored.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn skips_entirely_when_scope_has_no_user_id() {
        let store = Arc::new(FakeProfileStore::empty());
        let llm = Arc::new(EchoLlmClient::new(r#"{"profile_text": "x", "topics": []}"#));
        let builder = ProfileBuilder::new(store.clone(), llm, None, 3);
        let anonymous = Scope::empty();
        builder.rebuild(&anonymous, &["some fact".to_string()]).await;
        assert!(store.stored.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn no_recent_facts_is_a_no_op() {
        let store = Arc::new(FakeProfileStore::empty());
        let llm = Arc::new(EchoLlmClient::new(r#"{"profile_text": "x", "topics": []}"#));
        let builder = ProfileBuilder::new(store.clone(), llm, None, 3);
        builder.rebuild(&scope(), &[]).await;
        assert!(store.stored.lock().unwrap().is_none());
    }
}
