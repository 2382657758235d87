//! Fact Extractor (C3, spec.md §4.3).
//!
//! Turns a raw conversation turn sequence (or a single string) into an
//! ordered list of standalone facts via one LLM call, degrading gracefully
//! to an empty list on any failure — extraction never raises.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::error::Result;
use crate::llm::{parse_structured, prompts, LlmClient, LlmRequest, ParseWarning};
use crate::retry::with_backoff;

/// The speaker of one conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnRole {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone)]
pub struct ConversationTurn {
    pub role: TurnRole,
    pub content: String,
}

/// What the extractor is given (spec.md §4.3 "a sequence of turns... OR a
/// single raw string").
#[derive(Debug, Clone)]
pub enum ExtractionInput {
    Turns(Vec<ConversationTurn>),
    Raw(String),
}

impl ExtractionInput {
    fn render(&self) -> String {
        match self {
            ExtractionInput::Raw(text) => text.clone(),
            ExtractionInput::Turns(turns) => turns
                .iter()
                .map(|t| {
                    let role = match t.role {
                        TurnRole::User => "user",
                        TurnRole::Assistant => "assistant",
                        TurnRole::System => "system",
                    };
                    format!("{role}: {}", t.content)
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExtractionRequest {
    pub input: ExtractionInput,
    pub metadata: BTreeMap<String, Value>,
    pub language_hint: Option<String>,
    /// If `false`, bypasses the LLM entirely and stores the rendered input
    /// verbatim as a single fact (spec.md §4.3 "Bypass").
    pub infer: bool,
}

impl ExtractionRequest {
    pub fn raw(text: impl Into<String>) -> Self {
        Self {
            input: ExtractionInput::Raw(text.into()),
            metadata: BTreeMap::new(),
            language_hint: None,
            infer: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExtractionOutcome {
    pub facts: Vec<String>,
    pub warning: Option<ParseWarning>,
}

#[derive(Debug, Deserialize)]
struct ExtractedFacts {
    facts: Vec<String>,
}

pub struct FactExtractor {
    llm: Arc<dyn LlmClient>,
    prompt_override: Option<String>,
    max_retries: u32,
}

impl FactExtractor {
    pub fn new(llm: Arc<dyn LlmClient>, prompt_override: Option<String>, max_retries: u32) -> Self {
        Self { llm, prompt_override, max_retries }
    }

    pub async fn extract(&self, request: ExtractionRequest) -> Result<ExtractionOutcome> {
        let rendered = request.input.render();

        if !request.infer {
            tracing::debug!("fact extraction bypassed (infer=false), storing verbatim");
            return Ok(ExtractionOutcome { facts: vec![rendered], warning: None });
        }

        let span = tracing::debug_span!("extract_facts", input_len = rendered.len());
        let _enter = span.enter();

        let system_prompt = prompts::resolve(&self.prompt_override, prompts::FACT_EXTRACTION);
        let user_prompt = match &request.language_hint {
            Some(hint) => format!("Language hint: {hint}\n\nInput:\n{rendered}"),
            None => rendered,
        };

        let llm = Arc::clone(&self.llm);
        let req = LlmRequest::oneshot(system_prompt, user_prompt, 0.0);
        let completion = with_backoff(self.max_retries, Duration::from_millis(200), || {
            let llm = Arc::clone(&llm);
            let req = req.clone();
            async move { llm.complete(req).await }
        })
        .await;

        let text = match completion {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(error = %e, "fact extraction LLM call failed, returning empty list");
                return Ok(ExtractionOutcome {
                    facts: vec![],
                    warning: Some(ParseWarning { message: e.to_string(), raw: String::new() }),
                });
            }
        };

        match parse_structured::<ExtractedFacts>(&text) {
            Ok(parsed) => Ok(ExtractionOutcome { facts: parsed.facts, warning: None }),
            Err(warning) => {
                tracing::warn!(warning = %warning, "fact extraction response failed to parse");
                Ok(ExtractionOutcome { facts: vec![], warning: Some(warning) })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::{EchoLlmClient, FailingLlmClient, ScriptedLlmClient};

    #[tokio::test]
    async fn extracts_facts_from_well_formed_response() {
        let llm = Arc::new(EchoLlmClient::new(r#"{"facts": ["alice likes coffee", "alice lives in berlin"]}"#));
        let extractor = FactExtractor::new(llm, None, 3);
        let outcome = extractor.extract(ExtractionRequest::raw("alice likes coffee and lives in berlin")).await.unwrap();
        assert_eq!(outcome.facts, vec!["alice likes coffee", "alice lives in berlin"]);
        assert!(outcome.warning.is_none());
    }

    #[tokio::test]
    async fn malformed_response_yields_empty_facts_and_warning_not_error() {
        let llm = Arc::new(EchoLlmClient::new("not json at all"));
        let extractor = FactExtractor::new(llm, None, 3);
        let outcome = extractor.extract(ExtractionRequest::raw("whatever")).await.unwrap();
        assert!(outcome.facts.is_empty());
        assert!(outcome.warning.is_some());
    }

    #[tokio::test]
    async fn bypass_stores_input_verbatim_without_calling_llm() {
        let llm = Arc::new(FailingLlmClient);
        let extractor = FactExtractor::new(llm, None, 3);
        let mut request = ExtractionRequest::raw("verbatim text");
        request.infer = false;
        let outcome = extractor.extract(request).await.unwrap();
        assert_eq!(outcome.facts, vec!["verbatim text"]);
    }

    #[tokio::test]
    async fn llm_failure_after_retries_yields_empty_facts_not_error() {
        let llm = Arc::new(FailingLlmClient);
        let extractor = FactExtractor::new(llm, None, 2);
        let outcome = extractor.extract(ExtractionRequest::raw("whatever")).await.unwrap();
        assert!(outcome.facts.is_empty());
        assert!(outcome.warning.is_some());
    }

    #[tokio::test]
    async fn turns_are_rendered_with_role_prefixes() {
        let llm = Arc::new(ScriptedLlmClient::new(vec![r#"{"facts": []}"#]));
        let extractor = FactExtractor::new(llm, None, 3);
        let request = ExtractionRequest {
            input: ExtractionInput::Turns(vec![
                ConversationTurn { role: TurnRole::User, content: "hi".to_string() },
                ConversationTurn { role: TurnRole::Assistant, content: "hello".to_string() },
            ]),
            metadata: BTreeMap::new(),
            language_hint: None,
            infer: true,
        };
        let outcome = extractor.extract(request).await.unwrap();
        assert!(outcome.facts.is_empty());
    }
}
