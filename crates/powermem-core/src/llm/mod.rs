//! LLM Abstraction (spec.md §4.3, §4.4, §4.6: fact extraction, mutation
//! planning, importance evaluation, and relation extraction all funnel
//! through this one-shot, JSON-object-response contract).
//!
//! Grounded in the `oneshot(system, user)` convenience constructor of
//! `aither-core`'s `LanguageModel` trait, simplified to a single non-streaming
//! call: PowerMem never needs token-by-token output or tool calls, only one
//! discrete structured response per call.

pub mod prompts;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::error::Result;

/// The author of a turn in a conversation sent to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
}

/// A single turn. PowerMem only ever sends one system turn and one user
/// turn per call — no history, no attachments, no tool calls.
#[derive(Debug, Clone)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

/// Whether the provider should be constrained to return a bare JSON object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFormat {
    Text,
    JsonObject,
}

/// A one-shot chat completion request.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub messages: Vec<Message>,
    pub response_format: ResponseFormat,
    pub temperature: f32,
}

impl LlmRequest {
    /// Builds a request asking for a JSON object response from a single
    /// system + user turn pair — the shape every caller in this crate uses.
    pub fn oneshot(system: impl Into<String>, user: impl Into<String>, temperature: f32) -> Self {
        Self {
            messages: vec![
                Message { role: Role::System, content: system.into() },
                Message { role: Role::User, content: user.into() },
            ],
            response_format: ResponseFormat::JsonObject,
            temperature,
        }
    }
}

/// A provider-agnostic chat completion backend (spec.md §4.3: "the Fact
/// Extractor is a thin orchestration layer over an abstract LLM
/// collaborator — no concrete provider is in scope").
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Returns the raw completion text. Callers are responsible for
    /// extracting and validating structured JSON from it via
    /// [`parse_structured`] — the trait itself makes no parsing guarantees,
    /// since providers vary in how strictly they honor `response_format`.
    async fn complete(&self, request: LlmRequest) -> Result<String>;
}

/// A soft failure from [`parse_structured`]: the response could not be
/// turned into the expected shape. Never a [`crate::error::PowerMemError`]
/// on its own — callers decide whether a parse failure should fall back to a
/// default, skip the item, or bubble up as a hard error (spec.md §4.3 "the
/// extractor degrades gracefully: a parse failure yields zero facts and a
/// logged warning, not a propagated error").
#[derive(Debug, Clone)]
pub struct ParseWarning {
    pub message: String,
    pub raw: String,
}

impl std::fmt::Display for ParseWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Scans `text` for the first balanced `{...}` span, tolerant of
/// conversational wrapper text a model might prepend or append around the
/// JSON object despite being asked for `ResponseFormat::JsonObject`.
/// Brace/quote nesting inside string literals (including escaped quotes) is
/// tracked so a `"}"` inside a string value doesn't close the span early.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let start = text.find('{')?;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parses `text` into `T` via [`extract_json_object`], falling back to
/// parsing the whole string if no balanced object is found (some providers
/// return exactly the object with no wrapper).
pub fn parse_structured<T: DeserializeOwned>(text: &str) -> std::result::Result<T, ParseWarning> {
    let candidate = extract_json_object(text).unwrap_or(text);
    serde_json::from_str(candidate).map_err(|e| ParseWarning {
        message: format!("failed to parse structured LLM response: {e}"),
        raw: text.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Foo {
        a: i32,
        b: String,
    }

    #[test]
    fn extracts_bare_object() {
        let text = r#"{"a": 1, "b": "x"}"#;
        assert_eq!(extract_json_object(text), Some(text));
    }

    #[test]
    fn extracts_object_wrapped_in_prose() {
        let text = "Sure, here you go:\n{\"a\": 1, \"b\": \"x\"}\nLet me know if that helps!";
        assert_eq!(extract_json_object(text), Some(r#"{"a": 1, "b": "x"}"#));
    }

    #[test]
    fn tolerates_braces_inside_string_values() {
        let text = r#"{"a": 1, "b": "contains } a brace"}"#;
        assert_eq!(extract_json_object(text), Some(text));
    }

    #[test]
    fn returns_none_with_no_object() {
        assert_eq!(extract_json_object("no json here"), None);
    }

    #[test]
    fn parse_structured_succeeds_on_wrapped_object() {
        let text = "Here's the result: {\"a\": 7, \"b\": \"hi\"}";
        let parsed: Foo = parse_structured(text).unwrap();
        assert_eq!(parsed, Foo { a: 7, b: "hi".to_string() });
    }

    #[test]
    fn parse_structured_reports_warning_on_malformed_json() {
        let err = parse_structured::<Foo>("not json at all").unwrap_err();
        assert!(err.message.contains("failed to parse"));
    }

    #[test]
    fn oneshot_request_has_system_then_user_turn() {
        let req = LlmRequest::oneshot("sys", "usr", 0.1);
        assert_eq!(req.messages.len(), 2);
        assert_eq!(req.messages[0].role, Role::System);
        assert_eq!(req.messages[1].role, Role::User);
        assert_eq!(req.response_format, ResponseFormat::JsonObject);
    }
}
