//! Deterministic test doubles for [`super::LlmClient`], gated behind the
//! `test-support` feature so production builds never link them (spec.md §8:
//! "every scenario below runs against a mock LLM and a hash-based fake
//! embedder — no network calls, fully deterministic").

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{PowerMemError, Result};

use super::{LlmClient, LlmRequest};

/// Returns a fixed, pre-scripted sequence of responses, one per call, in
/// order. Panics-as-error if exhausted, so a test that under-scripts its
/// mock fails loudly instead of hanging.
pub struct ScriptedLlmClient {
    responses: Mutex<VecDeque<String>>,
}

impl ScriptedLlmClient {
    pub fn new(responses: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self { responses: Mutex::new(responses.into_iter().map(Into::into).collect()) }
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, _request: LlmRequest) -> Result<String> {
        let mut queue = self.responses.lock().expect("scripted llm client mutex poisoned");
        queue.pop_front().ok_or_else(|| {
            PowerMemError::Fatal("ScriptedLlmClient: no more scripted responses".to_string())
        })
    }
}

/// Always returns the same canned response, for tests that don't care about
/// call count.
pub struct EchoLlmClient {
    response: String,
}

impl EchoLlmClient {
    pub fn new(response: impl Into<String>) -> Self {
        Self { response: response.into() }
    }
}

#[async_trait]
impl LlmClient for EchoLlmClient {
    async fn complete(&self, _request: LlmRequest) -> Result<String> {
        Ok(self.response.clone())
    }
}

/// Always fails with [`PowerMemError::BackendUnavailable`], for exercising
/// retry and fallback paths.
pub struct FailingLlmClient;

#[async_trait]
impl LlmClient for FailingLlmClient {
    async fn complete(&self, _request: LlmRequest) -> Result<String> {
        Err(PowerMemError::BackendUnavailable("mock llm provider unreachable".to_string()))
    }
}
