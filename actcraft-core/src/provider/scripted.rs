//! Scripted provider - replays canned completions in order
//!
//! Used for deterministic tests and optimizer dry runs: every request is
//! recorded, and responses are served from a queue.

use super::*;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Provider that answers from a fixed script
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Result<String, ProviderError>>>,
    fallback: Option<String>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    /// Serve the given completions in order
    pub fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            script: Mutex::new(responses.into_iter().map(|r| Ok(r.into())).collect()),
            fallback: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Serve the same completion for every request
    pub fn repeating(response: impl Into<String>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Some(response.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queue a completion after the existing script
    pub fn then(self, response: impl Into<String>) -> Self {
        self.push(Ok(response.into()));
        self
    }

    /// Queue a failure after the existing script
    pub fn then_fail(self, error: ProviderError) -> Self {
        self.push(Err(error));
        self
    }

    fn push(&self, item: Result<String, ProviderError>) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(item);
        }
    }

    /// Number of requests served so far
    pub fn calls(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// All requests received so far, oldest first
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Remaining scripted entries
    pub fn remaining(&self) -> usize {
        self.script.lock().map(|s| s.len()).unwrap_or(0)
    }
}

impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn default_model(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }

        let next = self
            .script
            .lock()
            .map_err(|_| ProviderError::Other("script lock poisoned".into()))?
            .pop_front();

        let content = match next {
            Some(item) => item?,
            None => self
                .fallback
                .clone()
                .ok_or_else(|| ProviderError::Other("script exhausted".into()))?,
        };

        Ok(CompletionResponse {
            id: format!("scripted-{}", self.calls()),
            model: "scripted".into(),
            content: Some(content),
            finish_reason: FinishReason::Stop,
            usage: Usage::default(),
        })
    }
}
