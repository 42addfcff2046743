use std::future::Future;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Output shape requested from the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseFormat {
    #[default]
    Text,
    /// Ask the backend for a single JSON object when it supports it.
    Json,
}

/// Per-call options for [`LlmProvider::think`].
#[derive(Debug, Clone)]
pub struct ThinkOptions {
    pub temperature: f32,
    pub max_tokens: u32,
    pub response_format: ResponseFormat,
    /// Cooperative abort for the in-flight request.
    pub cancel: Option<CancellationToken>,
}

impl Default for ThinkOptions {
    fn default() -> Self {
        Self {
            temperature: 0.1,
            max_tokens: 4096,
            response_format: ResponseFormat::Text,
            cancel: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    Other(String),
}

impl FinishReason {
    pub fn from_wire(reason: Option<&str>) -> Self {
        match reason {
            None | Some("stop") | Some("end_turn") | Some("stop_sequence") => FinishReason::Stop,
            Some("length") | Some("max_tokens") => FinishReason::Length,
            Some(other) => FinishReason::Other(other.to_string()),
        }
    }
}

/// What the engine returned for one `think` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkResponse {
    pub content: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub model: String,
    pub finish_reason: FinishReason,
}

/// Trait for reasoning engines; each backend implements this.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send one system + user prompt pair and return the engine's reply.
    async fn think(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        options: &ThinkOptions,
    ) -> Result<ThinkResponse, LlmError>;

    /// Provider name for logging (e.g., "openai", "anthropic", "ollama").
    fn provider_name(&self) -> &str;
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),
    #[error("API error: {status}: {body}")]
    ApiError { status: u16, body: String },
    #[error("failed to parse response: {0}")]
    ParseError(String),
    #[error("provider not configured: {0}")]
    NotConfigured(String),
    #[error("request cancelled")]
    Cancelled,
}

impl LlmError {
    /// Whether retrying the same request might succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::HttpError(e) => e.is_timeout() || e.is_connect(),
            LlmError::ApiError { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Race `fut` against the cancellation token, if any.
pub(crate) async fn cancellable<T, F>(cancel: Option<&CancellationToken>, fut: F) -> Result<T, LlmError>
where
    F: Future<Output = Result<T, LlmError>>,
{
    match cancel {
        Some(token) => {
            tokio::select! {
                _ = token.cancelled() => Err(LlmError::Cancelled),
                res = fut => res,
            }
        }
        None => fut.await,
    }
}

/// Scripted provider for exercising the orchestration loop without network calls.
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// One recorded `think` invocation.
    #[derive(Debug, Clone)]
    pub struct RecordedCall {
        pub system_prompt: String,
        pub user_prompt: String,
    }

    /// Returns queued replies in FIFO order, then a fixed fallback reply.
    pub struct ScriptedProvider {
        replies: Mutex<VecDeque<Result<String, String>>>,
        fallback: String,
        calls: Mutex<Vec<RecordedCall>>,
    }

    impl ScriptedProvider {
        pub fn new() -> Self {
            Self {
                replies: Mutex::new(VecDeque::new()),
                fallback: r#"{"done": true, "summary": "nothing left to do"}"#.to_string(),
                calls: Mutex::new(Vec::new()),
            }
        }

        /// Reply used once the queue is exhausted.
        pub fn with_fallback(mut self, reply: impl Into<String>) -> Self {
            self.fallback = reply.into();
            self
        }

        pub fn queue(&self, reply: impl Into<String>) {
            self.replies.lock().unwrap().push_back(Ok(reply.into()));
        }

        pub fn queue_repeated(&self, reply: &str, times: usize) {
            for _ in 0..times {
                self.queue(reply);
            }
        }

        /// Queue an API failure.
        pub fn queue_error(&self, message: impl Into<String>) {
            self.replies.lock().unwrap().push_back(Err(message.into()));
        }

        pub fn calls(&self) -> Vec<RecordedCall> {
            self.calls.lock().unwrap().clone()
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    impl Default for ScriptedProvider {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        async fn think(
            &self,
            system_prompt: &str,
            user_prompt: &str,
            options: &ThinkOptions,
        ) -> Result<ThinkResponse, LlmError> {
            if options.cancel.as_ref().is_some_and(|t| t.is_cancelled()) {
                return Err(LlmError::Cancelled);
            }
            self.calls.lock().unwrap().push(RecordedCall {
                system_prompt: system_prompt.to_string(),
                user_prompt: user_prompt.to_string(),
            });
            let next = self.replies.lock().unwrap().pop_front();
            let content = match next {
                Some(Ok(reply)) => reply,
                Some(Err(body)) => return Err(LlmError::ApiError { status: 500, body }),
                None => self.fallback.clone(),
            };
            Ok(ThinkResponse {
                tokens_in: (system_prompt.len() + user_prompt.len()) as u32 / 4,
                tokens_out: content.len() as u32 / 4,
                content,
                model: "scripted".to_string(),
                finish_reason: FinishReason::Stop,
            })
        }

        fn provider_name(&self) -> &str {
            "scripted"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::ScriptedProvider;
    use super::*;

    #[test]
    fn test_finish_reason_from_wire() {
        assert_eq!(FinishReason::from_wire(Some("end_turn")), FinishReason::Stop);
        assert_eq!(FinishReason::from_wire(Some("max_tokens")), FinishReason::Length);
        assert_eq!(
            FinishReason::from_wire(Some("content_filter")),
            FinishReason::Other("content_filter".to_string())
        );
    }

    #[test]
    fn test_transient_classification() {
        let rate_limited = LlmError::ApiError { status: 429, body: String::new() };
        let bad_request = LlmError::ApiError { status: 400, body: String::new() };
        assert!(rate_limited.is_transient());
        assert!(!bad_request.is_transient());
        assert!(!LlmError::Cancelled.is_transient());
    }

    #[tokio::test]
    async fn test_scripted_provider_fifo_then_fallback() {
        let provider = ScriptedProvider::new().with_fallback("fallback");
        provider.queue("first");
        provider.queue("second");

        let opts = ThinkOptions::default();
        assert_eq!(provider.think("s", "u", &opts).await.unwrap().content, "first");
        assert_eq!(provider.think("s", "u", &opts).await.unwrap().content, "second");
        assert_eq!(provider.think("s", "u", &opts).await.unwrap().content, "fallback");
        assert_eq!(provider.call_count(), 3);
    }

    #[tokio::test]
    async fn test_scripted_provider_honors_cancel() {
        let provider = ScriptedProvider::new();
        let token = CancellationToken::new();
        token.cancel();
        let opts = ThinkOptions { cancel: Some(token), ..Default::default() };
        assert!(matches!(provider.think("s", "u", &opts).await, Err(LlmError::Cancelled)));
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn test_cancellable_short_circuits() {
        let token = CancellationToken::new();
        token.cancel();
        let res: Result<(), LlmError> = cancellable(Some(&token), std::future::pending()).await;
        assert!(matches!(res, Err(LlmError::Cancelled)));
    }
}
