use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use finops_core::config::LlmConfig;
use finops_core::domain::conversation::{Message, ToolCall};

/// Tool description as submitted to the model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CompletionRequest {
    pub system: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSpec>,
    pub max_tokens: u32,
}

/// A response with no tool calls is terminal for the turn.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CompletionResponse {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

impl CompletionResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: Some(text.into()), tool_calls: Vec::new() }
    }

    pub fn is_terminal(&self) -> bool {
        self.tool_calls.is_empty()
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CompletionError {
    /// Rate limits, overload, timeouts and connection resets.
    #[error("transient completion failure: {0}")]
    Transient(String),
    #[error("completion request rejected: {0}")]
    Rejected(String),
    #[error("malformed completion response: {0}")]
    Malformed(String),
}

impl CompletionError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, CompletionError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 2, base_delay_ms: 500, max_delay_ms: 8_000 }
    }
}

impl From<&LlmConfig> for RetryPolicy {
    fn from(config: &LlmConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay_ms: config.retry_base_delay_ms,
            max_delay_ms: config.retry_max_delay_ms,
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(16);
        let multiplier = 1_u64 << exponent;
        let delay_ms = self.base_delay_ms.saturating_mul(multiplier).min(self.max_delay_ms);
        Duration::from_millis(delay_ms)
    }
}

/// Calls the client, retrying transient failures with exponential backoff.
pub async fn complete_with_retry(
    client: &dyn CompletionClient,
    request: &CompletionRequest,
    policy: &RetryPolicy,
) -> Result<CompletionResponse, CompletionError> {
    let mut attempt = 0;
    loop {
        match client.complete(request).await {
            Ok(response) => return Ok(response),
            Err(error) if error.is_retryable() && attempt < policy.max_retries => {
                let delay = policy.backoff(attempt);
                warn!(
                    event_name = "agent.completion.retry",
                    attempt,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "completion failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::{
        complete_with_retry, CompletionClient, CompletionError, CompletionRequest,
        CompletionResponse, RetryPolicy,
    };

    struct ScriptedClient {
        replies: Mutex<VecDeque<Result<CompletionResponse, CompletionError>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedClient {
        fn new(replies: Vec<Result<CompletionResponse, CompletionError>>) -> Self {
            Self { replies: Mutex::new(replies.into()), calls: Mutex::new(0) }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().expect("calls lock")
        }
    }

    #[async_trait]
    impl CompletionClient for ScriptedClient {
        async fn complete(
            &self,
            _request: &CompletionRequest,
        ) -> Result<CompletionResponse, CompletionError> {
            *self.calls.lock().expect("calls lock") += 1;
            self.replies
                .lock()
                .expect("replies lock")
                .pop_front()
                .unwrap_or_else(|| Err(CompletionError::Rejected("script exhausted".into())))
        }
    }

    fn request() -> CompletionRequest {
        CompletionRequest {
            system: "system".into(),
            messages: Vec::new(),
            tools: Vec::new(),
            max_tokens: 64,
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy { max_retries, base_delay_ms: 1, max_delay_ms: 2 }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy { max_retries: 5, base_delay_ms: 250, max_delay_ms: 1_000 };
        assert_eq!(policy.backoff(0), Duration::from_millis(250));
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(4), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(40), Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let client = ScriptedClient::new(vec![
            Err(CompletionError::Transient("529 overloaded".into())),
            Ok(CompletionResponse::text("done")),
        ]);

        let response =
            complete_with_retry(&client, &request(), &fast_policy(2)).await.expect("response");
        assert_eq!(response.text.as_deref(), Some("done"));
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test]
    async fn rejected_requests_are_not_retried() {
        let client = ScriptedClient::new(vec![
            Err(CompletionError::Rejected("400 bad request".into())),
            Ok(CompletionResponse::text("unreachable")),
        ]);

        let error = complete_with_retry(&client, &request(), &fast_policy(3)).await.expect_err("error");
        assert!(matches!(error, CompletionError::Rejected(_)));
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn retries_stop_at_the_budget() {
        let client = ScriptedClient::new(vec![
            Err(CompletionError::Transient("timeout".into())),
            Err(CompletionError::Transient("timeout".into())),
            Err(CompletionError::Transient("timeout".into())),
        ]);

        let error = complete_with_retry(&client, &request(), &fast_policy(1)).await.expect_err("error");
        assert!(error.is_retryable());
        assert_eq!(client.calls(), 2);
    }
}
