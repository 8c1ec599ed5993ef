//! Retry Middleware for Chat Clients
//!
//! Wraps a `ChatClient` with exponential backoff over transient failures
//! (rate limits, 5xx, timeouts). Exhaustion surfaces as
//! `RuntimeError::LlmEndpointExhausted`, which is terminal for the task.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::warn;

use crate::errors::RuntimeError;
use crate::llm::{ChatClient, ChatCompletion, ChatRequest, DeltaHandler};

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (default 3).
    pub max_retries: u32,
    /// Base delay in milliseconds (default 1000).
    pub base_delay_ms: u64,
    /// Maximum delay in milliseconds (default 30000).
    pub max_delay_ms: u64,
    /// Backoff multiplier (default 2.0).
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Calculate the delay for a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_ms = self.base_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_millis(delay_ms.min(self.max_delay_ms as f64) as u64)
    }
}

// ---------------------------------------------------------------------------
// Error classification
// ---------------------------------------------------------------------------

/// Whether a failure is worth retrying.
pub fn is_transient(error: &anyhow::Error) -> bool {
    let text = format!("{error:#}").to_ascii_lowercase();
    const TRANSIENT_MARKERS: &[&str] = &[
        "429",
        "rate limit",
        "500",
        "502",
        "503",
        "504",
        "timeout",
        "timed out",
        "connection reset",
        "connection refused",
        "temporarily unavailable",
        "overloaded",
    ];
    TRANSIENT_MARKERS.iter().any(|marker| text.contains(marker))
}

// ---------------------------------------------------------------------------
// Retrying client
// ---------------------------------------------------------------------------

/// Chat client wrapper with retry-on-transient-failure semantics.
pub struct RetryingChatClient {
    inner: Arc<dyn ChatClient>,
    policy: RetryPolicy,
}

impl RetryingChatClient {
    pub fn new(inner: Arc<dyn ChatClient>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    fn exhausted(&self, last_error: anyhow::Error) -> anyhow::Error {
        RuntimeError::LlmEndpointExhausted(format!("{last_error:#}")).into()
    }
}

#[async_trait]
impl ChatClient for RetryingChatClient {
    async fn complete(&self, request: ChatRequest<'_>) -> Result<ChatCompletion> {
        let mut attempt = 0;
        loop {
            match self.inner.complete(request).await {
                Ok(completion) => return Ok(completion),
                Err(err) if attempt < self.policy.max_retries && is_transient(&err) => {
                    let delay = self.policy.delay_for_attempt(attempt);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, err = %err, "transient LLM failure, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) if is_transient(&err) => return Err(self.exhausted(err)),
                Err(err) => return Err(err),
            }
        }
    }

    async fn complete_streaming(
        &self,
        request: ChatRequest<'_>,
        on_delta: DeltaHandler<'_>,
    ) -> Result<()> {
        // A stream that already emitted deltas cannot be replayed; only
        // failures before the first delta are retried.
        let mut attempt = 0;
        loop {
            let mut emitted = false;
            let result = self
                .inner
                .complete_streaming(request, &mut |delta| {
                    emitted = true;
                    on_delta(delta);
                })
                .await;
            match result {
                Ok(()) => return Ok(()),
                Err(err) if !emitted && attempt < self.policy.max_retries && is_transient(&err) => {
                    let delay = self.policy.delay_for_attempt(attempt);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, err = %err, "transient LLM stream failure, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) if is_transient(&err) => return Err(self.exhausted(err)),
                Err(err) => return Err(err),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JsonMap, Message};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delays_grow_and_clamp() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay_ms: 100,
            max_delay_ms: 350,
            backoff_multiplier: 2.0,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
    }

    #[test]
    fn classification() {
        assert!(is_transient(&anyhow::anyhow!("HTTP 429 Too Many Requests")));
        assert!(is_transient(&anyhow::anyhow!("request timed out")));
        assert!(!is_transient(&anyhow::anyhow!("invalid API key")));
    }

    struct FlakyClient {
        failures_before_success: u32,
        attempts: AtomicU32,
    }

    #[async_trait]
    impl ChatClient for FlakyClient {
        async fn complete(&self, _request: ChatRequest<'_>) -> Result<ChatCompletion> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures_before_success {
                anyhow::bail!("HTTP 503 service unavailable");
            }
            Ok(ChatCompletion::text("ok"))
        }
    }

    fn request_fixture<'a>(messages: &'a [Message], options: &'a JsonMap) -> ChatRequest<'a> {
        ChatRequest {
            model: "test-model",
            messages,
            tool_schemas: &[],
            options,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures() {
        let client = RetryingChatClient::new(
            Arc::new(FlakyClient {
                failures_before_success: 2,
                attempts: AtomicU32::new(0),
            }),
            RetryPolicy {
                base_delay_ms: 10,
                ..RetryPolicy::default()
            },
        );
        let messages = [Message::user("hi")];
        let options = JsonMap::new();

        let completion = client.complete(request_fixture(&messages, &options)).await.unwrap();
        assert_eq!(completion.content, "ok");
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_maps_to_endpoint_exhausted() {
        let client = RetryingChatClient::new(
            Arc::new(FlakyClient {
                failures_before_success: u32::MAX,
                attempts: AtomicU32::new(0),
            }),
            RetryPolicy {
                max_retries: 2,
                base_delay_ms: 10,
                ..RetryPolicy::default()
            },
        );
        let messages = [Message::user("hi")];
        let options = JsonMap::new();

        let err = client
            .complete(request_fixture(&messages, &options))
            .await
            .unwrap_err();
        let runtime_err = err.downcast_ref::<RuntimeError>().unwrap();
        assert_eq!(runtime_err.reason_code(), "llm_endpoint_exhausted");
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        struct FatalClient;
        #[async_trait]
        impl ChatClient for FatalClient {
            async fn complete(&self, _request: ChatRequest<'_>) -> Result<ChatCompletion> {
                anyhow::bail!("invalid API key")
            }
        }
        let fatal = RetryingChatClient::new(Arc::new(FatalClient), RetryPolicy::default());
        let messages = [Message::user("hi")];
        let options = JsonMap::new();
        let err = fatal
            .complete(request_fixture(&messages, &options))
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<RuntimeError>().is_none());
    }
}
