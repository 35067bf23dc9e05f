//! Bounded exponential-backoff retry for transient provider failures.
//!
//! [`with_retry`] is the generic primitive; [`Retry`] decorates a
//! [`ProviderGateway`] with it.  Classification lives on
//! [`AgentError::is_retryable`]: HTTP 429/500/503, connection resets, and
//! timeouts.  Exhausting the bound or hitting a non-retryable error
//! propagates the original error unchanged, and no retry is attempted once
//! the cancellation token has fired.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{AgentError, Result};
use crate::llm::gateway::{ChatRequest, ProviderGateway, StreamHandle};
use crate::llm::types::MessageResponse;

/// Retry bounds.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of re-attempts after the initial call.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each subsequent attempt.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt)
    }
}

/// Run `f`, retrying transient failures per `policy`.
///
/// When `cancel` is supplied, a token that fires suppresses further retries:
/// backoff sleeps abort and the call resolves to [`AgentError::Cancelled`].
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: Option<&CancellationToken>,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= policy.max_retries || !err.is_retryable() {
                    return Err(err);
                }
                if let Some(token) = cancel {
                    if token.is_cancelled() {
                        return Err(err);
                    }
                }

                let delay = policy.delay_for(attempt);
                tracing::debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after transient failure"
                );

                match cancel {
                    Some(token) => {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = token.cancelled() => return Err(AgentError::Cancelled),
                        }
                    }
                    None => tokio::time::sleep(delay).await,
                }

                attempt += 1;
            }
        }
    }
}

/// A [`ProviderGateway`] decorator that retries transient failures.
///
/// `prompt` retries the whole call; `stream` retries only connection
/// establishment -- a delta sequence is single-pass and cannot be replayed.
pub struct Retry<G> {
    inner: G,
    policy: RetryPolicy,
}

impl<G> Retry<G> {
    pub fn new(inner: G) -> Self {
        Self {
            inner,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }
}

#[async_trait]
impl<G: ProviderGateway> ProviderGateway for Retry<G> {
    async fn prompt(&self, request: ChatRequest) -> Result<MessageResponse> {
        with_retry(&self.policy, None, || self.inner.prompt(request.clone())).await
    }

    async fn stream(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<StreamHandle> {
        with_retry(&self.policy, Some(&cancel), || {
            self.inner.stream(request.clone(), cancel.clone())
        })
        .await
    }
}
