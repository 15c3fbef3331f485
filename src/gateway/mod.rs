//! Vision-model access through OpenRouter.
//!
//! [`ProviderGateway`] wraps one [`OpenRouterAdapter`] with retries and usage
//! accounting. Callers depend on the [`ChatGateway`] trait so tests can swap
//! in canned replies.

pub mod error;
pub mod openrouter;
pub mod pricing;
pub mod types;
pub mod usage;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

pub use error::{ErrorContext, ProviderError};
pub use openrouter::{OpenRouterAdapter, OpenRouterConfig};
pub use pricing::estimate_cost;
pub use types::{Attribution, ChatRequest, ChatResponse, FinishReason, Message, Role};
pub use usage::{NoopUsageSink, ProviderCallRecord, TracingUsageSink, UsageSink};

#[async_trait::async_trait]
pub trait ChatGateway: Send + Sync {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError>;
}

/// Exponential backoff between attempts of one call.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts after the first.
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Upper bound for both backoff and a provider's `Retry-After`.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Wait before retry number `attempt + 1`. A rate limit with a
    /// `Retry-After` waits that long instead of backing off.
    pub fn delay(&self, attempt: u32, err: &ProviderError) -> Duration {
        let wait = match err {
            ProviderError::RateLimited {
                retry_after: Some(after),
                ..
            } => *after,
            _ => self.base_delay.saturating_mul(1 << attempt.min(16)),
        };
        wait.min(self.max_delay)
    }
}

pub struct ProviderGateway<U: UsageSink> {
    adapter: OpenRouterAdapter,
    usage: Arc<U>,
    retry: RetryPolicy,
}

impl<U: UsageSink> ProviderGateway<U> {
    pub fn new(adapter: OpenRouterAdapter, usage: Arc<U>) -> Self {
        Self {
            adapter,
            usage,
            retry: RetryPolicy::default(),
        }
    }

    pub fn from_env(usage: Arc<U>) -> Result<Self, ProviderError> {
        Ok(Self::new(OpenRouterAdapter::from_env()?, usage))
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn record(
        &self,
        req: &ChatRequest,
        attempt: u32,
        outcome: &Result<ChatResponse, ProviderError>,
        elapsed: Duration,
    ) {
        let (input_tokens, output_tokens, cost, error_code, request_id) = match outcome {
            Ok(resp) => (
                resp.input_tokens,
                resp.output_tokens,
                resp.cost_nanodollars,
                None,
                resp.request_id.clone(),
            ),
            Err(err) => (0, 0, 0, Some(err.code()), err.request_id().map(str::to_string)),
        };
        self.usage
            .record(ProviderCallRecord {
                timestamp: Utc::now(),
                model: req.model.clone(),
                caller: req.attribution.caller,
                job_id: req.attribution.job_id,
                attempt,
                input_tokens,
                output_tokens,
                cost_nanodollars: cost,
                latency_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                error_code,
                request_id,
            })
            .await;
    }
}

#[async_trait::async_trait]
impl<U: UsageSink> ChatGateway for ProviderGateway<U> {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let mut attempt = 0;
        loop {
            let started = std::time::Instant::now();
            let outcome = self.adapter.complete(&req).await;
            self.record(&req, attempt, &outcome, started.elapsed()).await;

            let err = match outcome {
                Ok(resp) => return Ok(resp),
                Err(err) => err,
            };
            if !err.is_retryable() || attempt >= self.retry.max_retries {
                return Err(err);
            }

            let delay = self.retry.delay(attempt, &err);
            tracing::debug!(
                model = %req.model,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying vision call"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
