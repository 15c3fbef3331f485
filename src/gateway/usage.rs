//! Per-call usage accounting.
//!
//! The gateway hands every attempt, successful or not, to a [`UsageSink`].
//! The CLI logs them with [`TracingUsageSink`]; tests count them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// One provider attempt. Retries produce one record each.
#[derive(Debug, Clone)]
pub struct ProviderCallRecord {
    pub timestamp: DateTime<Utc>,
    pub model: String,
    pub caller: &'static str,
    pub job_id: Option<Uuid>,
    /// Zero-based; `attempt > 0` means a retry.
    pub attempt: u32,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_nanodollars: i64,
    pub latency_ms: u64,
    /// `None` on success, otherwise [`ProviderError::code`](super::ProviderError::code).
    pub error_code: Option<&'static str>,
    pub request_id: Option<String>,
}

impl ProviderCallRecord {
    pub fn succeeded(&self) -> bool {
        self.error_code.is_none()
    }
}

#[async_trait]
pub trait UsageSink: Send + Sync {
    /// Must not fail the call; sinks swallow their own errors.
    async fn record(&self, record: ProviderCallRecord);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopUsageSink;

#[async_trait]
impl UsageSink for NoopUsageSink {
    async fn record(&self, _record: ProviderCallRecord) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingUsageSink;

#[async_trait]
impl UsageSink for TracingUsageSink {
    async fn record(&self, record: ProviderCallRecord) {
        match record.error_code {
            None => tracing::info!(
                model = %record.model,
                caller = record.caller,
                job_id = ?record.job_id,
                attempt = record.attempt,
                input_tokens = record.input_tokens,
                output_tokens = record.output_tokens,
                cost_nanos = record.cost_nanodollars,
                latency_ms = record.latency_ms,
                "Vision call completed"
            ),
            Some(code) => tracing::warn!(
                model = %record.model,
                caller = record.caller,
                job_id = ?record.job_id,
                attempt = record.attempt,
                error_code = code,
                request_id = record.request_id.as_deref().unwrap_or(""),
                latency_ms = record.latency_ms,
                "Vision call failed"
            ),
        }
    }
}
