//! Failures of a vision-model call, classified by what the caller can do next.

use std::time::Duration;
use thiserror::Error;

/// What the provider told us about a failed call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub http_status: Option<u16>,
    /// The `error.code` field of the body, stringified when numeric.
    pub provider_code: Option<String>,
    /// `x-request-id` header, for support tickets.
    pub request_id: Option<String>,
}

impl ErrorContext {
    pub fn from_status(status: u16) -> Self {
        Self {
            http_status: Some(status),
            ..Self::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    /// HTTP 429. `retry_after` comes from the `Retry-After` header when present.
    #[error("rate limited by provider (retry after {retry_after:?})")]
    RateLimited {
        retry_after: Option<Duration>,
        context: ErrorContext,
    },

    /// HTTP 401/403: the key is wrong, revoked or out of credit.
    #[error("provider rejected credentials: {message}")]
    Unauthorized {
        message: String,
        context: ErrorContext,
    },

    /// Any other 4xx. Sending the same request again will fail again.
    #[error("provider rejected request: {message}")]
    Rejected {
        message: String,
        context: ErrorContext,
    },

    /// 5xx, or a 2xx whose body we could not use.
    #[error("provider failure: {message}")]
    Upstream {
        message: String,
        retryable: bool,
        context: ErrorContext,
    },

    /// The model declined to describe the image.
    #[error("model refused: {0}")]
    Refused(String),

    /// A payload exceeded a local size guard; nothing was sent or kept.
    #[error("{what} is {size} bytes (limit {limit})")]
    TooLarge {
        what: &'static str,
        size: usize,
        limit: usize,
    },

    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Missing or malformed settings; raised before any request.
    #[error("gateway misconfigured: {0}")]
    Config(String),
}

impl ProviderError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn refused(message: impl Into<String>) -> Self {
        Self::Refused(message.into())
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Upstream {
            message: message.into(),
            retryable: false,
            context: ErrorContext::default(),
        }
    }

    /// Classify a non-2xx response.
    pub fn from_status(
        message: impl Into<String>,
        retry_after: Option<Duration>,
        context: ErrorContext,
    ) -> Self {
        let message = message.into();
        match context.http_status.unwrap_or(0) {
            429 => Self::RateLimited {
                retry_after,
                context,
            },
            401 | 403 => Self::Unauthorized { message, context },
            s if s >= 500 => Self::Upstream {
                message,
                retryable: true,
                context,
            },
            _ => Self::Rejected { message, context },
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Timeout(_) => true,
            Self::Upstream { retryable, .. } => *retryable,
            Self::Transport(e) => e.is_timeout() || e.is_connect(),
            Self::Unauthorized { .. }
            | Self::Rejected { .. }
            | Self::Refused(_)
            | Self::TooLarge { .. }
            | Self::Config(_) => false,
        }
    }

    /// No later request with the same gateway can succeed.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::Unauthorized { .. } | Self::Config(_))
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::Unauthorized { .. } => "unauthorized",
            Self::Rejected { .. } => "rejected",
            Self::Upstream { .. } => "upstream",
            Self::Refused(_) => "refused",
            Self::TooLarge { .. } => "too_large",
            Self::Timeout(_) => "timeout",
            Self::Transport(_) => "transport",
            Self::Config(_) => "config",
        }
    }

    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::RateLimited { context, .. }
            | Self::Unauthorized { context, .. }
            | Self::Rejected { context, .. }
            | Self::Upstream { context, .. } => Some(context),
            _ => None,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        self.context()?.request_id.as_deref()
    }
}
