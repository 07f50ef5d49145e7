//! Provider error taxonomy
//!
//! Every backend failure is folded into one of these variants at the adapter
//! boundary. Transport and rate-limit failures are retryable; everything else
//! is terminal for the request that hit it.

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by an [`LlmProvider`](crate::providers::LlmProvider).
#[derive(Error, Debug)]
pub enum ProviderError {
    /// Connection failure, stream cut short, or a 5xx from the backend.
    #[error("transport error: {0}")]
    Transport(String),

    /// HTTP 429 or an equivalent in-stream rate-limit event.
    #[error("rate limited: retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// The backend answered, but not in a shape we can interpret.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// The per-call deadline elapsed.
    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),

    /// A 4xx other than 429 (bad key, unknown model, invalid payload).
    #[error("request rejected (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    /// The provider exists but has no credentials configured.
    #[error("provider not configured: {0}")]
    NotConfigured(String),

    /// No adapter is registered under the requested name.
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
}

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

impl ProviderError {
    /// Stable tag sent to clients in `error` envelopes.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport(_) => "ProviderTransportError",
            Self::RateLimited { .. } => "ProviderRateLimited",
            Self::MalformedResponse(_) => "ProviderMalformedResponse",
            Self::Timeout(_) => "ProviderTimeout",
            Self::Rejected { .. } => "ProviderRejected",
            Self::NotConfigured(_) | Self::UnknownProvider(_) => "UnknownProvider",
        }
    }

    /// Whether the caller may retry the same request with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::RateLimited { .. })
    }

    /// Backend-suggested wait before retrying, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after_ms } => Some(Duration::from_millis(*retry_after_ms)),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::MalformedResponse(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        Self::MalformedResponse(err.to_string())
    }
}
