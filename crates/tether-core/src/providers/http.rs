//! HTTP plumbing shared by the network-backed adapters

use reqwest::{Client, Response, StatusCode};
use std::time::Duration;
use tracing::warn;

use crate::error::{ProviderError, ProviderResult};
use crate::redact::summarize_body;

const MAX_ERROR_BODY_CHARS: usize = 400;
const DEFAULT_RETRY_AFTER_MS: u64 = 1_000;

/// Build the HTTP client used by an adapter.
///
/// No overall request timeout is set: the orchestrator owns the per-call
/// deadline, and a streaming body may legitimately run for minutes.
pub fn build_client() -> ProviderResult<Client> {
    Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| ProviderError::Transport(format!("failed to build HTTP client: {}", e)))
}

/// Pass successful responses through; fold failures into [`ProviderError`].
pub async fn check_status(provider: &str, response: Response) -> ProviderResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let retry_after_ms = retry_after_header(&response);
    let body = response.text().await.unwrap_or_default();
    let err = classify_failure(status, retry_after_ms, &body);
    warn!(provider = provider, status = status.as_u16(), error = %err, "provider call failed");
    Err(err)
}

/// Map an HTTP failure onto the provider error taxonomy.
pub fn classify_failure(status: StatusCode, retry_after_ms: Option<u64>, body: &str) -> ProviderError {
    let message = summarize_body(body, MAX_ERROR_BODY_CHARS);
    match status.as_u16() {
        429 => ProviderError::RateLimited {
            retry_after_ms: retry_after_ms.unwrap_or(DEFAULT_RETRY_AFTER_MS),
        },
        // 529 is Anthropic's "overloaded"
        500..=599 => ProviderError::Transport(format!("HTTP {}: {}", status.as_u16(), message)),
        code => ProviderError::Rejected {
            status: code,
            message,
        },
    }
}

fn retry_after_header(response: &Response) -> Option<u64> {
    let value = response.headers().get(reqwest::header::RETRY_AFTER)?.to_str().ok()?;
    let secs: f64 = value.trim().parse().ok()?;
    if secs.is_finite() && secs >= 0.0 {
        Some((secs * 1000.0) as u64)
    } else {
        None
    }
}

/// Join a configured base URL and an API path without doubling slashes.
pub fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}
