//! Credential redaction for text that may end up in logs or error envelopes.
//!
//! Provider error bodies sometimes echo the request headers back; scrub them
//! before they travel any further.

use regex::Regex;
use std::sync::LazyLock;

static PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        // API key patterns (sk-..., sk-ant-..., key-...)
        ("sk-[a-zA-Z0-9_\\-]{20,}", "[REDACTED_API_KEY]"),
        ("key-[a-zA-Z0-9]{20,}", "[REDACTED_API_KEY]"),
        // Google API keys
        ("AIza[0-9A-Za-z_\\-]{30,}", "[REDACTED_API_KEY]"),
        // Bearer tokens in text
        ("Bearer [a-zA-Z0-9._\\-]{20,}", "Bearer [REDACTED]"),
        // Generic long hex tokens (auth handshake tokens are 64 hex chars)
        ("[a-fA-F0-9]{40,}", "[REDACTED_TOKEN]"),
    ]
    .into_iter()
    .filter_map(|(pattern, replacement)| Regex::new(pattern).ok().map(|re| (re, replacement)))
    .collect()
});

/// Redact credentials/secrets from text content.
pub fn redact_credentials(text: &str) -> String {
    let mut result = text.to_string();
    for (re, replacement) in PATTERNS.iter() {
        if re.is_match(&result) {
            result = re.replace_all(&result, *replacement).into_owned();
        }
    }
    result
}

/// Redact and cap an upstream error body for display.
pub fn summarize_body(body: &str, max_chars: usize) -> String {
    let redacted = redact_credentials(body.trim());
    if redacted.chars().count() <= max_chars {
        return redacted;
    }
    let mut cut: String = redacted.chars().take(max_chars).collect();
    cut.push('…');
    cut
}

/// Short, log-safe prefix of a secret token.
pub fn token_prefix(token: &str) -> String {
    let prefix: String = token.chars().take(8).collect();
    format!("{}…", prefix)
}
