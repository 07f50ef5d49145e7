//! Gateway configuration loaded from `~/.tether/config.toml`
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! gateway with no providers. Set `providers.echo = true` for the offline
//! provider used in local development.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    pub gateway: GatewayConfig,
    pub billing: BillingConfig,
    pub ledger: LedgerConfig,
    pub providers: ProvidersConfig,
}

/// `[gateway]`: listener, handshake and request limits
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub bind: String,
    pub port: u16,
    /// Shared secret the login flow presents on the control-plane endpoints
    pub control_token: Option<String>,
    pub token_ttl_secs: u64,
    pub token_sweep_interval_secs: u64,
    pub closed_retention_secs: u64,
    pub provider_timeout_secs: u64,
    pub max_queued_requests: usize,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8787,
            control_token: None,
            token_ttl_secs: 300,
            token_sweep_interval_secs: 60,
            closed_retention_secs: 30,
            provider_timeout_secs: 120,
            max_queued_requests: 4,
            max_retries: 2,
            retry_base_delay_ms: 500,
        }
    }
}

impl GatewayConfig {
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.token_sweep_interval_secs.max(1))
    }

    pub fn closed_retention(&self) -> Duration {
        Duration::from_secs(self.closed_retention_secs)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs.max(1))
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("bind", &self.bind)
            .field("port", &self.port)
            .field(
                "control_token",
                &self.control_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("token_ttl_secs", &self.token_ttl_secs)
            .field("token_sweep_interval_secs", &self.token_sweep_interval_secs)
            .field("closed_retention_secs", &self.closed_retention_secs)
            .field("provider_timeout_secs", &self.provider_timeout_secs)
            .field("max_queued_requests", &self.max_queued_requests)
            .field("max_retries", &self.max_retries)
            .field("retry_base_delay_ms", &self.retry_base_delay_ms)
            .finish()
    }
}

/// `[billing]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingConfig {
    pub credits_per_1k_tokens: f64,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            credits_per_1k_tokens: 1.0,
        }
    }
}

/// `[ledger]`: SQLite account store location
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub path: Option<PathBuf>,
}

impl LedgerConfig {
    pub fn resolved_path(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| tether_home().join("ledger.db"))
    }
}

/// `[providers.*]`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    /// Register the offline `echo` provider
    pub echo: bool,
    pub anthropic: Option<ProviderConfig>,
    pub openai: Option<ProviderConfig>,
    pub google: Option<ProviderConfig>,
}

/// Credentials and endpoint for one backend
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    /// Environment variable consulted when `api_key` is unset
    pub api_key_env: Option<String>,
    pub base_url: Option<String>,
    pub default_model: Option<String>,
}

impl ProviderConfig {
    /// Explicit key, else the configured env var, else `fallback_env`.
    pub fn resolve_api_key(&self, fallback_env: &str) -> Option<String> {
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.trim().is_empty()) {
            return Some(key.clone());
        }
        let env = self.api_key_env.as_deref().unwrap_or(fallback_env);
        std::env::var(env).ok().filter(|k| !k.trim().is_empty())
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("api_key_env", &self.api_key_env)
            .field("base_url", &self.base_url)
            .field("default_model", &self.default_model)
            .finish()
    }
}

/// `~/.tether`, or `./.tether` when no home directory is known
pub fn tether_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tether")
}

pub fn default_config_path() -> PathBuf {
    tether_home().join("config.toml")
}

impl TetherConfig {
    /// Load from `path`, or defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No config at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("Failed to parse config {}", path.display()))
    }

    /// Parse TOML after `${VAR}` expansion.
    pub fn parse(raw: &str) -> Result<Self> {
        let expanded = substitute_env(raw);
        let config: Self = toml::from_str(&expanded)?;
        Ok(config)
    }
}

/// Replace `${ENV_VAR}` placeholders. Unresolvable variables are left as-is.
pub fn substitute_env(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) if end > 0 => {
                let name = &after[..end];
                match std::env::var(name) {
                    Ok(value) => result.push_str(&value),
                    Err(_) => {
                        result.push_str("${");
                        result.push_str(name);
                        result.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            _ => {
                result.push_str("${");
                rest = after;
            }
        }
    }
    result.push_str(rest);
    result
}
