//! Provider registry keyed by canonical name
//!
//! Requests name a provider (or one of its aliases); the router hands back the
//! adapter along with a copy of the request whose provider and model fields
//! are normalized.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use super::anthropic::AnthropicProvider;
use super::echo::EchoProvider;
use super::google::GoogleProvider;
use super::openai::OpenAiProvider;
use super::types::{CompletionRequest, LlmProvider};
use crate::config::{ProviderConfig, ProvidersConfig};
use crate::error::{ProviderError, ProviderResult};

/// Names the router understands, whether or not they are configured
const KNOWN_PROVIDERS: [&str; 4] = ["anthropic", "openai", "google", "echo"];

/// Map user-facing aliases onto canonical provider names.
pub fn canonical_name(name: &str) -> String {
    let lower = name.trim().to_ascii_lowercase();
    match lower.as_str() {
        "claude" => "anthropic".to_string(),
        "gpt" | "chatgpt" => "openai".to_string(),
        "gemini" => "google".to_string(),
        _ => lower,
    }
}

#[derive(Default)]
pub struct ProviderRouter {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
}

impl ProviderRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) an adapter under its own provider name.
    pub fn register(&mut self, provider: Arc<dyn LlmProvider>) {
        let name = provider.provider_name().to_string();
        if self.providers.insert(name.clone(), provider).is_some() {
            warn!("Replaced provider '{}'", name);
        }
    }

    pub fn with(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.register(provider);
        self
    }

    /// Build the router from configuration. `echo` is registered only when
    /// enabled; network providers only when an API key resolves.
    pub fn from_config(config: &ProvidersConfig) -> ProviderResult<Self> {
        let mut router = Self::new();
        if config.echo {
            router.register(Arc::new(EchoProvider::new()));
        }

        if let Some(key) = api_key(config.anthropic.as_ref(), "ANTHROPIC_API_KEY") {
            let mut provider = AnthropicProvider::new(key)?;
            if let Some(cfg) = &config.anthropic {
                if let Some(url) = &cfg.base_url {
                    provider = provider.with_base_url(url.clone());
                }
                if let Some(model) = configured_model(cfg) {
                    provider = provider.with_default_model(model);
                }
            }
            router.register(Arc::new(provider));
        }
        if let Some(key) = api_key(config.openai.as_ref(), "OPENAI_API_KEY") {
            let mut provider = OpenAiProvider::new(key)?;
            if let Some(cfg) = &config.openai {
                if let Some(url) = &cfg.base_url {
                    provider = provider.with_base_url(url.clone());
                }
                if let Some(model) = configured_model(cfg) {
                    provider = provider.with_default_model(model);
                }
            }
            router.register(Arc::new(provider));
        }
        if let Some(key) = api_key(config.google.as_ref(), "GOOGLE_API_KEY") {
            let mut provider = GoogleProvider::new(key)?;
            if let Some(cfg) = &config.google {
                if let Some(url) = &cfg.base_url {
                    provider = provider.with_base_url(url.clone());
                }
                if let Some(model) = configured_model(cfg) {
                    provider = provider.with_default_model(model);
                }
            }
            router.register(Arc::new(provider));
        }

        if router.names().is_empty() {
            warn!("No providers configured: every completion will fail");
        } else {
            info!("Providers available: {}", router.names().join(", "));
        }
        Ok(router)
    }

    /// Look up an adapter by name or alias.
    pub fn get(&self, name: &str) -> ProviderResult<Arc<dyn LlmProvider>> {
        let canonical = canonical_name(name);
        if let Some(provider) = self.providers.get(&canonical) {
            return Ok(provider.clone());
        }
        if KNOWN_PROVIDERS.contains(&canonical.as_str()) {
            Err(ProviderError::NotConfigured(canonical))
        } else {
            Err(ProviderError::UnknownProvider(name.to_string()))
        }
    }

    /// Pick the adapter for a request and fill in the default model.
    pub fn resolve(
        &self,
        request: &CompletionRequest,
    ) -> ProviderResult<(Arc<dyn LlmProvider>, CompletionRequest)> {
        let provider = self.get(&request.provider)?;
        let mut normalized = request.clone();
        normalized.provider = provider.provider_name().to_string();
        if normalized.model.trim().is_empty() {
            normalized.model = provider.default_model().to_string();
        }
        Ok((provider, normalized))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }
}

fn api_key(config: Option<&ProviderConfig>, fallback_env: &str) -> Option<String> {
    match config {
        Some(cfg) => cfg.resolve_api_key(fallback_env),
        None => std::env::var(fallback_env)
            .ok()
            .filter(|k| !k.trim().is_empty()),
    }
}

fn configured_model(cfg: &ProviderConfig) -> Option<String> {
    cfg.default_model.clone().filter(|m| !m.trim().is_empty())
}
