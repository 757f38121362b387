//! Gateway configuration (layered: code > env).
//!
//! Acts as the secret resolver for provider adapters: keys set explicitly
//! take precedence over keys picked up from the environment.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use crate::error::{AgentError, Result};

/// Layered configuration for the gateway core.
#[derive(Clone, Default)]
pub struct GatewayConfig {
    api_keys: Arc<RwLock<HashMap<String, String>>>,
    base_urls: Arc<RwLock<HashMap<String, String>>>,
}

impl fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print key material.
        let keys: Vec<String> = self
            .api_keys
            .read()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("GatewayConfig")
            .field("api_keys", &keys)
            .field("base_urls", &self.base_urls)
            .finish()
    }
}

impl GatewayConfig {
    /// Create an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from environment variables (OPENAI_API_KEY, ANTHROPIC_API_KEY, ...).
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv(); // load .env if present, ignore error
        let config = Self::new();

        let env_mappings = [
            ("OPENAI_API_KEY", "openai"),
            ("ANTHROPIC_API_KEY", "anthropic"),
        ];
        for (env_var, provider) in &env_mappings {
            if let Ok(key) = std::env::var(env_var) {
                config.set_api_key(provider, key);
            }
        }

        let url_mappings = [
            ("OPENAI_BASE_URL", "openai"),
            ("ANTHROPIC_BASE_URL", "anthropic"),
        ];
        for (env_var, provider) in &url_mappings {
            if let Ok(url) = std::env::var(env_var) {
                config.set_base_url(provider, url);
            }
        }

        config
    }

    /// Set an API key for a provider.
    pub fn set_api_key(&self, provider: &str, key: impl Into<String>) {
        if let Ok(mut keys) = self.api_keys.write() {
            keys.insert(provider.to_string(), key.into());
        }
    }

    /// Resolve an API key for a provider, if configured.
    pub fn api_key(&self, provider: &str) -> Option<String> {
        self.api_keys.read().ok()?.get(provider).cloned()
    }

    /// Resolve an API key or fail with a fatal, non-retryable error.
    pub fn require_api_key(&self, provider: &str) -> Result<String> {
        self.api_key(provider).ok_or_else(|| {
            AgentError::Authentication(format!("Missing API key for provider '{provider}'"))
        })
    }

    /// Override the base URL for a provider.
    pub fn set_base_url(&self, provider: &str, url: impl Into<String>) {
        if let Ok(mut urls) = self.base_urls.write() {
            urls.insert(provider.to_string(), url.into());
        }
    }

    /// Base URL override for a provider, if configured.
    pub fn base_url(&self, provider: &str) -> Option<String> {
        self.base_urls.read().ok()?.get(provider).cloned()
    }
}
