//! Provider Registry - Manages agent provider instances.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::anthropic::AnthropicProvider;
use crate::error::{AiError, AiResult};
use crate::openai::OpenAIProvider;
use crate::provider::{AgentProvider, ProviderConfig};

/// Registry of agent providers keyed by name.
pub struct ProviderRegistry {
    providers: RwLock<HashMap<String, Arc<dyn AgentProvider>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a provider, replacing any previous one with the same name.
    pub fn register(&self, provider: Arc<dyn AgentProvider>) {
        let mut providers = self
            .providers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        providers.insert(provider.name().to_string(), provider);
    }

    /// Get a provider by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn AgentProvider>> {
        let providers = self.providers.read().unwrap_or_else(PoisonError::into_inner);
        providers.get(name).cloned()
    }

    /// Check if a provider is registered.
    pub fn has_provider(&self, name: &str) -> bool {
        let providers = self.providers.read().unwrap_or_else(PoisonError::into_inner);
        providers.contains_key(name)
    }

    /// Get all registered provider names, sorted.
    pub fn provider_names(&self) -> Vec<String> {
        let providers = self.providers.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = providers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Get a configured provider, returning an error if it is missing or
    /// has no credentials.
    pub fn require(&self, name: &str) -> AiResult<Arc<dyn AgentProvider>> {
        let provider = self
            .get(name)
            .ok_or_else(|| AiError::UnknownProvider(name.to_string()))?;
        if !provider.is_configured() {
            return Err(AiError::NotConfigured {
                provider: provider.name(),
                env_var: env_var_for(provider.name()),
            });
        }
        Ok(provider)
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Conventional API key variable for a provider.
pub fn env_var_for(name: &str) -> &'static str {
    match name {
        "openai" => "OPENAI_API_KEY",
        _ => "ANTHROPIC_API_KEY",
    }
}

/// Build a hosted provider by name (`anthropic`/`claude`, `openai`).
pub fn build_provider(name: &str, config: &ProviderConfig) -> AiResult<Arc<dyn AgentProvider>> {
    match name.to_ascii_lowercase().as_str() {
        "anthropic" | "claude" => Ok(Arc::new(AnthropicProvider::new(config)?)),
        "openai" => Ok(Arc::new(OpenAIProvider::new(config)?)),
        other => Err(AiError::UnknownProvider(other.to_string())),
    }
}
