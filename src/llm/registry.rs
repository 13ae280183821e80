use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{AppConfig, LlmConfig};
use crate::errors::{AgentError, AgentResult};
use crate::llm::provider::ModelClient;
use crate::llm::providers::openai_compatible::OpenAiCompatibleClient;
use crate::llm::types::CallConfig;

/// Registry of configured model clients, keyed by their config.toml identifier.
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ModelClient>>,
    active: String,
    llm_config: LlmConfig,
}

impl ProviderRegistry {
    pub fn new(active: String) -> Self {
        Self {
            providers: HashMap::new(),
            active,
            llm_config: LlmConfig::default(),
        }
    }

    pub fn register(&mut self, provider: Arc<dyn ModelClient>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    /// Active client plus the sampling parameters configured for it. Providers
    /// registered by hand (no config entry) get `CallConfig::default()`.
    pub fn active(&self) -> AgentResult<(Arc<dyn ModelClient>, CallConfig)> {
        let provider = self.providers.get(&self.active).cloned().ok_or_else(|| {
            AgentError::Config(format!("Active provider '{}' not found in registry", self.active))
        })?;
        let cfg = self
            .llm_config
            .providers
            .get(&self.active)
            .map(|entry| CallConfig {
                model: entry.model.clone(),
                temperature: entry.temperature,
                top_p: entry.top_p,
                frequency_penalty: entry.frequency_penalty,
                max_tokens: entry.max_tokens,
            })
            .unwrap_or_default();
        tracing::debug!(provider = %self.active, model = %cfg.model, "resolved active model");
        Ok((provider, cfg))
    }

    /// Build a registry from the loaded app config.
    /// API keys are read from environment variables named `PHONE_AGENT_<ID>_API_KEY`.
    pub fn from_config(config: &AppConfig) -> Self {
        let mut registry = Self {
            providers: HashMap::new(),
            active: config.llm.active_provider.clone(),
            llm_config: config.llm.clone(),
        };
        for (id, entry) in &config.llm.providers {
            let api_key = std::env::var(format!("PHONE_AGENT_{}_API_KEY", id.to_uppercase()))
                .unwrap_or_else(|_| entry.api_key.clone().unwrap_or_default());
            let provider = OpenAiCompatibleClient::new(id.clone(), entry.api_base.clone(), api_key);
            registry.register(Arc::new(provider));
        }
        registry
    }
}
