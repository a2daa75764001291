//! File-based configuration loading
//!
//! Loads provider connections, model aliases and pricing from a JSON file

use crate::config::pricing::{ConfigSource, Layers, ModelAliases, ModelPricing, PricingTable};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

/// Provider types with a shipped adapter
pub const PROVIDER_TYPES: [&str; 2] = ["openai", "anthropic"];

/// Application configuration loaded from JSON file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Provider configurations keyed by provider name
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,

    /// Alias to `provider:model` mapping
    #[serde(rename = "modelAliases", default)]
    pub model_aliases: HashMap<String, String>,

    /// Pricing overrides keyed by `provider:model`
    #[serde(default)]
    pub pricing: HashMap<String, ModelPricing>,
}

/// Provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider type ("openai" or "anthropic")
    #[serde(rename = "type")]
    pub provider_type: String,

    /// Base URL for the provider API (defaults per type)
    #[serde(rename = "baseUrl", default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// API key (can be empty if using env var)
    #[serde(rename = "apiKey", default)]
    pub api_key: String,

    /// Provider-specific options
    #[serde(default)]
    pub options: ProviderOptions,

    /// Model configurations for this provider
    #[serde(default)]
    pub models: HashMap<String, ModelConfig>,
}

/// Provider-specific options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderOptions {
    /// Custom headers to add to requests
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,

    /// API version header override
    #[serde(rename = "apiVersion", default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,

    /// Local servers (ollama, llama.cpp) accept requests without a key
    #[serde(rename = "requiresApiKey", default = "default_true")]
    pub requires_api_key: bool,
}

impl Default for ProviderOptions {
    fn default() -> Self {
        Self {
            headers: HashMap::new(),
            api_version: None,
            requires_api_key: true,
        }
    }
}

/// Model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model name to use with the upstream provider
    pub name: String,

    /// Maximum tokens limit for this model
    #[serde(rename = "maxTokens", skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

fn default_true() -> bool {
    true
}

/// Default API base URL for a provider type
pub fn default_base_url(provider_type: &str) -> Option<&'static str> {
    match provider_type {
        "openai" => Some("https://api.openai.com/v1"),
        "anthropic" => Some("https://api.anthropic.com/v1"),
        _ => None,
    }
}

impl ProviderConfig {
    /// Configuration for a provider type with default endpoint and no key
    pub fn builtin(provider_type: &str) -> Self {
        Self {
            provider_type: provider_type.to_string(),
            base_url: None,
            api_key: String::new(),
            options: ProviderOptions::default(),
            models: HashMap::new(),
        }
    }

    /// Configured base URL or the type default, without trailing slash
    pub fn resolved_base_url(&self) -> Option<String> {
        self.base_url
            .as_deref()
            .or_else(|| default_base_url(&self.provider_type))
            .map(|url| url.trim_end_matches('/').to_string())
    }
}

impl AppConfig {
    /// Load configuration from JSON file
    pub fn load(path: &Path) -> Result<Self> {
        info!("Loading configuration from: {:?}", path);

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: AppConfig = serde_json::from_str(&content)
            .with_context(|| "Failed to parse config JSON")?;

        config.validate()?;

        debug!("Loaded {} providers, {} aliases", config.providers.len(), config.model_aliases.len());
        Ok(config)
    }

    /// Load configuration from default locations
    /// Searches in order:
    /// 1. ~/.config/chatrelay/chatrelay.json
    /// 2. ./chatrelay.json
    ///
    /// Falls back to built-in providers when no file exists.
    pub fn load_default() -> Result<Self> {
        // Try home config directory first
        if let Some(home) = dirs::home_dir() {
            let config_path = home.join(".config").join("chatrelay").join("chatrelay.json");
            if config_path.exists() {
                return Self::load(&config_path);
            }
        }

        // Try current directory
        let local_path = Path::new("chatrelay.json");
        if local_path.exists() {
            return Self::load(local_path);
        }

        info!("No configuration file found, using built-in providers");
        Ok(Self::default())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        for (name, provider) in &self.providers {
            if name.is_empty() || name.contains(':') {
                anyhow::bail!("Invalid provider name '{}'", name);
            }

            // Validate provider type
            if !PROVIDER_TYPES.contains(&provider.provider_type.as_str()) {
                anyhow::bail!("Invalid provider type '{}' for provider '{}'", provider.provider_type, name);
            }

            // Validate base URL
            if let Some(base_url) = &provider.base_url {
                if !base_url.starts_with("http") {
                    anyhow::bail!("Invalid base URL for provider '{}': {}", name, base_url);
                }
            }

            for (model_name, model_config) in &provider.models {
                if model_config.name.is_empty() {
                    anyhow::bail!("Model '{}' in provider '{}' must have a name", model_name, name);
                }
            }
        }

        for (alias, target) in &self.model_aliases {
            if target.is_empty() {
                anyhow::bail!("Model alias '{}' has an empty target", alias);
            }
        }

        Ok(())
    }

    /// Provider by name; known provider types are implicitly available under their own name
    pub fn provider(&self, name: &str) -> Option<ProviderConfig> {
        self.providers.get(name).cloned().or_else(|| {
            PROVIDER_TYPES.contains(&name).then(|| ProviderConfig::builtin(name))
        })
    }

    /// Upstream model name for a configured model key, or the key itself
    pub fn upstream_model<'a>(&'a self, provider: &str, model: &'a str) -> &'a str {
        self.providers
            .get(provider)
            .and_then(|p| p.models.get(model))
            .map(|m| m.name.as_str())
            .unwrap_or(model)
    }

    /// File aliases as a `Cli` layer, so env and script layers can override them
    pub fn alias_layers(&self) -> Layers<String> {
        Layers::new().layer(ConfigSource::Cli, self.model_aliases.clone())
    }

    /// Alias map from this file alone
    pub fn aliases(&self) -> ModelAliases {
        ModelAliases::from_layers(&self.alias_layers())
    }

    /// Built-in prices overridden by file entries and `CHATRELAY_PRICING`
    pub fn pricing_table(&self) -> PricingTable {
        PricingTable::with_defaults(Layers::new().layer(ConfigSource::Cli, self.pricing.clone()))
    }

    /// List all configured model ids as `provider:model`
    pub fn list_model_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        for (provider_name, provider) in &self.providers {
            for model_name in provider.models.keys() {
                ids.push(format!("{}:{}", provider_name, model_name));
            }
        }
        ids.sort();
        ids
    }
}
