//! Model pricing and alias tables
//!
//! Both tables are immutable once built. They are assembled from layers
//! tagged with a [`ConfigSource`]; a higher source overrides a lower one
//! key by key.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// Default share of the input price charged for cached prompt tokens
pub const DEFAULT_CACHE_REBATE: f64 = 0.5;

/// Environment variable holding a JSON pricing map
pub const PRICING_ENV: &str = "CHATRELAY_PRICING";

/// Per-model prices in dollars per million tokens
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub price_per_million_input_tokens: f64,
    pub price_per_million_output_tokens: f64,
    /// Fraction of the input price charged for cached tokens
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_cache_token_rebate: Option<f64>,
}

impl ModelPricing {
    pub fn new(input: f64, output: f64) -> Self {
        Self {
            price_per_million_input_tokens: input,
            price_per_million_output_tokens: output,
            input_cache_token_rebate: None,
        }
    }

    pub fn with_rebate(mut self, rebate: f64) -> Self {
        self.input_cache_token_rebate = Some(rebate);
        self
    }

    /// Effective cache rebate
    pub fn cache_rebate(&self) -> f64 {
        self.input_cache_token_rebate.unwrap_or(DEFAULT_CACHE_REBATE)
    }

    fn is_valid(&self) -> bool {
        self.price_per_million_input_tokens >= 0.0
            && self.price_per_million_output_tokens >= 0.0
            && self.input_cache_token_rebate.map_or(true, |r| (0.0..=1.0).contains(&r))
    }
}

/// Where a configuration layer came from, in increasing precedence
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigSource {
    Default,
    Cli,
    Env,
    Script,
}

static BUILTIN_PRICING: Lazy<HashMap<String, ModelPricing>> = Lazy::new(|| {
    let entries = [
        ("openai:gpt-4o", ModelPricing::new(2.5, 10.0)),
        ("openai:gpt-4o-2024-08-06", ModelPricing::new(2.5, 10.0)),
        ("openai:gpt-4o-mini", ModelPricing::new(0.15, 0.6)),
        ("openai:gpt-4-turbo", ModelPricing::new(10.0, 30.0)),
        ("openai:o1", ModelPricing::new(15.0, 60.0)),
        ("openai:o1-mini", ModelPricing::new(3.0, 12.0)),
        ("anthropic:claude-3-5-sonnet-20240620", ModelPricing::new(3.0, 15.0).with_rebate(0.1)),
        ("anthropic:claude-3-5-sonnet-20241022", ModelPricing::new(3.0, 15.0).with_rebate(0.1)),
        ("anthropic:claude-3-5-haiku-20241022", ModelPricing::new(0.8, 4.0).with_rebate(0.1)),
        ("anthropic:claude-3-opus-20240229", ModelPricing::new(15.0, 75.0).with_rebate(0.1)),
        ("anthropic:claude-3-haiku-20240307", ModelPricing::new(0.25, 1.25).with_rebate(0.1)),
    ];
    entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
});

/// Layer collector shared by pricing and alias tables
#[derive(Debug, Clone)]
pub struct Layers<V> {
    layers: BTreeMap<ConfigSource, HashMap<String, V>>,
}

impl<V: Clone> Default for Layers<V> {
    fn default() -> Self {
        Self { layers: BTreeMap::new() }
    }
}

impl<V: Clone> Layers<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add entries from `source`; repeated sources merge
    pub fn layer(mut self, source: ConfigSource, entries: impl IntoIterator<Item = (String, V)>) -> Self {
        self.layers.entry(source).or_default().extend(entries);
        self
    }

    /// Flatten, highest precedence last
    fn flatten(&self, normalize: impl Fn(&str) -> String) -> HashMap<String, V> {
        let mut merged = HashMap::new();
        for (source, entries) in &self.layers {
            for (key, value) in entries {
                if merged.insert(normalize(key), value.clone()).is_some() {
                    debug!("{:?} layer overrides '{}'", source, key);
                }
            }
        }
        merged
    }
}

/// Immutable pricing table keyed by lowercase `provider:model`
#[derive(Debug, Clone, Default)]
pub struct PricingTable {
    entries: HashMap<String, ModelPricing>,
}

impl PricingTable {
    /// Table without any entries
    pub fn empty() -> Self {
        Self::default()
    }

    /// Built-in prices only
    pub fn builtin() -> Self {
        Self::from_layers(&Layers::new().layer(ConfigSource::Default, BUILTIN_PRICING.clone()))
    }

    /// Build from layers; invalid entries are dropped with a warning
    pub fn from_layers(layers: &Layers<ModelPricing>) -> Self {
        let entries = layers
            .flatten(|k| k.to_lowercase())
            .into_iter()
            .filter(|(model, pricing)| {
                let valid = pricing.is_valid();
                if !valid {
                    warn!("Ignoring invalid pricing for '{}'", model);
                }
                valid
            })
            .collect();
        Self { entries }
    }

    /// Built-in defaults under the given extra layers, plus `CHATRELAY_PRICING` when set
    pub fn with_defaults(layers: Layers<ModelPricing>) -> Self {
        let mut layers = layers.layer(ConfigSource::Default, BUILTIN_PRICING.clone());
        if let Some(env_entries) = pricing_from_env() {
            layers = layers.layer(ConfigSource::Env, env_entries);
        }
        Self::from_layers(&layers)
    }

    /// Look up pricing, case-insensitively
    pub fn get(&self, model: &str) -> Option<&ModelPricing> {
        self.entries.get(&model.to_lowercase())
    }

    pub fn contains(&self, model: &str) -> bool {
        self.get(model).is_some()
    }

    /// Whether any entry belongs to `provider`
    pub fn has_provider(&self, provider: &str) -> bool {
        let prefix = format!("{}:", provider.to_lowercase());
        self.entries.keys().any(|k| k.starts_with(&prefix))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn pricing_from_env() -> Option<HashMap<String, ModelPricing>> {
    let raw = std::env::var(PRICING_ENV).ok()?;
    match serde_json::from_str(&raw) {
        Ok(entries) => Some(entries),
        Err(e) => {
            warn!("Ignoring {}: {}", PRICING_ENV, e);
            None
        }
    }
}

/// Immutable model alias map (`alias -> provider:model`)
#[derive(Debug, Clone, Default)]
pub struct ModelAliases {
    aliases: HashMap<String, String>,
}

impl ModelAliases {
    pub fn from_layers(layers: &Layers<String>) -> Self {
        Self { aliases: layers.flatten(|k| k.to_string()) }
    }

    /// Follow aliases until a non-alias id is reached; cycles stop at the last new id
    pub fn resolve<'a>(&'a self, id: &'a str) -> &'a str {
        let mut current = id;
        let mut seen = vec![id];
        while let Some(next) = self.aliases.get(current) {
            if seen.contains(&next.as_str()) {
                warn!("Model alias cycle at '{}'", next);
                break;
            }
            seen.push(next.as_str());
            current = next.as_str();
        }
        current
    }

    pub fn len(&self) -> usize {
        self.aliases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }
}
