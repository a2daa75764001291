//! Configuration management module
//!
//! Responsible for loading environment settings, provider configuration files,
//! pricing and model alias tables.

pub mod file;
pub mod pricing;
pub mod settings;

pub use file::{AppConfig, ModelConfig, ProviderConfig, ProviderOptions};
pub use pricing::{ConfigSource, Layers, ModelAliases, ModelPricing, PricingTable};
pub use settings::Settings;
