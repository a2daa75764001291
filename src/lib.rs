//! chatrelay Library
//!
//! Provider-agnostic streaming chat completions with response caching and
//! usage accounting
//!
//! ```no_run
//! use chatrelay::utils::logging::init_logging;
//! use chatrelay::{AppConfig, CompletionOptions, CompletionRequest, Message, Router, Settings, Trace};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let settings = Settings::new()?;
//! init_logging(&settings.logging)?;
//!
//! let router = Router::new(AppConfig::load_default()?, settings)?;
//! let request = CompletionRequest::new("openai:gpt-4o", vec![Message::user("Hello")]);
//! let response = router.complete(&request, &CompletionOptions::default(), None, &Trace::new()).await?;
//! println!("{:?}: {}", response.finish_reason, response.text);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod models;
pub mod providers;
pub mod services;
pub mod utils;

#[cfg(test)]
mod tests;

// Re-export common types
pub use config::{AppConfig, PricingTable, Settings};
pub use models::{anthropic, chat, openai};
pub use models::{CompletionRequest, CompletionResponse, FinishReason, Message, Usage};
pub use providers::{CompletionOptions, ConnectionConfig, ProviderAdapter, ProviderRegistry};
pub use services::{CacheMode, GenerationStats, Router};
pub use utils::error::{AppError, AppResult};
pub use utils::trace::Trace;

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Library description
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

/// Get version information
pub fn version_info() -> String {
    format!("{} v{} - {}", NAME, VERSION, DESCRIPTION)
}
