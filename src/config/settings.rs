//! Application configuration settings
//!
//! Environment driven runtime settings: transport, retry, cache and logging

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main runtime settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Provider used for model ids without a `provider:` prefix
    pub default_provider: String,
    /// HTTP transport configuration
    pub transport: TransportConfig,
    /// Retry configuration
    pub retry: RetrySettings,
    /// Cache configuration
    pub cache: CacheConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// HTTP transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Explicit proxy URL; environment proxies apply when unset
    pub http_proxy: Option<String>,
    /// Request timeout in seconds
    pub timeout: u64,
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Extra attempts after the first
    pub max_retries: u32,
    /// Initial back-off in milliseconds
    pub retry_delay_ms: u64,
    /// Back-off ceiling in milliseconds
    pub max_delay_ms: u64,
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Directory for JSONL cache files; in-memory caches when unset
    pub dir: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive
    pub level: String,
    /// Log format (text/json)
    pub format: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_provider: "openai".to_string(),
            transport: TransportConfig {
                http_proxy: None,
                timeout: 300,
            },
            retry: RetrySettings {
                max_retries: 3,
                retry_delay_ms: 1000,
                max_delay_ms: 30000,
            },
            cache: CacheConfig { dir: None },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "text".to_string(),
            },
        }
    }
}

impl Settings {
    /// Create a new configuration instance
    pub fn new() -> Result<Self> {
        // Load .env file if it exists
        dotenv::dotenv().ok();

        let settings = Self {
            default_provider: get_env_or_default("CHATRELAY_DEFAULT_PROVIDER", "openai"),
            transport: TransportConfig {
                http_proxy: get_env_opt("CHATRELAY_HTTP_PROXY"),
                timeout: get_env_or_default("CHATRELAY_TIMEOUT", "300")
                    .parse()
                    .context("Invalid timeout value")?,
            },
            retry: RetrySettings {
                max_retries: get_env_or_default("CHATRELAY_RETRY", "3")
                    .parse()
                    .context("Invalid retry count")?,
                retry_delay_ms: get_env_or_default("CHATRELAY_RETRY_DELAY_MS", "1000")
                    .parse()
                    .context("Invalid retry delay")?,
                max_delay_ms: get_env_or_default("CHATRELAY_MAX_DELAY_MS", "30000")
                    .parse()
                    .context("Invalid maximum retry delay")?,
            },
            cache: CacheConfig {
                dir: get_env_opt("CHATRELAY_CACHE_DIR").map(PathBuf::from),
            },
            logging: LoggingConfig {
                level: get_env_or_default("RUST_LOG", "info"),
                format: get_env_or_default("LOG_FORMAT", "text"),
            },
        };

        // Validate configuration
        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration validity
    pub fn validate(&self) -> Result<()> {
        if self.default_provider.is_empty() || self.default_provider.contains(':') {
            anyhow::bail!("Invalid default provider: '{}'", self.default_provider);
        }

        if let Some(proxy) = &self.transport.http_proxy {
            if !proxy.starts_with("http") && !proxy.starts_with("socks") {
                anyhow::bail!("Invalid proxy URL format: {}", proxy);
            }
        }

        // Validate timeout values
        if self.transport.timeout == 0 {
            anyhow::bail!("Timeout values cannot be 0");
        }

        if self.retry.max_delay_ms < self.retry.retry_delay_ms {
            anyhow::bail!(
                "Maximum retry delay ({}ms) is below the initial delay ({}ms)",
                self.retry.max_delay_ms,
                self.retry.retry_delay_ms
            );
        }

        // Validate log level; full filter directives such as "chatrelay=debug" are accepted too
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) && !self.logging.level.contains('=') {
            anyhow::bail!("Invalid log level: {}", self.logging.level);
        }

        // Validate log format
        let valid_formats = ["text", "json"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            anyhow::bail!("Invalid log format: {}", self.logging.format);
        }

        Ok(())
    }
}

/// Get environment variable or default value
fn get_env_or_default(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Get a non-empty environment variable
fn get_env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
