//! Error handling module
//!
//! Defines error types and handling logic used in the project

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] anyhow::Error),

    /// No API key could be resolved for a provider
    #[error("Missing credentials for provider '{0}'")]
    MissingCredentials(String),

    /// Model identifier names a provider that is not configured
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    /// Message role or feature the target provider cannot express
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Request validation failed
    #[error("Request validation failed: {0}")]
    Validation(String),

    /// HTTP client error
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Upstream answered with a non-success status
    #[error("Provider API request failed: {status} - {body}")]
    HttpStatus { status: u16, body: String },

    /// Stream broke after bytes started arriving
    #[error("Stream error: {0}")]
    Stream(String),

    /// Provider sent an event we could not interpret
    #[error("Provider protocol error: {0}")]
    Protocol(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Cache store failure
    #[error("Cache error: {0}")]
    Cache(String),

    /// Cancellation requested by the caller
    #[error("Request cancelled")]
    Cancelled,
}

/// Broad error taxonomy used to decide propagation policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Surfaced to the caller before any network call
    Configuration,
    /// Connection level failure, retried then folded into `fail`
    Transport,
    /// User initiated, folded into `cancel`
    Cancellation,
    /// Malformed or error event from the provider, folded into `fail`
    Protocol,
    /// Everything else
    Internal,
}

/// Serialized error record written to traces
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error type
    #[serde(rename = "type")]
    pub error_type: String,
    /// Error message
    pub message: String,
    /// HTTP status (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Details (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl AppError {
    /// Get error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            AppError::Config(_)
            | AppError::MissingCredentials(_)
            | AppError::UnknownProvider(_)
            | AppError::NotSupported(_)
            | AppError::Validation(_) => ErrorCategory::Configuration,
            AppError::HttpClient(_) | AppError::HttpStatus { .. } | AppError::Stream(_) => {
                ErrorCategory::Transport
            }
            AppError::Cancelled => ErrorCategory::Cancellation,
            AppError::Protocol(_) | AppError::Serialization(_) => ErrorCategory::Protocol,
            AppError::Io(_) | AppError::Cache(_) => ErrorCategory::Internal,
        }
    }

    /// Get error type string
    pub fn error_type(&self) -> &'static str {
        match self {
            AppError::Config(_) => "configuration_error",
            AppError::MissingCredentials(_) => "authentication_error",
            AppError::UnknownProvider(_) => "not_found_error",
            AppError::NotSupported(_) => "not_supported_error",
            AppError::Validation(_) => "invalid_request_error",
            AppError::HttpStatus { status: 429, .. } => "rate_limit_error",
            AppError::HttpClient(_) | AppError::HttpStatus { .. } => "api_error",
            AppError::Stream(_) => "stream_error",
            AppError::Protocol(_) | AppError::Serialization(_) => "protocol_error",
            AppError::Cancelled => "cancelled",
            AppError::Io(_) | AppError::Cache(_) => "internal_error",
        }
    }

    /// Whether a connection attempt that produced this error may be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::HttpClient(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            AppError::HttpStatus { status, .. } => {
                matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
            }
            _ => false,
        }
    }

    /// Whether this error escapes a completion call instead of folding into `fail`
    pub fn is_configuration(&self) -> bool {
        self.category() == ErrorCategory::Configuration
    }

    /// Convert to the record stored on a trace
    pub fn to_error_response(&self) -> ErrorResponse {
        let status = match self {
            AppError::HttpStatus { status, .. } => Some(*status),
            AppError::HttpClient(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        };
        ErrorResponse {
            error_type: self.error_type().to_string(),
            message: self.to_string(),
            status,
            details: None,
        }
    }
}

/// Result type alias
pub type AppResult<T> = Result<T, AppError>;

/// Error context extension trait
pub trait ErrorContext<T> {
    /// Add validation error context
    fn validation_context(self, message: &str) -> AppResult<T>;

    /// Add protocol error context
    fn protocol_context(self, message: &str) -> AppResult<T>;

    /// Add cache error context
    fn cache_context(self, message: &str) -> AppResult<T>;
}

impl<T, E> ErrorContext<T> for Result<T, E>
where
    E: std::fmt::Display,
{
    fn validation_context(self, message: &str) -> AppResult<T> {
        self.map_err(|e| AppError::Validation(format!("{}: {}", message, e)))
    }

    fn protocol_context(self, message: &str) -> AppResult<T> {
        self.map_err(|e| AppError::Protocol(format!("{}: {}", message, e)))
    }

    fn cache_context(self, message: &str) -> AppResult<T> {
        self.map_err(|e| AppError::Cache(format!("{}: {}", message, e)))
    }
}
