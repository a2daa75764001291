//! Provider module
//!
//! Defines the ProviderAdapter trait, connection settings and the registry of
//! adapters keyed by provider type

pub mod anthropic;
pub mod openai;

use crate::models::chat::{CompletionRequest, CompletionResponse, FinishReason, Message};
use crate::services::cache::CacheMode;
use crate::services::stream::{fold_stream, EventDecoder, FoldContext, PartialCallback};
use crate::services::transport::{HttpTransport, PreparedRequest, RetryConfig};
use crate::utils::error::{AppError, AppResult};
use crate::utils::trace::Trace;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Header names never included in cache fingerprints
const SECRET_HEADERS: [&str; 4] = ["authorization", "x-api-key", "api-key", "proxy-authorization"];

/// Resolved connection for one provider call
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Provider name as used in model ids
    pub provider: String,
    /// Adapter type ("openai" or "anthropic")
    pub provider_type: String,
    /// API base URL without trailing slash
    pub base_url: String,
    /// Upstream model name
    pub model: String,
    /// API key
    #[serde(skip_serializing)]
    pub token: Option<String>,
    /// API version header override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    /// Extra request headers
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("provider", &self.provider)
            .field("provider_type", &self.provider_type)
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("token", &self.token.as_ref().map(|_| "***"))
            .field("api_version", &self.api_version)
            .finish()
    }
}

impl ConnectionConfig {
    /// Connection with no credentials or extra headers
    pub fn new(provider: &str, provider_type: &str, base_url: &str, model: &str) -> Self {
        Self {
            provider: provider.to_string(),
            provider_type: provider_type.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            token: None,
            api_version: None,
            headers: BTreeMap::new(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Every field that can change the output, credentials excluded
    pub fn fingerprint(&self) -> serde_json::Value {
        let headers: BTreeMap<&str, &str> = self
            .headers
            .iter()
            .filter(|(k, _)| !SECRET_HEADERS.contains(&k.to_lowercase().as_str()))
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        serde_json::json!({
            "provider": self.provider,
            "type": self.provider_type,
            "base_url": self.base_url,
            "model": self.model,
            "api_version": self.api_version,
            "headers": headers,
        })
    }
}

/// Per-call options
#[derive(Clone, Default)]
pub struct CompletionOptions {
    /// Response cache selection
    pub cache: CacheMode,
    /// Retry override; transport defaults when unset
    pub retry: Option<RetryConfig>,
    /// Cooperative cancellation
    pub cancel: CancellationToken,
    /// Streaming progress callback
    pub partial: Option<PartialCallback>,
    /// Request issued by a nested prompt
    pub inner: bool,
    /// Extra request headers for this call
    pub headers: BTreeMap<String, String>,
}

impl std::fmt::Debug for CompletionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionOptions")
            .field("cache", &self.cache)
            .field("retry", &self.retry)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("partial", &self.partial.is_some())
            .field("inner", &self.inner)
            .finish()
    }
}

impl CompletionOptions {
    pub fn with_cache(mut self, cache: CacheMode) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_partial(mut self, partial: PartialCallback) -> Self {
        self.partial = Some(partial);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }
}

/// Translation between the normalized model and one provider family's wire protocol
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Provider type handled by this adapter
    fn name(&self) -> &str;

    /// Shared HTTP transport
    fn transport(&self) -> &HttpTransport;

    /// Build URL, headers and body. Fails on configuration errors only.
    fn prepare(
        &self,
        request: &CompletionRequest,
        connection: &ConnectionConfig,
        options: &CompletionOptions,
    ) -> AppResult<PreparedRequest>;

    /// Fresh decoder for one stream
    fn decoder(&self) -> Box<dyn EventDecoder>;

    /// Models available on this connection
    async fn list_models(&self, connection: &ConnectionConfig) -> AppResult<Vec<String>>;

    /// Run one streaming completion.
    ///
    /// Only configuration errors are returned as `Err`; transport failures,
    /// provider errors and cancellation all produce a response.
    async fn complete(
        &self,
        request: &CompletionRequest,
        connection: &ConnectionConfig,
        options: &CompletionOptions,
        trace: &Trace,
    ) -> AppResult<CompletionResponse> {
        let prepared = self.prepare(request, connection, options)?;
        trace.item_value("url", &prepared.url);
        trace.details_fenced(
            "body",
            serde_json::to_string_pretty(&prepared.body).unwrap_or_default(),
            "json",
        );
        debug!("Sending {} streaming request to {}", self.name(), prepared.url);

        let retry = options.retry.clone().unwrap_or_default();
        let events = match self.transport().open_stream(&prepared, &retry, &options.cancel).await {
            Ok(events) => events,
            Err(AppError::Cancelled) => {
                info!("Request cancelled before the stream opened");
                return Ok(CompletionResponse::with_finish_reason(FinishReason::Cancel));
            }
            Err(e) => {
                error!("{} request failed: {}", self.name(), e);
                trace.error(&e);
                return Ok(CompletionResponse::with_finish_reason(FinishReason::Fail));
            }
        };

        let mut decoder = self.decoder();
        let ctx = FoldContext {
            cancel: &options.cancel,
            partial: options.partial.as_ref(),
            inner: options.inner,
            trace,
        };
        let response = fold_stream(events, decoder.as_mut(), ctx).await;

        trace.item_value("finish reason", response.finish_reason);
        if let Some(usage) = &response.usage {
            trace.item_value(
                "tokens",
                format!("{} ({} -> {})", usage.total_tokens, usage.prompt_tokens, usage.completion_tokens),
            );
        }
        if !response.tool_calls.is_empty() {
            trace.item_value("tool calls", response.tool_calls.len());
        }
        Ok(response)
    }
}

/// Refuse `Custom` messages that carry a standard role.
///
/// A `function` role is never supported; any other standard role means the
/// message did not match its own shape.
pub(crate) fn reject_malformed(msg: &Message) -> AppResult<()> {
    if !msg.is_malformed() {
        return Ok(());
    }
    match msg.role() {
        "function" => Err(AppError::NotSupported("function message not supported".to_string())),
        role => Err(AppError::Validation(format!("malformed '{}' message", role))),
    }
}

/// Adapters keyed by provider type
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    /// Registry with the shipped adapters
    pub fn new(transport: Arc<HttpTransport>) -> Self {
        let mut registry = Self::default();
        registry.register(Arc::new(openai::OpenAIAdapter::new(transport.clone())));
        registry.register(Arc::new(anthropic::AnthropicAdapter::new(transport)));
        registry
    }

    /// Add or replace the adapter for its provider type
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    /// Adapter for a provider type
    pub fn get(&self, provider_type: &str) -> AppResult<Arc<dyn ProviderAdapter>> {
        self.adapters
            .get(provider_type)
            .cloned()
            .ok_or_else(|| AppError::UnknownProvider(provider_type.to_string()))
    }

    /// Registered provider types, sorted
    pub fn provider_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.adapters.keys().cloned().collect();
        types.sort();
        types
    }
}

pub use anthropic::AnthropicAdapter;
pub use openai::OpenAIAdapter;
