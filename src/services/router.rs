//! Request Router
//!
//! Resolves model identifiers to provider connections, runs the response
//! cache and dispatches to the provider adapters

use crate::config::pricing::{ModelAliases, PricingTable};
use crate::config::{AppConfig, Settings};
use crate::models::chat::{CompletionRequest, CompletionResponse, FinishReason, ModelIdentifier, PartialUpdate};
use crate::providers::{CompletionOptions, ConnectionConfig, ProviderAdapter, ProviderRegistry};
use crate::services::cache::{CacheKey, ChatCache};
use crate::services::transport::{HttpTransport, RetryConfig};
use crate::services::usage::GenerationStats;
use crate::utils::error::{AppError, AppResult};
use crate::utils::tokens::estimate_tokens;
use crate::utils::trace::Trace;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Request Router
///
/// Holds the adapter registry, the immutable pricing and alias tables and one
/// cache per namespace
pub struct Router {
    /// Application configuration
    config: AppConfig,
    /// Runtime settings
    settings: Settings,
    /// Adapters by provider type
    registry: ProviderRegistry,
    pricing: PricingTable,
    aliases: ModelAliases,
    /// Caches by namespace, created on first use
    caches: DashMap<String, ChatCache>,
}

impl Router {
    /// Create a new router with the shipped adapters
    pub fn new(config: AppConfig, settings: Settings) -> AppResult<Self> {
        let transport = Arc::new(HttpTransport::new(&settings.transport)?);
        let registry = ProviderRegistry::new(transport);
        Ok(Self::with_registry(config, settings, registry))
    }

    /// Create a router over an existing registry
    pub fn with_registry(config: AppConfig, settings: Settings, registry: ProviderRegistry) -> Self {
        let pricing = config.pricing_table();
        let aliases = config.aliases();
        info!(
            "Router initialized: {} providers configured, {} aliases, {} priced models",
            config.providers.len(),
            aliases.len(),
            pricing.len()
        );
        Self {
            config,
            settings,
            registry,
            pricing,
            aliases,
            caches: DashMap::new(),
        }
    }

    /// Replace the pricing table
    pub fn with_pricing(mut self, pricing: PricingTable) -> Self {
        self.pricing = pricing;
        self
    }

    /// Replace the alias map
    pub fn with_aliases(mut self, aliases: ModelAliases) -> Self {
        self.aliases = aliases;
        self
    }

    /// Use `cache` for its namespace instead of the configured store
    pub fn with_cache(self, cache: ChatCache) -> Self {
        self.caches.insert(cache.namespace().to_string(), cache);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn pricing(&self) -> &PricingTable {
        &self.pricing
    }

    pub fn aliases(&self) -> &ModelAliases {
        &self.aliases
    }

    /// Resolve aliases, then split `provider:model`
    pub fn resolve_model(&self, model: &str) -> ModelIdentifier {
        let resolved = self.aliases.resolve(model);
        if resolved != model {
            debug!("Resolved model alias '{}' to '{}'", model, resolved);
        }
        ModelIdentifier::parse(resolved, &self.settings.default_provider)
    }

    /// Connection settings and credentials for a resolved model
    pub fn connection_for(&self, id: &ModelIdentifier) -> AppResult<ConnectionConfig> {
        let provider = self
            .config
            .provider(&id.provider)
            .ok_or_else(|| AppError::UnknownProvider(id.provider.clone()))?;
        let base_url = provider.resolved_base_url().ok_or_else(|| {
            AppError::Validation(format!("Provider '{}' has no base URL", id.provider))
        })?;

        let mut connection = ConnectionConfig::new(
            &id.provider,
            &provider.provider_type,
            &base_url,
            self.config.upstream_model(&id.provider, &id.model),
        );
        connection.api_version = provider.options.api_version.clone();
        connection.headers = provider.options.headers.clone().into_iter().collect();

        let token = Some(provider.api_key.clone())
            .filter(|key| !key.is_empty())
            .or_else(|| api_key_from_env(&id.provider));
        match token {
            Some(token) => connection.token = Some(token),
            None if provider.options.requires_api_key => {
                return Err(AppError::MissingCredentials(id.provider.clone()));
            }
            None => debug!("Provider '{}' configured without API key", id.provider),
        }
        Ok(connection)
    }

    /// Configured default for `max_tokens` when the request sets none
    fn apply_model_defaults(&self, request: &CompletionRequest, id: &ModelIdentifier) -> CompletionRequest {
        let mut request = request.clone();
        if request.max_tokens.is_none() {
            request.max_tokens = self
                .config
                .providers
                .get(&id.provider)
                .and_then(|p| p.models.get(&id.model))
                .and_then(|m| m.max_tokens);
        }
        request
    }

    /// Cache for a namespace; JSONL under the cache directory when one is set
    pub fn cache(&self, namespace: &str) -> ChatCache {
        self.caches
            .entry(namespace.to_string())
            .or_insert_with(|| match &self.settings.cache.dir {
                Some(dir) => ChatCache::jsonl(namespace, dir),
                None => ChatCache::memory(namespace),
            })
            .clone()
    }

    /// Run one completion: cache lookup, provider call, cache store and usage record.
    ///
    /// Configuration errors are returned before any network call. Everything
    /// else is reported through the response finish reason and `trace`.
    pub async fn complete(
        &self,
        request: &CompletionRequest,
        options: &CompletionOptions,
        stats: Option<&mut GenerationStats>,
        trace: &Trace,
    ) -> AppResult<CompletionResponse> {
        let request_id = Uuid::new_v4();
        let id = self.resolve_model(&request.model);
        let connection = self.connection_for(&id)?;
        let adapter = self.registry.get(&connection.provider_type)?;
        let request = self.apply_model_defaults(request, &id);

        info!("[{}] Completion on {} ({})", request_id, id, connection.model);
        trace.item_value("request id", request_id);
        trace.item_value("model", &id);

        let cached = match options.cache.namespace() {
            Some(namespace) => {
                let cache = self.cache(namespace);
                let key = cache.key(&request, &connection)?;
                trace.item_value("cache", cache.store_name());
                trace.item_value("cache key", cache.key_sha(&key));
                Some((cache, key))
            }
            None => None,
        };

        if let Some((cache, key)) = &cached {
            if let Some(hit) = cache.get(key).await {
                info!("[{}] Cache hit in '{}'", request_id, cache.namespace());
                trace.item_value("cached", true);
                let response = CompletionResponse {
                    text: hit.text,
                    finish_reason: hit.finish_reason,
                    cached: true,
                    ..Default::default()
                };
                if let Some(partial) = &options.partial {
                    partial(&PartialUpdate {
                        response_so_far: response.text.clone(),
                        tokens_so_far: estimate_tokens(&response.text),
                        response_chunk: response.text.clone(),
                        inner: options.inner,
                    });
                }
                if let Some(stats) = stats {
                    stats.add_usage(&request, &response);
                }
                return Ok(response);
            }
        }

        let response = self.dispatch(adapter.as_ref(), &request, &connection, options, trace).await?;
        info!(
            "[{}] Finished with {} ({} chars)",
            request_id,
            response.finish_reason,
            response.text.len()
        );

        if let Some((cache, key)) = &cached {
            store_in_cache(cache, key, &response).await;
        }
        if let Some(stats) = stats {
            stats.add_usage(&request, &response);
        }
        Ok(response)
    }

    async fn dispatch(
        &self,
        adapter: &dyn ProviderAdapter,
        request: &CompletionRequest,
        connection: &ConnectionConfig,
        options: &CompletionOptions,
        trace: &Trace,
    ) -> AppResult<CompletionResponse> {
        let result = if options.retry.is_some() {
            adapter.complete(request, connection, options, trace).await
        } else {
            let options = options.clone().with_retry(RetryConfig::from(&self.settings.retry));
            adapter.complete(request, connection, &options, trace).await
        };
        match result {
            Err(e) if !e.is_configuration() => {
                error!("{} adapter failed: {}", adapter.name(), e);
                trace.error(&e);
                Ok(CompletionResponse::with_finish_reason(FinishReason::Fail))
            }
            other => other,
        }
    }

    /// Models offered by a provider, as `provider:model` ids.
    ///
    /// Configured models are listed without a network call; otherwise the
    /// adapter is asked.
    pub async fn list_models(&self, provider: &str) -> AppResult<Vec<String>> {
        let configured: Vec<String> = self
            .config
            .list_model_ids()
            .into_iter()
            .filter(|id| ModelIdentifier::parse(id, "").provider == provider)
            .collect();
        if !configured.is_empty() {
            return Ok(configured);
        }

        let connection = self.connection_for(&ModelIdentifier {
            provider: provider.to_string(),
            model: String::new(),
        })?;
        let adapter = self.registry.get(&connection.provider_type)?;
        let models = adapter.list_models(&connection).await?;
        Ok(models.into_iter().map(|m| format!("{}:{}", provider, m)).collect())
    }
}

async fn store_in_cache(cache: &ChatCache, key: &CacheKey, response: &CompletionResponse) {
    if cache.set(key, response).await {
        debug!("Stored response in cache '{}'", cache.namespace());
    } else if response.finish_reason == FinishReason::Stop {
        warn!("Response not stored in cache '{}'", cache.namespace());
    }
}

/// `<PROVIDER>_API_KEY`, with `-` mapped to `_`
fn api_key_from_env(provider: &str) -> Option<String> {
    let var = format!("{}_API_KEY", provider.to_uppercase().replace('-', "_"));
    std::env::var(&var).ok().filter(|key| !key.is_empty())
}
