//! Router test module
//!
//! Exercises the router against a scripted adapter, without network access

#[cfg(test)]
mod router_tests {
    use crate::config::settings::TransportConfig;
    use crate::config::{AppConfig, ConfigSource, Layers, ModelAliases, ModelPricing, PricingTable, ProviderConfig, Settings};
    use crate::models::chat::{CompletionRequest, CompletionResponse, FinishReason, Message, PartialUpdate, Usage};
    use crate::providers::anthropic::AnthropicDecoder;
    use crate::providers::{CompletionOptions, ConnectionConfig, ProviderAdapter, ProviderRegistry};
    use crate::services::cache::CacheMode;
    use crate::services::stream::EventDecoder;
    use crate::services::transport::{HttpTransport, PreparedRequest};
    use crate::services::usage::GenerationStats;
    use crate::services::Router;
    use crate::utils::error::{AppError, AppResult};
    use crate::utils::trace::Trace;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Adapter returning a fixed response and recording what it was asked
    struct ScriptedAdapter {
        transport: HttpTransport,
        response: CompletionResponse,
        calls: AtomicUsize,
        connections: Mutex<Vec<ConnectionConfig>>,
        failure: Mutex<Option<AppError>>,
    }

    impl ScriptedAdapter {
        fn new(response: CompletionResponse) -> Arc<Self> {
            Arc::new(Self {
                transport: HttpTransport::new(&TransportConfig { http_proxy: None, timeout: 5 }).unwrap(),
                response,
                calls: AtomicUsize::new(0),
                connections: Mutex::new(Vec::new()),
                failure: Mutex::new(None),
            })
        }

        /// Adapter whose next call fails with `error`
        fn failing(error: AppError) -> Arc<Self> {
            let adapter = Self::new(CompletionResponse::default());
            *adapter.failure.lock().unwrap() = Some(error);
            adapter
        }
    }

    #[async_trait]
    impl ProviderAdapter for ScriptedAdapter {
        fn name(&self) -> &str {
            "openai"
        }

        fn transport(&self) -> &HttpTransport {
            &self.transport
        }

        fn prepare(
            &self,
            _request: &CompletionRequest,
            connection: &ConnectionConfig,
            _options: &CompletionOptions,
        ) -> AppResult<PreparedRequest> {
            Ok(PreparedRequest { url: connection.base_url.clone(), headers: Vec::new(), body: serde_json::json!({}) })
        }

        fn decoder(&self) -> Box<dyn EventDecoder> {
            Box::new(AnthropicDecoder::default())
        }

        async fn list_models(&self, _connection: &ConnectionConfig) -> AppResult<Vec<String>> {
            Ok(vec!["scripted".to_string()])
        }

        async fn complete(
            &self,
            _request: &CompletionRequest,
            connection: &ConnectionConfig,
            options: &CompletionOptions,
            _trace: &Trace,
        ) -> AppResult<CompletionResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.connections.lock().unwrap().push(connection.clone());
            if let Some(error) = self.failure.lock().unwrap().take() {
                return Err(error);
            }
            if let Some(partial) = &options.partial {
                partial(&PartialUpdate {
                    response_so_far: self.response.text.clone(),
                    tokens_so_far: 1,
                    response_chunk: self.response.text.clone(),
                    inner: options.inner,
                });
            }
            Ok(self.response.clone())
        }
    }

    fn create_test_config() -> AppConfig {
        let mut config = AppConfig::default();
        let mut provider = ProviderConfig::builtin("openai");
        provider.api_key = "sk-test".to_string();
        provider.base_url = Some("http://localhost:9/v1/".to_string());
        provider.options.headers.insert("X-Team".to_string(), "evals".to_string());
        provider.models.insert(
            "small".to_string(),
            crate::config::ModelConfig { name: "gpt-4o-mini".to_string(), max_tokens: Some(256) },
        );
        config.providers.insert("openai".to_string(), provider);

        let mut keyless = ProviderConfig::builtin("openai");
        keyless.base_url = Some("http://localhost:11434/v1".to_string());
        keyless.options.requires_api_key = false;
        config.providers.insert("ollama".to_string(), keyless);

        config.model_aliases.insert("fast".to_string(), "openai:small".to_string());
        config
    }

    fn create_router(adapter: Arc<ScriptedAdapter>) -> Router {
        let mut registry = ProviderRegistry::default();
        registry.register(adapter);
        Router::with_registry(create_test_config(), Settings::default(), registry)
    }

    fn stop_response(text: &str) -> CompletionResponse {
        CompletionResponse {
            text: text.to_string(),
            finish_reason: FinishReason::Stop,
            usage: Some(Usage::new(10, 5)),
            model: Some("gpt-4o-mini".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_resolve_model() {
        let router = create_router(ScriptedAdapter::new(stop_response("")));

        let id = router.resolve_model("fast");
        assert_eq!((id.provider.as_str(), id.model.as_str()), ("openai", "small"));

        let id = router.resolve_model("gpt-4o");
        assert_eq!(id.provider, "openai");

        let id = router.resolve_model("ollama:llama3:8b");
        assert_eq!((id.provider.as_str(), id.model.as_str()), ("ollama", "llama3:8b"));
    }

    #[test]
    fn test_connection_for() {
        let router = create_router(ScriptedAdapter::new(stop_response("")));

        let connection = router.connection_for(&router.resolve_model("fast")).unwrap();
        assert_eq!(connection.base_url, "http://localhost:9/v1");
        assert_eq!(connection.model, "gpt-4o-mini");
        assert_eq!(connection.token.as_deref(), Some("sk-test"));
        assert_eq!(connection.headers.get("X-Team").map(String::as_str), Some("evals"));

        let keyless = router.connection_for(&router.resolve_model("ollama:llama3")).unwrap();
        assert_eq!(keyless.token, None);

        let unknown = router.connection_for(&router.resolve_model("mystery:model"));
        assert!(matches!(unknown, Err(AppError::UnknownProvider(_))));
    }

    #[test]
    fn test_missing_credentials() {
        std::env::remove_var("ANTHROPIC_API_KEY");
        let router = create_router(ScriptedAdapter::new(stop_response("")));
        let result = router.connection_for(&router.resolve_model("anthropic:claude-3-haiku-20240307"));
        assert!(matches!(result, Err(AppError::MissingCredentials(p)) if p == "anthropic"));
    }

    #[tokio::test]
    async fn test_complete_applies_model_defaults_and_records_usage() {
        let adapter = ScriptedAdapter::new(stop_response("hello"));
        let router = create_router(adapter.clone());
        let mut stats = GenerationStats::new("openai:small", None);
        let trace = Trace::new();

        let request = CompletionRequest::new("fast", vec![Message::user("hi")]);
        let response = router
            .complete(&request, &CompletionOptions::default(), Some(&mut stats), &trace)
            .await
            .unwrap();

        assert_eq!(response.text, "hello");
        assert!(!response.cached);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);
        assert_eq!(stats.usage().total_tokens, 15);
        assert_eq!(stats.chat_turns()[0].model, "openai:gpt-4o-mini");
        assert!(trace.last_item("request id").is_some());
    }

    #[tokio::test]
    async fn test_cache_hit_skips_adapter() {
        let adapter = ScriptedAdapter::new(stop_response("cached text"));
        let router = create_router(adapter.clone());
        let partials = Arc::new(AtomicUsize::new(0));
        let counter = partials.clone();
        let options = CompletionOptions::default()
            .with_cache(CacheMode::Default)
            .with_partial(Arc::new(move |_: &PartialUpdate| {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        let mut stats = GenerationStats::new("openai:small", None);
        let request = CompletionRequest::new("openai:small", vec![Message::user("same")]);

        let first = router.complete(&request, &options, Some(&mut stats), &Trace::new()).await.unwrap();
        let second = router.complete(&request, &options, Some(&mut stats), &Trace::new()).await.unwrap();

        assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);
        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(first.text, second.text);
        assert_eq!(first.finish_reason, second.finish_reason);
        assert_eq!(partials.load(Ordering::SeqCst), 2);
        // the hit is recorded but not billed
        assert_eq!(stats.chat_turns().len(), 2);
        assert_eq!(stats.usage().total_tokens, 15);
    }

    #[tokio::test]
    async fn test_call_headers_do_not_split_cache() {
        let adapter = ScriptedAdapter::new(stop_response("shared"));
        let router = create_router(adapter.clone());
        let request = CompletionRequest::new("openai:small", vec![Message::user("same")]);
        let mut first_options = CompletionOptions::default().with_cache(CacheMode::Default);
        first_options.headers.insert("X-Request-Id".to_string(), "a".to_string());
        let mut second_options = CompletionOptions::default().with_cache(CacheMode::Default);
        second_options.headers.insert("X-Request-Id".to_string(), "b".to_string());

        router.complete(&request, &first_options, None, &Trace::new()).await.unwrap();
        let second = router.complete(&request, &second_options, None, &Trace::new()).await.unwrap();

        assert!(second.cached);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_non_stop_responses_not_cached() {
        let adapter = ScriptedAdapter::new(CompletionResponse {
            text: "trunc".to_string(),
            finish_reason: FinishReason::Length,
            ..Default::default()
        });
        let router = create_router(adapter.clone());
        let options = CompletionOptions::default().with_cache(CacheMode::Named("runs".to_string()));
        let request = CompletionRequest::new("openai:gpt-4o", vec![Message::user("x")]);

        router.complete(&request, &options, None, &Trace::new()).await.unwrap();
        router.complete(&request, &options, None, &Trace::new()).await.unwrap();

        assert_eq!(adapter.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_configuration_error_before_dispatch() {
        let adapter = ScriptedAdapter::new(stop_response(""));
        let router = create_router(adapter.clone());
        let request = CompletionRequest::new("nowhere:model", vec![Message::user("x")]);

        let result = router.complete(&request, &CompletionOptions::default(), None, &Trace::new()).await;

        assert!(matches!(result, Err(AppError::UnknownProvider(_))));
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_adapter_failure_folds_into_fail() {
        let adapter = ScriptedAdapter::failing(AppError::Protocol("unexpected event".to_string()));
        let router = create_router(adapter.clone());
        let options = CompletionOptions::default().with_cache(CacheMode::Default);
        let request = CompletionRequest::new("openai:gpt-4o", vec![Message::user("x")]);
        let trace = Trace::new();

        let response = router.complete(&request, &options, None, &trace).await.unwrap();

        assert_eq!(response.finish_reason, FinishReason::Fail);
        assert_eq!(trace.errors()[0].error_type, "protocol_error");

        // failures are not cached; the retry reaches the adapter again
        router.complete(&request, &options, None, &Trace::new()).await.unwrap();
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_adapter_configuration_error_escapes() {
        let adapter = ScriptedAdapter::failing(AppError::NotSupported("function message not supported".to_string()));
        let router = create_router(adapter);
        let request = CompletionRequest::new("openai:gpt-4o", vec![Message::user("x")]);

        let result = router.complete(&request, &CompletionOptions::default(), None, &Trace::new()).await;

        assert!(matches!(result, Err(AppError::NotSupported(_))));
    }

    #[tokio::test]
    async fn test_list_models() {
        let router = create_router(ScriptedAdapter::new(stop_response("")));

        assert_eq!(router.list_models("openai").await.unwrap(), vec!["openai:small"]);
        assert_eq!(router.list_models("ollama").await.unwrap(), vec!["ollama:scripted"]);
    }

    #[test]
    fn test_pricing_and_alias_overrides() {
        let router = create_router(ScriptedAdapter::new(stop_response("")))
            .with_pricing(PricingTable::from_layers(&Layers::new().layer(
                ConfigSource::Script,
                [("openai:small".to_string(), ModelPricing::new(1.0, 2.0))],
            )))
            .with_aliases(ModelAliases::from_layers(&Layers::new().layer(
                ConfigSource::Script,
                [("fast".to_string(), "ollama:llama3".to_string())],
            )));

        assert_eq!(router.pricing().len(), 1);
        assert_eq!(router.resolve_model("fast").provider, "ollama");
    }
}
