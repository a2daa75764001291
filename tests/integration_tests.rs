//! Integration tests
//!
//! End-to-end runs of the router against mock provider endpoints

use chatrelay::config::settings::RetrySettings;
use chatrelay::config::{AppConfig, Settings};
use chatrelay::models::chat::{CompletionRequest, FinishReason, Message, PartialUpdate};
use chatrelay::providers::CompletionOptions;
use chatrelay::services::{CacheMode, GenerationStats, Router};
use chatrelay::utils::error::AppError;
use chatrelay::utils::trace::Trace;
use httpmock::prelude::*;
use serde_json::json;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Build an SSE body from data payloads
fn sse_body(events: &[serde_json::Value]) -> String {
    let mut body: String = events.iter().map(|e| format!("data: {}\n\n", e)).collect();
    body.push_str("data: [DONE]\n\n");
    body
}

fn openai_chunks() -> String {
    sse_body(&[
        json!({"id": "c1", "model": "gpt-test", "choices": [{"index": 0, "delta": {"role": "assistant", "content": ""}}]}),
        json!({"id": "c1", "model": "gpt-test", "choices": [{"index": 0, "delta": {"content": "Hello"}}]}),
        json!({"id": "c1", "model": "gpt-test", "choices": [{"index": 0, "delta": {"content": " world"}}]}),
        json!({"id": "c1", "model": "gpt-test", "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]}),
        json!({"id": "c1", "model": "gpt-test", "choices": [], "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15}}),
    ])
}

/// Settings with fast retries
fn create_test_settings(max_retries: u32) -> Settings {
    Settings {
        retry: RetrySettings { max_retries, retry_delay_ms: 10, max_delay_ms: 20 },
        ..Settings::default()
    }
}

fn create_test_config(server: &MockServer) -> AppConfig {
    serde_json::from_value(json!({
        "providers": {
            "mock": {
                "type": "openai",
                "baseUrl": server.url("/v1"),
                "apiKey": "sk-mock"
            },
            "mockant": {
                "type": "anthropic",
                "baseUrl": server.url("/anthropic/v1"),
                "apiKey": "sk-ant"
            }
        },
        "modelAliases": {"default": "mock:gpt-test"},
        "pricing": {"mock:gpt-test": {"price_per_million_input_tokens": 1.0, "price_per_million_output_tokens": 2.0}}
    }))
    .expect("Invalid test config")
}

fn collecting_callback() -> (Arc<Mutex<Vec<PartialUpdate>>>, CompletionOptions) {
    let updates = Arc::new(Mutex::new(Vec::new()));
    let sink = updates.clone();
    let options = CompletionOptions::default().with_partial(Arc::new(move |update: &PartialUpdate| {
        sink.lock().unwrap().push(update.clone());
    }));
    (updates, options)
}

#[tokio::test]
async fn test_openai_stream_end_to_end() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .header("authorization", "Bearer sk-mock");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(openai_chunks());
        })
        .await;

    let router = Router::new(create_test_config(&server), create_test_settings(0)).unwrap();
    let (updates, options) = collecting_callback();
    let mut stats = GenerationStats::new("mock:gpt-test", None);
    let trace = Trace::new();

    let request = CompletionRequest::new("default", vec![Message::user("Say hello")]);
    let response = router.complete(&request, &options, Some(&mut stats), &trace).await.unwrap();

    assert_eq!(mock.hits_async().await, 1);
    assert_eq!(response.text, "Hello world");
    assert_eq!(response.finish_reason, FinishReason::Stop);
    assert_eq!(response.usage.unwrap().total_tokens, 15);
    assert_eq!(response.model.as_deref(), Some("gpt-test"));

    let updates = updates.lock().unwrap();
    assert_eq!(updates.len(), 2);
    assert_eq!(updates[1].response_so_far, "Hello world");
    assert_eq!(updates[1].response_chunk, " world");

    let cost = stats.cost(router.pricing());
    assert!(cost.is_complete());
    assert!((cost.amount - 18e-6).abs() < 1e-12);
    assert_eq!(trace.streamed_text(), "Hello world");
}

#[tokio::test]
async fn test_cache_idempotence() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(openai_chunks());
        })
        .await;

    let router = Router::new(create_test_config(&server), create_test_settings(0)).unwrap();
    let request = CompletionRequest::new("mock:gpt-test", vec![Message::user("Say hello")]);
    let mut stats = GenerationStats::new("mock:gpt-test", None);

    let first = router
        .complete(&request, &CompletionOptions::default().with_cache(CacheMode::Default), Some(&mut stats), &Trace::new())
        .await
        .unwrap();

    let (updates, options) = collecting_callback();
    let second = router
        .complete(&request, &options.with_cache(CacheMode::Default), Some(&mut stats), &Trace::new())
        .await
        .unwrap();

    assert_eq!(mock.hits_async().await, 1);
    assert!(!first.cached);
    assert!(second.cached);
    assert_eq!(first.text, second.text);
    assert_eq!(first.finish_reason, second.finish_reason);

    let updates = updates.lock().unwrap();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].response_so_far, "Hello world");
    assert_eq!(updates[0].response_chunk, "Hello world");

    // the cache hit is not billed again
    assert_eq!(stats.accumulated_usage().total_tokens, 15);
}

#[tokio::test]
async fn test_retry_on_unavailable() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(503).body("overloaded");
        })
        .await;

    let router = Router::new(create_test_config(&server), create_test_settings(2)).unwrap();
    let trace = Trace::new();
    let request = CompletionRequest::new("mock:gpt-test", vec![Message::user("hi")]);

    let response = router.complete(&request, &CompletionOptions::default(), None, &trace).await.unwrap();

    assert_eq!(mock.hits_async().await, 3);
    assert_eq!(response.finish_reason, FinishReason::Fail);
    assert_eq!(trace.errors().len(), 1);
}

#[tokio::test]
async fn test_client_error_not_retried() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(400).body(r#"{"error":{"message":"bad request"}}"#);
        })
        .await;

    let router = Router::new(create_test_config(&server), create_test_settings(3)).unwrap();
    let request = CompletionRequest::new("mock:gpt-test", vec![Message::user("hi")]);

    let response = router.complete(&request, &CompletionOptions::default(), None, &Trace::new()).await.unwrap();

    assert_eq!(mock.hits_async().await, 1);
    assert_eq!(response.finish_reason, FinishReason::Fail);
}

#[tokio::test]
async fn test_anthropic_tool_use_stream() {
    let server = MockServer::start_async().await;
    let body: String = [
        ("message_start", json!({"type": "message_start", "message": {"id": "m1", "model": "claude-3-haiku-20240307", "usage": {"input_tokens": 20, "output_tokens": 1, "cache_read_input_tokens": 5}}})),
        ("content_block_start", json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}})),
        ("content_block_delta", json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Checking."}})),
        ("content_block_stop", json!({"type": "content_block_stop", "index": 0})),
        ("content_block_start", json!({"type": "content_block_start", "index": 1, "content_block": {"type": "tool_use", "id": "toolu_1", "name": "get_weather", "input": {}}})),
        ("content_block_delta", json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "{\"city\": "}})),
        ("content_block_delta", json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "\"Paris\"}"}})),
        ("content_block_stop", json!({"type": "content_block_stop", "index": 1})),
        ("message_delta", json!({"type": "message_delta", "delta": {"stop_reason": "tool_use"}, "usage": {"output_tokens": 14}})),
        ("message_stop", json!({"type": "message_stop"})),
    ]
    .iter()
    .map(|(name, data)| format!("event: {}\ndata: {}\n\n", name, data))
    .collect();

    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/anthropic/v1/messages")
                .header("x-api-key", "sk-ant")
                .header_exists("anthropic-version");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(body);
        })
        .await;

    let router = Router::new(create_test_config(&server), create_test_settings(0)).unwrap();
    let request = CompletionRequest::new("mockant:claude-3-haiku-20240307", vec![Message::user("Weather in Paris?")]);

    let response = router.complete(&request, &CompletionOptions::default(), None, &Trace::new()).await.unwrap();

    assert_eq!(mock.hits_async().await, 1);
    assert_eq!(response.finish_reason, FinishReason::ToolCalls);
    assert_eq!(response.text, "Checking.");
    assert_eq!(response.tool_calls.len(), 1);
    assert_eq!(response.tool_calls[0].id, "toolu_1");
    assert_eq!(response.tool_calls[0].parsed_arguments().unwrap(), json!({"city": "Paris"}));

    let usage = response.usage.unwrap();
    assert_eq!(usage.prompt_tokens, 25);
    assert_eq!(usage.completion_tokens, 14);
    assert_eq!(usage.cached_tokens(), 5);
}

#[tokio::test]
async fn test_provider_error_event_keeps_partial_text() {
    let server = MockServer::start_async().await;
    let body = format!(
        "data: {}\n\ndata: {}\n\n",
        json!({"model": "gpt-test", "choices": [{"index": 0, "delta": {"content": "Partial"}}]}),
        json!({"error": {"message": "upstream exploded", "type": "server_error"}}),
    );
    server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200).header("content-type", "text/event-stream").body(body);
        })
        .await;

    let router = Router::new(create_test_config(&server), create_test_settings(0)).unwrap();
    let trace = Trace::new();
    let request = CompletionRequest::new("mock:gpt-test", vec![Message::user("hi")]);

    let response = router
        .complete(&request, &CompletionOptions::default().with_cache(CacheMode::Default), None, &trace)
        .await
        .unwrap();

    assert_eq!(response.finish_reason, FinishReason::Fail);
    assert_eq!(response.text, "Partial");
    assert_eq!(trace.errors().len(), 1);
}

#[tokio::test]
async fn test_missing_credentials_fail_before_network() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST);
            then.status(200);
        })
        .await;

    let mut config = create_test_config(&server);
    config.providers.get_mut("mock").unwrap().api_key.clear();
    std::env::remove_var("MOCK_API_KEY");
    let router = Router::new(config, create_test_settings(0)).unwrap();

    let request = CompletionRequest::new("mock:gpt-test", vec![Message::user("hi")]);
    let result = router.complete(&request, &CompletionOptions::default(), None, &Trace::new()).await;

    assert!(matches!(result, Err(AppError::MissingCredentials(_))));
    assert_eq!(mock.hits_async().await, 0);
}

#[tokio::test]
async fn test_cancelled_before_stream_opens() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200)
                .header("content-type", "text/event-stream")
                .delay(std::time::Duration::from_secs(5))
                .body(openai_chunks());
        })
        .await;

    let router = Router::new(create_test_config(&server), create_test_settings(0)).unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let options = CompletionOptions::default().with_cancel(cancel);
    let request = CompletionRequest::new("mock:gpt-test", vec![Message::user("hi")]);

    let response = router.complete(&request, &options, None, &Trace::new()).await.unwrap();

    assert_eq!(response.finish_reason, FinishReason::Cancel);
    assert!(response.text.is_empty());
}

#[tokio::test]
async fn test_list_models_from_endpoint() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/v1/models");
            then.status(200).json_body(json!({
                "object": "list",
                "data": [
                    {"id": "gpt-test", "object": "model", "owned_by": "mock"},
                    {"id": "gpt-alpha", "object": "model", "owned_by": "mock"}
                ]
            }));
        })
        .await;

    let router = Router::new(create_test_config(&server), create_test_settings(0)).unwrap();
    let models = router.list_models("mock").await.unwrap();

    assert_eq!(models, vec!["mock:gpt-alpha", "mock:gpt-test"]);
}
