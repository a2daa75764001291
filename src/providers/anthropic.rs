//! Anthropic Provider implementation
//!
//! Messages API adapter with prompt caching support

use super::{reject_malformed, CompletionOptions, ConnectionConfig, ProviderAdapter};
use crate::models::anthropic::*;
use crate::models::chat::{
    CacheControl, CompletionRequest, ContentPart, FinishReason, Message, MessageContent, Tool, Usage,
};
use crate::services::stream::{EventDecoder, StreamEvent};
use crate::services::transport::{HttpTransport, PreparedRequest, SseEvent};
use crate::utils::error::{AppError, AppResult, ErrorContext};
use crate::utils::logging::create_request_log_summary;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tracing::{debug, warn};

/// Default `max_tokens` when the request sets none
pub const ANTHROPIC_MAX_TOKEN: u32 = 8192;

/// Messages API version header value
pub const ANTHROPIC_API_VERSION: &str = "2023-06-01";

/// Beta flag enabling `cache_control` blocks
pub const PROMPT_CACHING_BETA: &str = "prompt-caching-2024-07-31";

/// Model families that accept prompt caching
static CACHING_MODELS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)sonnet|haiku|opus").unwrap_or_else(|_| unreachable!("static pattern"))
});

/// Static model catalogue; the Messages API has no listing endpoint on all deployments
const ANTHROPIC_MODELS: [&str; 5] = [
    "claude-3-5-sonnet-20241022",
    "claude-3-5-sonnet-20240620",
    "claude-3-5-haiku-20241022",
    "claude-3-opus-20240229",
    "claude-3-haiku-20240307",
];

/// Map a native stop reason
pub fn convert_finish_reason(stop_reason: &str) -> FinishReason {
    match stop_reason {
        "end_turn" | "stop_sequence" => FinishReason::Stop,
        "max_tokens" => FinishReason::Length,
        "tool_use" => FinishReason::ToolCalls,
        _ => FinishReason::Undefined,
    }
}

/// Whether prompt caching applies to this request
pub fn uses_prompt_caching(model: &str, messages: &[Message]) -> bool {
    CACHING_MODELS.is_match(model)
        && messages.iter().any(|m| m.cache_control() == Some(CacheControl::Ephemeral))
}

/// Convert usage from `message_start`; cache reads and writes count as prompt tokens
pub fn convert_usage(usage: &AnthropicUsage) -> Usage {
    let cache_creation = usage.cache_creation_input_tokens.unwrap_or(0);
    let cache_read = usage.cache_read_input_tokens.unwrap_or(0);
    let mut converted = Usage::new(usage.input_tokens + cache_creation + cache_read, usage.output_tokens);
    converted.prompt_tokens_details.cached_tokens = cache_read;
    converted
}

/// Anthropic Provider
pub struct AnthropicAdapter {
    transport: Arc<HttpTransport>,
}

impl AnthropicAdapter {
    /// Create a new Anthropic adapter over a shared transport
    pub fn new(transport: Arc<HttpTransport>) -> Self {
        Self { transport }
    }

    /// Convert the normalized request to a Messages API body
    pub fn convert_request(&self, request: &CompletionRequest, model: &str) -> AppResult<AnthropicRequest> {
        let caching = uses_prompt_caching(model, &request.messages);
        let messages = request
            .messages
            .iter()
            .map(|msg| convert_message(msg, caching))
            .collect::<AppResult<Vec<_>>>()?;

        Ok(AnthropicRequest {
            model: model.to_string(),
            max_tokens: request.max_tokens.unwrap_or(ANTHROPIC_MAX_TOKEN),
            messages,
            temperature: request.temperature,
            top_p: request.top_p,
            tools: request.tools.as_ref().map(|tools| tools.iter().map(convert_tool).collect()),
            stream: true,
        })
    }
}

fn cache_control_for(msg: &Message, caching: bool) -> Option<AnthropicCacheControl> {
    (caching && msg.cache_control() == Some(CacheControl::Ephemeral)).then(AnthropicCacheControl::ephemeral)
}

fn convert_message(msg: &Message, caching: bool) -> AppResult<AnthropicMessage> {
    let cache_control = cache_control_for(msg, caching);
    match msg {
        Message::System { content, .. } | Message::User { content, .. } => Ok(AnthropicMessage {
            role: "user".to_string(),
            content: convert_content(content, &cache_control),
        }),
        Message::Assistant { content, tool_calls, .. } => {
            let mut blocks = content
                .as_ref()
                .map(|c| convert_content(c, &cache_control))
                .unwrap_or_default();
            // an empty text block is rejected by the API
            blocks.retain(|b| !matches!(b, AnthropicContentBlock::Text { text, .. } if text.is_empty()));
            for call in tool_calls {
                let input = call
                    .parsed_arguments()
                    .validation_context(&format!("Invalid arguments for tool call '{}'", call.id))?;
                blocks.push(AnthropicContentBlock::ToolUse {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    input,
                    cache_control: cache_control.clone(),
                });
            }
            Ok(AnthropicMessage { role: "assistant".to_string(), content: blocks })
        }
        Message::Tool { content, tool_call_id, .. } => Ok(AnthropicMessage {
            role: "user".to_string(),
            content: vec![AnthropicContentBlock::ToolResult {
                tool_use_id: tool_call_id.clone(),
                content: match content {
                    MessageContent::Text(text) => AnthropicToolResultContent::Text(text.clone()),
                    parts => AnthropicToolResultContent::Blocks(convert_content(parts, &None)),
                },
                cache_control,
            }],
        }),
        Message::Function { .. } => Err(AppError::NotSupported("function message not supported".to_string())),
        Message::Custom(value) => {
            reject_malformed(msg)?;
            Ok(AnthropicMessage {
                role: "user".to_string(),
                content: vec![AnthropicContentBlock::Text { text: value.to_string(), cache_control: None }],
            })
        }
    }
}

fn convert_content(content: &MessageContent, cache_control: &Option<AnthropicCacheControl>) -> Vec<AnthropicContentBlock> {
    match content {
        MessageContent::Text(text) => vec![AnthropicContentBlock::Text {
            text: text.clone(),
            cache_control: cache_control.clone(),
        }],
        MessageContent::Parts(parts) => parts
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } | ContentPart::Plain(text) => AnthropicContentBlock::Text {
                    text: text.clone(),
                    cache_control: cache_control.clone(),
                },
                ContentPart::ImageUrl { image_url } => convert_image_url(&image_url.url),
                other => AnthropicContentBlock::Text {
                    text: serde_json::to_string(other).unwrap_or_default(),
                    cache_control: None,
                },
            })
            .collect(),
    }
}

/// Data URI to base64 image block
fn convert_image_url(url: &str) -> AnthropicContentBlock {
    let media_type = if url.starts_with("data:image/png") { "image/png" } else { "image/jpeg" };
    let data = url.split(',').nth(1).unwrap_or_default();
    AnthropicContentBlock::Image {
        source: AnthropicImageSource {
            source_type: "base64".to_string(),
            media_type: media_type.to_string(),
            data: data.to_string(),
        },
    }
}

fn convert_tool(tool: &Tool) -> AnthropicTool {
    let mut input_schema = serde_json::json!({"type": "object"});
    if let (Some(schema), Some(params)) = (input_schema.as_object_mut(), tool.parameters.as_ref().and_then(|p| p.as_object())) {
        for (key, value) in params {
            schema.insert(key.clone(), value.clone());
        }
    }
    AnthropicTool {
        name: tool.name.clone(),
        description: tool.description.clone(),
        input_schema,
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn transport(&self) -> &HttpTransport {
        &self.transport
    }

    fn prepare(
        &self,
        request: &CompletionRequest,
        connection: &ConnectionConfig,
        options: &CompletionOptions,
    ) -> AppResult<PreparedRequest> {
        let body = self.convert_request(request, &connection.model)?;
        let caching = uses_prompt_caching(&connection.model, &request.messages);
        debug!("Anthropic request: {}", create_request_log_summary(request));

        let mut headers = vec![(
            "anthropic-version".to_string(),
            connection.api_version.clone().unwrap_or_else(|| ANTHROPIC_API_VERSION.to_string()),
        )];
        if let Some(token) = &connection.token {
            headers.push(("x-api-key".to_string(), token.clone()));
        }
        if caching {
            headers.push(("anthropic-beta".to_string(), PROMPT_CACHING_BETA.to_string()));
        }
        for (name, value) in connection.headers.iter().chain(options.headers.iter()) {
            headers.push((name.clone(), value.clone()));
        }

        Ok(PreparedRequest {
            url: format!("{}/messages", connection.base_url),
            headers,
            body: serde_json::to_value(&body)?,
        })
    }

    fn decoder(&self) -> Box<dyn EventDecoder> {
        Box::new(AnthropicDecoder::default())
    }

    async fn list_models(&self, _connection: &ConnectionConfig) -> AppResult<Vec<String>> {
        Ok(ANTHROPIC_MODELS.iter().map(|m| m.to_string()).collect())
    }
}

/// Messages API stream decoder
#[derive(Debug, Default)]
pub struct AnthropicDecoder {
    /// Output tokens already reported; `message_delta` usage is cumulative
    output_tokens: u64,
}

impl EventDecoder for AnthropicDecoder {
    fn decode(&mut self, event: &SseEvent) -> AppResult<Vec<StreamEvent>> {
        if event.data.trim().is_empty() {
            return Ok(Vec::new());
        }
        let parsed: AnthropicStreamEvent = serde_json::from_str(&event.data)
            .protocol_context("Failed to parse Anthropic stream event")?;

        let events = match parsed {
            AnthropicStreamEvent::MessageStart { message } => {
                let mut events = vec![StreamEvent::Start { model: message.model }];
                if let Some(usage) = message.usage {
                    self.output_tokens = usage.output_tokens;
                    events.push(StreamEvent::UsageSnapshot(convert_usage(&usage)));
                }
                events
            }
            AnthropicStreamEvent::ContentBlockStart { index, content_block } => match content_block {
                AnthropicStartBlock::ToolUse { id, name } => vec![StreamEvent::ToolCallOpened { index, id, name }],
                AnthropicStartBlock::Text { text } if !text.is_empty() => vec![StreamEvent::TextDelta(text)],
                _ => Vec::new(),
            },
            AnthropicStreamEvent::ContentBlockDelta { index, delta } => match delta {
                AnthropicContentDelta::TextDelta { text } => vec![StreamEvent::TextDelta(text)],
                AnthropicContentDelta::InputJsonDelta { partial_json } => {
                    vec![StreamEvent::ToolArgumentDelta { index, fragment: partial_json }]
                }
                AnthropicContentDelta::Other => Vec::new(),
            },
            AnthropicStreamEvent::MessageDelta { delta, usage } => {
                let mut events = Vec::new();
                if let Some(stop_reason) = delta.stop_reason {
                    let reason = convert_finish_reason(&stop_reason);
                    if reason == FinishReason::Undefined {
                        warn!("Unknown Anthropic stop reason: {}", stop_reason);
                    }
                    events.push(StreamEvent::Finish(reason));
                }
                if let Some(usage) = usage {
                    let added = usage.output_tokens.saturating_sub(self.output_tokens);
                    self.output_tokens = self.output_tokens.max(usage.output_tokens);
                    if added > 0 {
                        events.push(StreamEvent::UsageDelta(Usage::new(0, added)));
                    }
                }
                events
            }
            AnthropicStreamEvent::MessageStop => vec![StreamEvent::End],
            AnthropicStreamEvent::Error { error } => {
                return Err(AppError::Protocol(format!("{}: {}", error.error_type, error.message)));
            }
            AnthropicStreamEvent::ContentBlockStop { .. }
            | AnthropicStreamEvent::Ping
            | AnthropicStreamEvent::Unknown => Vec::new(),
        };
        Ok(events)
    }
}
