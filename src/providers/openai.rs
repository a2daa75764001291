//! OpenAI Provider implementation
//!
//! Standard OpenAI-compatible Chat Completions provider

use super::{reject_malformed, CompletionOptions, ConnectionConfig, ProviderAdapter};
use crate::models::chat::{
    CompletionRequest, CompletionTokensDetails, ContentPart, FinishReason, Message, MessageContent,
    PromptTokensDetails, Tool, Usage,
};
use crate::models::openai::*;
use crate::services::stream::{EventDecoder, StreamEvent};
use crate::services::transport::{HttpTransport, PreparedRequest, SseEvent};
use crate::utils::error::{AppError, AppResult, ErrorContext};
use crate::utils::logging::create_request_log_summary;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Map a native finish reason
pub fn convert_finish_reason(finish_reason: &str) -> FinishReason {
    match finish_reason {
        "stop" => FinishReason::Stop,
        "length" => FinishReason::Length,
        "tool_calls" | "function_call" => FinishReason::ToolCalls,
        "content_filter" => FinishReason::ContentFilter,
        _ => FinishReason::Undefined,
    }
}

/// Convert a usage record, keeping the detail breakdowns
pub fn convert_usage(usage: &OpenAIUsage) -> Usage {
    let prompt_details = usage.prompt_tokens_details.clone().unwrap_or_default();
    let completion_details = usage.completion_tokens_details.clone().unwrap_or_default();
    Usage {
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: if usage.total_tokens > 0 {
            usage.total_tokens
        } else {
            usage.prompt_tokens + usage.completion_tokens
        },
        prompt_tokens_details: PromptTokensDetails {
            cached_tokens: prompt_details.cached_tokens.unwrap_or(0),
            audio_tokens: prompt_details.audio_tokens.unwrap_or(0),
        },
        completion_tokens_details: CompletionTokensDetails {
            reasoning_tokens: completion_details.reasoning_tokens.unwrap_or(0),
            audio_tokens: completion_details.audio_tokens.unwrap_or(0),
            accepted_prediction_tokens: completion_details.accepted_prediction_tokens.unwrap_or(0),
            rejected_prediction_tokens: completion_details.rejected_prediction_tokens.unwrap_or(0),
        },
    }
}

/// OpenAI Provider
pub struct OpenAIAdapter {
    transport: Arc<HttpTransport>,
}

impl OpenAIAdapter {
    /// Create a new OpenAI adapter over a shared transport
    pub fn new(transport: Arc<HttpTransport>) -> Self {
        Self { transport }
    }

    /// Convert the normalized request to a Chat Completions body
    pub fn convert_request(&self, request: &CompletionRequest, model: &str) -> AppResult<OpenAIRequest> {
        let messages = request
            .messages
            .iter()
            .map(convert_message)
            .collect::<AppResult<Vec<_>>>()?;

        Ok(OpenAIRequest {
            model: model.to_string(),
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            top_p: request.top_p,
            stream: Some(true),
            stream_options: Some(OpenAIStreamOptions { include_usage: true }),
            logit_bias: request.logit_bias.clone(),
            tools: request.tools.as_ref().map(|tools| tools.iter().map(convert_tool).collect()),
        })
    }

    /// Headers shared by completion and listing calls
    fn build_headers(&self, connection: &ConnectionConfig) -> Vec<(String, String)> {
        let mut headers = Vec::new();
        if let Some(token) = &connection.token {
            headers.push(("Authorization".to_string(), format!("Bearer {}", token)));
        }
        for (name, value) in &connection.headers {
            headers.push((name.clone(), value.clone()));
        }
        headers
    }
}

fn text_message(role: &str, text: String) -> OpenAIMessage {
    OpenAIMessage {
        role: role.to_string(),
        content: Some(OpenAIContent::Text(text)),
        tool_calls: None,
        tool_call_id: None,
    }
}

fn convert_message(msg: &Message) -> AppResult<OpenAIMessage> {
    match msg {
        Message::System { content, .. } | Message::User { content, .. } => Ok(OpenAIMessage {
            content: Some(convert_content(content)),
            ..text_message(msg.role(), String::new())
        }),
        Message::Assistant { content, tool_calls, .. } => Ok(OpenAIMessage {
            role: "assistant".to_string(),
            content: content.as_ref().map(convert_content),
            tool_calls: (!tool_calls.is_empty()).then(|| {
                tool_calls
                    .iter()
                    .map(|call| OpenAIToolCall {
                        index: None,
                        id: Some(call.id.clone()),
                        tool_type: Some("function".to_string()),
                        function: OpenAIFunctionCall {
                            name: Some(call.name.clone()),
                            arguments: Some(call.arguments.clone()),
                        },
                    })
                    .collect()
            }),
            tool_call_id: None,
        }),
        Message::Tool { content, tool_call_id, .. } => Ok(OpenAIMessage {
            content: Some(convert_content(content)),
            tool_call_id: Some(tool_call_id.clone()),
            ..text_message("tool", String::new())
        }),
        Message::Function { .. } => Err(AppError::NotSupported("function message not supported".to_string())),
        Message::Custom(value) => {
            reject_malformed(msg)?;
            Ok(text_message("user", value.to_string()))
        }
    }
}

fn convert_content(content: &MessageContent) -> OpenAIContent {
    match content {
        MessageContent::Text(text) => OpenAIContent::Text(text.clone()),
        MessageContent::Parts(parts) => OpenAIContent::Array(
            parts
                .iter()
                .map(|part| match part {
                    ContentPart::Text { text } | ContentPart::Plain(text) => {
                        OpenAIContentPart::Text { text: text.clone() }
                    }
                    ContentPart::ImageUrl { image_url } => OpenAIContentPart::ImageUrl {
                        image_url: OpenAIImageUrl {
                            url: image_url.url.clone(),
                            detail: image_url.detail.clone(),
                        },
                    },
                    other => OpenAIContentPart::Text {
                        text: serde_json::to_string(other).unwrap_or_default(),
                    },
                })
                .collect(),
        ),
    }
}

fn convert_tool(tool: &Tool) -> OpenAITool {
    OpenAITool {
        tool_type: "function".to_string(),
        function: OpenAIFunction {
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters: tool.parameters.clone(),
        },
    }
}

#[async_trait]
impl ProviderAdapter for OpenAIAdapter {
    fn name(&self) -> &str {
        "openai"
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
        debug!("OpenAI request: {}", create_request_log_summary(request));

        let mut headers = self.build_headers(connection);
        for (name, value) in &options.headers {
            headers.push((name.clone(), value.clone()));
        }

        Ok(PreparedRequest {
            url: format!("{}/chat/completions", connection.base_url),
            headers,
            body: serde_json::to_value(&body)?,
        })
    }

    fn decoder(&self) -> Box<dyn EventDecoder> {
        Box::new(OpenAIDecoder::default())
    }

    async fn list_models(&self, connection: &ConnectionConfig) -> AppResult<Vec<String>> {
        let url = format!("{}/models", connection.base_url);
        let value = self.transport.get_json(&url, &self.build_headers(connection)).await?;
        let list: OpenAIModelList = serde_json::from_value(value)
            .protocol_context("Failed to parse model list")?;

        let mut models: Vec<String> = list.data.into_iter().map(|m| m.id).collect();
        models.sort();
        Ok(models)
    }
}

/// Chat Completions stream decoder.
///
/// Tool calls are keyed by wire index, but a fragment carrying a new id at an
/// index that is already open starts a separate call. Emitted indices are
/// therefore assigned by the decoder, in opening order.
#[derive(Debug, Default)]
pub struct OpenAIDecoder {
    started: bool,
    /// wire index -> (call id, emitted index)
    open_calls: HashMap<u32, (String, u32)>,
    next_call: u32,
}

impl OpenAIDecoder {
    /// Emitted index for a fragment, opening a new call when it carries an unseen id
    fn call_index(&mut self, call: &OpenAIToolCall, events: &mut Vec<StreamEvent>) -> AppResult<u32> {
        let wire_index = call.index.unwrap_or(0);
        match (&call.id, self.open_calls.get(&wire_index)) {
            (Some(id), Some((open_id, index))) if id == open_id => Ok(*index),
            (Some(id), _) => {
                let index = self.next_call;
                self.next_call += 1;
                self.open_calls.insert(wire_index, (id.clone(), index));
                events.push(StreamEvent::ToolCallOpened {
                    index,
                    id: id.clone(),
                    name: call.function.name.clone().unwrap_or_default(),
                });
                Ok(index)
            }
            (None, Some((_, index))) => Ok(*index),
            (None, None) => Err(AppError::Protocol(format!(
                "argument fragment for unopened tool call {}",
                wire_index
            ))),
        }
    }
}

impl EventDecoder for OpenAIDecoder {
    fn decode(&mut self, event: &SseEvent) -> AppResult<Vec<StreamEvent>> {
        let data = event.data.trim();
        if data.is_empty() {
            return Ok(Vec::new());
        }
        if data == "[DONE]" {
            return Ok(vec![StreamEvent::End]);
        }

        let chunk: OpenAIStreamResponse = serde_json::from_str(data)
            .protocol_context("Failed to parse OpenAI stream chunk")?;
        if let Some(error) = chunk.error {
            return Err(AppError::Protocol(format!(
                "{}: {}",
                error.error_type.as_deref().unwrap_or("error"),
                error.message
            )));
        }

        let mut events = Vec::new();
        if !self.started && !chunk.model.is_empty() {
            self.started = true;
            events.push(StreamEvent::Start { model: chunk.model.clone() });
        }

        // only the first choice is consumed
        if let Some(choice) = chunk.choices.into_iter().next() {
            for call in choice.delta.tool_calls.unwrap_or_default() {
                let fragment = call.function.arguments.clone().filter(|f| !f.is_empty());
                if call.id.is_none() && fragment.is_none() {
                    continue;
                }
                let index = self.call_index(&call, &mut events)?;
                if let Some(fragment) = fragment {
                    events.push(StreamEvent::ToolArgumentDelta { index, fragment });
                }
            }
            if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
                events.push(StreamEvent::TextDelta(text));
            }
            if let Some(reason) = choice.finish_reason {
                let converted = convert_finish_reason(&reason);
                if converted == FinishReason::Undefined {
                    warn!("Unknown OpenAI finish reason: {}", reason);
                }
                events.push(StreamEvent::Finish(converted));
            }
        }

        if let Some(usage) = chunk.usage {
            events.push(StreamEvent::UsageSnapshot(convert_usage(&usage)));
        }
        Ok(events)
    }
}
