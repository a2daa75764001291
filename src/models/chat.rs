//! Normalized chat completion models
//!
//! Provider-independent request, response and usage structures

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::AddAssign;

/// Normalized completion request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Model identifier in `provider:model` form
    pub model: String,
    /// Message list
    pub messages: Vec<Message>,
    /// Tools (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
    /// Temperature parameter (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Top-p parameter (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    /// Maximum tokens to generate (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Logit bias (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logit_bias: Option<BTreeMap<String, f32>>,
}

/// Prompt caching hint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheControl {
    Ephemeral,
}

/// Chat message, tagged by role
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum Message {
    System {
        content: MessageContent,
        #[serde(default, rename = "cacheControl", skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
    User {
        content: MessageContent,
        #[serde(default, rename = "cacheControl", skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
    Assistant {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<MessageContent>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
        #[serde(default, rename = "cacheControl", skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
    Tool {
        content: MessageContent,
        tool_call_id: String,
        #[serde(default, rename = "cacheControl", skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
    /// Legacy function result message; no adapter accepts it
    Function {
        #[serde(default)]
        name: String,
        #[serde(default)]
        content: serde_json::Value,
    },
    /// Pseudo-role message (e.g. constrained decoding request) kept as raw JSON.
    ///
    /// Standard-role messages that fail their own shape also land here; see
    /// [`Message::is_malformed`].
    #[serde(untagged)]
    Custom(serde_json::Value),
}

/// Roles with a dedicated [`Message`] variant
pub const STANDARD_ROLES: [&str; 5] = ["system", "user", "assistant", "tool", "function"];

/// Message content: plain text or ordered parts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

/// Content part
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
    ToolCall { id: String, name: String, arguments: String },
    ToolResult { tool_call_id: String, content: String },
    /// Bare string block
    #[serde(untagged)]
    Plain(String),
    /// Any block type this crate does not model
    #[serde(untagged)]
    Other(serde_json::Value),
}

/// Image reference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    /// Image URL, usually a `data:` URI
    pub url: String,
    /// Detail level (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Tool definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    /// Function name
    pub name: String,
    /// Function description (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON schema of the parameters (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

/// Tool call requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider assigned call ID
    pub id: String,
    /// Tool name
    pub name: String,
    /// Raw argument payload, JSON once complete
    pub arguments: String,
}

impl ToolCall {
    /// Parse the accumulated arguments.
    ///
    /// Empty arguments parse as an empty object.
    pub fn parsed_arguments(&self) -> Result<serde_json::Value, serde_json::Error> {
        if self.arguments.trim().is_empty() {
            return Ok(serde_json::json!({}));
        }
        serde_json::from_str(&self.arguments)
    }
}

/// Normalized finish reason
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Cancel,
    Fail,
    /// No or unrecognized native reason
    #[default]
    Undefined,
}

impl FinishReason {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::ToolCalls => "tool_calls",
            FinishReason::ContentFilter => "content_filter",
            FinishReason::Cancel => "cancel",
            FinishReason::Fail => "fail",
            FinishReason::Undefined => "undefined",
        }
    }
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Prompt token breakdown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PromptTokensDetails {
    #[serde(default)]
    pub cached_tokens: u64,
    #[serde(default)]
    pub audio_tokens: u64,
}

/// Completion token breakdown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CompletionTokensDetails {
    #[serde(default)]
    pub reasoning_tokens: u64,
    #[serde(default)]
    pub audio_tokens: u64,
    #[serde(default)]
    pub accepted_prediction_tokens: u64,
    #[serde(default)]
    pub rejected_prediction_tokens: u64,
}

/// Token usage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Usage {
    /// Prompt token count
    pub prompt_tokens: u64,
    /// Completion token count
    pub completion_tokens: u64,
    /// Total token count
    pub total_tokens: u64,
    #[serde(default)]
    pub prompt_tokens_details: PromptTokensDetails,
    #[serde(default)]
    pub completion_tokens_details: CompletionTokensDetails,
}

impl Usage {
    /// Usage for a single turn; total is derived
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            ..Default::default()
        }
    }

    /// Cached prompt tokens
    pub fn cached_tokens(&self) -> u64 {
        self.prompt_tokens_details.cached_tokens
    }
}

impl AddAssign<&Usage> for Usage {
    fn add_assign(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
        self.prompt_tokens_details.cached_tokens += other.prompt_tokens_details.cached_tokens;
        self.prompt_tokens_details.audio_tokens += other.prompt_tokens_details.audio_tokens;
        let (mine, theirs) = (&mut self.completion_tokens_details, &other.completion_tokens_details);
        mine.reasoning_tokens += theirs.reasoning_tokens;
        mine.audio_tokens += theirs.audio_tokens;
        mine.accepted_prediction_tokens += theirs.accepted_prediction_tokens;
        mine.rejected_prediction_tokens += theirs.rejected_prediction_tokens;
    }
}

/// Final completion result
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CompletionResponse {
    /// Full generated text
    pub text: String,
    /// Normalized finish reason
    pub finish_reason: FinishReason,
    /// Usage statistics (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    /// Tool calls in index order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Served from the response cache
    #[serde(default)]
    pub cached: bool,
    /// Model name reported by the provider stream (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl CompletionResponse {
    /// Empty response with the given finish reason
    pub fn with_finish_reason(finish_reason: FinishReason) -> Self {
        Self { finish_reason, ..Default::default() }
    }
}

/// Partial result passed to streaming callbacks
#[derive(Debug, Clone, PartialEq)]
pub struct PartialUpdate {
    /// Cumulative text
    pub response_so_far: String,
    /// Cumulative estimated token count
    pub tokens_so_far: usize,
    /// Incremental chunk
    pub response_chunk: String,
    /// Request issued by a nested prompt
    pub inner: bool,
}

/// Parsed `provider:model` identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelIdentifier {
    pub provider: String,
    pub model: String,
}

impl ModelIdentifier {
    /// Split `provider:model`; the model part may itself contain `:` (tags).
    ///
    /// Identifiers without a provider use `default_provider`.
    pub fn parse(id: &str, default_provider: &str) -> Self {
        match id.split_once(':') {
            Some((provider, model)) if !provider.is_empty() => Self {
                provider: provider.to_string(),
                model: model.to_string(),
            },
            _ => Self {
                provider: default_provider.to_string(),
                model: id.trim_start_matches(':').to_string(),
            },
        }
    }
}

impl std::fmt::Display for ModelIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.provider, self.model)
    }
}

impl Message {
    /// Plain user message
    pub fn user(text: impl Into<String>) -> Self {
        Message::User { content: MessageContent::Text(text.into()), cache_control: None }
    }

    /// Plain system message
    pub fn system(text: impl Into<String>) -> Self {
        Message::System { content: MessageContent::Text(text.into()), cache_control: None }
    }

    /// Plain assistant message
    pub fn assistant(text: impl Into<String>) -> Self {
        Message::Assistant {
            content: Some(MessageContent::Text(text.into())),
            tool_calls: Vec::new(),
            cache_control: None,
        }
    }

    /// Tool result message
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Message::Tool {
            content: MessageContent::Text(content.into()),
            tool_call_id: tool_call_id.into(),
            cache_control: None,
        }
    }

    /// Role name
    pub fn role(&self) -> &str {
        match self {
            Message::System { .. } => "system",
            Message::User { .. } => "user",
            Message::Assistant { .. } => "assistant",
            Message::Tool { .. } => "tool",
            Message::Function { .. } => "function",
            Message::Custom(value) => value.get("role").and_then(|r| r.as_str()).unwrap_or("custom"),
        }
    }

    /// A `Custom` message carrying a standard role, i.e. one whose shape did not
    /// match that role's variant
    pub fn is_malformed(&self) -> bool {
        matches!(self, Message::Custom(_)) && STANDARD_ROLES.contains(&self.role())
    }

    /// Cache hint
    pub fn cache_control(&self) -> Option<CacheControl> {
        match self {
            Message::System { cache_control, .. }
            | Message::User { cache_control, .. }
            | Message::Assistant { cache_control, .. }
            | Message::Tool { cache_control, .. } => *cache_control,
            Message::Function { .. } | Message::Custom(_) => None,
        }
    }

    /// Mark this message for provider-side prompt caching
    pub fn ephemeral(mut self) -> Self {
        match &mut self {
            Message::System { cache_control, .. }
            | Message::User { cache_control, .. }
            | Message::Assistant { cache_control, .. }
            | Message::Tool { cache_control, .. } => *cache_control = Some(CacheControl::Ephemeral),
            Message::Function { .. } | Message::Custom(_) => {}
        }
        self
    }
}

impl MessageContent {
    /// Extract text content
    pub fn extract_text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } | ContentPart::Plain(text) => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}

impl CompletionRequest {
    /// Request with default sampling parameters
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            tools: None,
            temperature: None,
            top_p: None,
            max_tokens: None,
            logit_bias: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_identifier() {
        let id = ModelIdentifier::parse("anthropic:claude-3-5-sonnet-20240620", "openai");
        assert_eq!(id.provider, "anthropic");
        assert_eq!(id.model, "claude-3-5-sonnet-20240620");

        let tagged = ModelIdentifier::parse("ollama:llama3:8b", "openai");
        assert_eq!(tagged.provider, "ollama");
        assert_eq!(tagged.model, "llama3:8b");

        let bare = ModelIdentifier::parse("gpt-4o", "openai");
        assert_eq!(bare.to_string(), "openai:gpt-4o");
    }

    #[test]
    fn test_usage_add_assign() {
        let mut total = Usage::new(10, 5);
        let mut other = Usage::new(7, 3);
        other.prompt_tokens_details.cached_tokens = 4;
        other.completion_tokens_details.reasoning_tokens = 2;
        total += &other;

        assert_eq!(total.total_tokens, 25);
        assert_eq!(total.cached_tokens(), 4);
        assert_eq!(total.completion_tokens_details.reasoning_tokens, 2);
    }

    #[test]
    fn test_custom_role_roundtrip() {
        let raw = serde_json::json!({"role": "aici", "program": "gen()"});
        let msg: Message = serde_json::from_value(raw.clone()).unwrap();

        assert!(matches!(msg, Message::Custom(_)));
        assert_eq!(msg.role(), "aici");
        assert_eq!(serde_json::to_value(&msg).unwrap(), raw);
    }

    #[test]
    fn test_standard_roles_keep_their_variant() {
        let msg: Message = serde_json::from_value(serde_json::json!({"role": "function", "content": "result"})).unwrap();
        assert!(matches!(msg, Message::Function { .. }));

        let msg: Message = serde_json::from_value(serde_json::json!({
            "role": "tool",
            "tool_call_id": "t1",
            "content": [{"type": "text", "text": "42"}]
        }))
        .unwrap();
        assert!(matches!(&msg, Message::Tool { tool_call_id, content: MessageContent::Parts(_), .. } if tool_call_id == "t1"));
        assert!(!msg.is_malformed());
    }

    #[test]
    fn test_malformed_standard_role() {
        let msg: Message = serde_json::from_value(serde_json::json!({"role": "tool", "content": "no id"})).unwrap();
        assert!(matches!(msg, Message::Custom(_)));
        assert!(msg.is_malformed());

        let custom: Message = serde_json::from_value(serde_json::json!({"role": "aici", "program": "x"})).unwrap();
        assert!(!custom.is_malformed());
    }

    #[test]
    fn test_tool_call_arguments() {
        let call = ToolCall { id: "t1".to_string(), name: "f".to_string(), arguments: String::new() };
        assert_eq!(call.parsed_arguments().unwrap(), serde_json::json!({}));

        let partial = ToolCall { arguments: "{\"a\":".to_string(), ..call };
        assert!(partial.parsed_arguments().is_err());
    }
}
