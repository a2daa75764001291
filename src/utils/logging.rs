//! Logging utilities
//!
//! Subscriber setup and request summaries for debug logs

use crate::config::settings::LoggingConfig;
use crate::models::chat::{CompletionRequest, ContentPart, Message, MessageContent};
use tracing::info;

/// Set to true to include full request details (tools, system prompts) in debug logs
/// Default is false to reduce log verbosity
pub const VERBOSE_REQUEST_LOGGING: bool = false;

/// Initialize the global tracing subscriber.
///
/// Fails if a subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let subscriber: Box<dyn tracing::Subscriber + Send + Sync> = if config.format == "json" {
        // JSON format logs (production environment)
        Box::new(tracing_subscriber::fmt()
            .with_env_filter(config.level.as_str())
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .finish())
    } else {
        // Human readable format (development environment)
        Box::new(tracing_subscriber::fmt()
            .with_env_filter(config.level.as_str())
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .finish())
    };

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("Failed to set tracing subscriber: {}", e))?;

    info!("Logging system initialized");
    Ok(())
}

/// Truncate a string with a note about original length
pub fn truncate_content(s: &str, max_len: usize) -> String {
    match s.char_indices().nth(max_len) {
        Some((cut, _)) => {
            let total = s.chars().count();
            format!("{}... ({} chars truncated)", &s[..cut], total - max_len)
        }
        None => s.to_string(),
    }
}

fn summarize_content(content: &MessageContent, max_len: usize) -> serde_json::Value {
    match content {
        MessageContent::Text(t) => serde_json::Value::String(truncate_content(t, max_len)),
        MessageContent::Parts(parts) => {
            let mut previews: Vec<serde_json::Value> = parts
                .iter()
                .take(3)
                .map(|part| match part {
                    ContentPart::Text { text } | ContentPart::Plain(text) => {
                        serde_json::json!({"type": "text", "text": truncate_content(text, 100)})
                    }
                    ContentPart::ImageUrl { .. } => serde_json::json!({"type": "image_url", "url": "[truncated]"}),
                    ContentPart::ToolCall { id, name, .. } => {
                        serde_json::json!({"type": "tool_call", "id": id, "name": name, "arguments": "[truncated]"})
                    }
                    ContentPart::ToolResult { tool_call_id, content } => {
                        serde_json::json!({"type": "tool_result", "tool_call_id": tool_call_id, "content": truncate_content(content, 50)})
                    }
                    ContentPart::Other(_) => serde_json::json!({"type": "other"}),
                })
                .collect();
            if parts.len() > 3 {
                previews.push(serde_json::json!(format!("...and {} more blocks", parts.len() - 3)));
            }
            serde_json::Value::Array(previews)
        }
    }
}

/// Create a filtered version of a message for logging
fn filter_message(msg: &Message) -> serde_json::Value {
    let content = match msg {
        // System prompts are truncated more aggressively
        Message::System { content, .. } => summarize_content(content, 100),
        Message::User { content, .. } => summarize_content(content, 200),
        Message::Assistant { content: Some(content), .. } => summarize_content(content, 200),
        Message::Assistant { content: None, .. } => serde_json::Value::Null,
        Message::Tool { content, .. } => summarize_content(content, 50),
        Message::Function { content, .. } => serde_json::Value::String(truncate_content(&content.to_string(), 50)),
        Message::Custom(_) => serde_json::json!("[custom message]"),
    };

    let mut obj = serde_json::json!({
        "role": msg.role(),
        "content": content,
    });

    if let Message::Assistant { tool_calls, .. } = msg {
        if !tool_calls.is_empty() {
            obj["tool_calls"] = serde_json::json!(format!("[...{} tool calls]", tool_calls.len()));
        }
    }
    if let Message::Tool { tool_call_id, .. } = msg {
        obj["tool_call_id"] = serde_json::json!(tool_call_id);
    }
    if msg.cache_control().is_some() {
        obj["cacheControl"] = serde_json::json!("ephemeral");
    }

    obj
}

/// Create a filtered summary of a completion request for logging
/// Keeps original structure but truncates verbose content
pub fn create_request_log_summary(request: &CompletionRequest) -> serde_json::Value {
    if VERBOSE_REQUEST_LOGGING {
        serde_json::to_value(request).unwrap_or(serde_json::json!({"error": "serialize failed"}))
    } else {
        let filtered_messages: Vec<serde_json::Value> = request.messages.iter()
            .map(filter_message)
            .collect();

        let tools = match &request.tools {
            Some(t) if !t.is_empty() => serde_json::json!([format!("...{} tools (details truncated)", t.len())]),
            _ => serde_json::Value::Null,
        };

        serde_json::json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "messages": filtered_messages,
            "tools": tools,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_content() {
        assert_eq!(truncate_content("short", 10), "short");
        assert_eq!(truncate_content("abcdefghij", 4), "abcd... (6 chars truncated)");
        // multi-byte characters are never split
        assert_eq!(truncate_content("ééééé", 2), "éé... (3 chars truncated)");
    }

    #[test]
    fn test_request_summary_truncates_system() {
        let long = "x".repeat(500);
        let request = CompletionRequest::new(
            "openai:gpt-4o",
            vec![Message::system(long), Message::tool("call_1", "result")],
        );
        let summary = create_request_log_summary(&request);

        let system = summary["messages"][0]["content"].as_str().unwrap();
        assert!(system.contains("400 chars truncated"));
        assert_eq!(summary["messages"][1]["tool_call_id"], "call_1");
        assert!(summary["tools"].is_null());
    }
}
