//! Request trace recorder
//!
//! Collects an ordered, human readable record of what happened during a
//! completion call. Every entry is mirrored into `tracing` at debug level.

use crate::utils::error::{AppError, ErrorResponse};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Single trace record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TraceEntry {
    /// Labelled scalar value
    Item { label: String, value: String },
    /// Fenced block (request bodies, summaries)
    Details { title: String, language: String, body: String },
    /// Streamed output token
    Token { text: String },
    /// Error surfaced during the call
    Error { error: ErrorResponse },
}

/// Thread-safe trace collector
#[derive(Debug, Default)]
pub struct Trace {
    entries: Mutex<Vec<TraceEntry>>,
}

impl Trace {
    /// Create an empty trace
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, entry: TraceEntry) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.push(entry);
    }

    /// Record a labelled value
    pub fn item_value(&self, label: &str, value: impl std::fmt::Display) {
        let value = value.to_string();
        debug!("trace {}: {}", label, value);
        self.push(TraceEntry::Item { label: label.to_string(), value });
    }

    /// Record a fenced block
    pub fn details_fenced(&self, title: &str, body: impl Into<String>, language: &str) {
        let body = body.into();
        debug!("trace {} ({} bytes)", title, body.len());
        self.push(TraceEntry::Details {
            title: title.to_string(),
            language: language.to_string(),
            body,
        });
    }

    /// Record a streamed token
    pub fn append_token(&self, text: &str) {
        self.push(TraceEntry::Token { text: text.to_string() });
    }

    /// Record an error
    pub fn error(&self, error: &AppError) {
        warn!("trace error: {}", error);
        self.push(TraceEntry::Error { error: error.to_error_response() });
    }

    /// Snapshot of all entries in insertion order
    pub fn entries(&self) -> Vec<TraceEntry> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Recorded errors
    pub fn errors(&self) -> Vec<ErrorResponse> {
        self.entries()
            .into_iter()
            .filter_map(|entry| match entry {
                TraceEntry::Error { error } => Some(error),
                _ => None,
            })
            .collect()
    }

    /// Value of the last item with this label
    pub fn last_item(&self, label: &str) -> Option<String> {
        self.entries().into_iter().rev().find_map(|entry| match entry {
            TraceEntry::Item { label: l, value } if l == label => Some(value),
            _ => None,
        })
    }

    /// Concatenated streamed tokens
    pub fn streamed_text(&self) -> String {
        self.entries()
            .into_iter()
            .filter_map(|entry| match entry {
                TraceEntry::Token { text } => Some(text),
                _ => None,
            })
            .collect()
    }

    /// Render as markdown
    pub fn render(&self) -> String {
        let mut out = String::new();
        let mut in_tokens = false;
        for entry in self.entries() {
            if in_tokens && !matches!(entry, TraceEntry::Token { .. }) {
                out.push('\n');
                in_tokens = false;
            }
            match entry {
                TraceEntry::Item { label, value } => out.push_str(&format!("- {}: `{}`\n", label, value)),
                TraceEntry::Details { title, language, body } => {
                    out.push_str(&format!("\n<details><summary>{}</summary>\n\n```{}\n{}\n```\n\n</details>\n", title, language, body));
                }
                TraceEntry::Token { text } => {
                    in_tokens = true;
                    out.push_str(&text);
                }
                TraceEntry::Error { error } => out.push_str(&format!("> error: {}\n", error.message)),
            }
        }
        out
    }
}
