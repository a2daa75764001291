//! Data models module
//!
//! Defines the normalized chat model plus Anthropic and OpenAI wire structures

pub mod anthropic;
pub mod chat;
pub mod openai;

pub use chat::*;
