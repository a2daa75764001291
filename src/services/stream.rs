//! Streaming protocol state machine
//!
//! Provider decoders translate raw SSE events into a small normalized
//! vocabulary; [`fold_stream`] folds that vocabulary into partial callbacks
//! and a final [`CompletionResponse`].

use crate::models::chat::{CompletionResponse, FinishReason, PartialUpdate, ToolCall, Usage};
use crate::services::transport::{SseEvent, SseStream};
use crate::utils::error::{AppError, AppResult};
use crate::utils::tokens::estimate_tokens;
use crate::utils::trace::Trace;
use futures::StreamExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Streaming progress callback
pub type PartialCallback = Arc<dyn Fn(&PartialUpdate) + Send + Sync>;

/// Normalized stream event
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Stream opened; provider reported model
    Start { model: String },
    /// Full usage record, replaces anything seen so far
    UsageSnapshot(Usage),
    /// New tool call at `index`
    ToolCallOpened { index: u32, id: String, name: String },
    /// Generated text
    TextDelta(String),
    /// Raw argument fragment for an opened tool call
    ToolArgumentDelta { index: u32, fragment: String },
    /// Native finish reason, already mapped
    Finish(FinishReason),
    /// Incremental usage, added to the current record
    UsageDelta(Usage),
    /// Provider signalled end of stream
    End,
}

/// Stateful per-stream decoder from SSE events to [`StreamEvent`]s
pub trait EventDecoder: Send {
    /// Decode one SSE event; may yield zero or more normalized events
    fn decode(&mut self, event: &SseEvent) -> AppResult<Vec<StreamEvent>>;
}

/// Per-call inputs of [`fold_stream`]
pub struct FoldContext<'a> {
    pub cancel: &'a CancellationToken,
    pub partial: Option<&'a PartialCallback>,
    pub inner: bool,
    pub trace: &'a Trace,
}

/// Local mutable state of one streaming call
#[derive(Debug, Default)]
struct StreamAccumulator {
    text: String,
    num_tokens: usize,
    tool_calls: BTreeMap<u32, ToolCall>,
    usage: Option<Usage>,
    finish_reason: Option<FinishReason>,
    model: Option<String>,
}

/// What the fold loop should do after an event
enum Flow {
    Continue,
    Stop,
}

impl StreamAccumulator {
    fn apply(&mut self, event: StreamEvent, ctx: &FoldContext<'_>) -> AppResult<Flow> {
        match event {
            StreamEvent::Start { model } => {
                debug!("Stream started for model {}", model);
                self.model = Some(model);
            }
            StreamEvent::UsageSnapshot(usage) => self.usage = Some(usage),
            StreamEvent::UsageDelta(delta) => {
                *self.usage.get_or_insert_with(Usage::default) += &delta;
            }
            StreamEvent::ToolCallOpened { index, id, name } => {
                self.tool_calls.insert(index, ToolCall { id, name, arguments: String::new() });
            }
            StreamEvent::ToolArgumentDelta { index, fragment } => {
                let call = self.tool_calls.get_mut(&index).ok_or_else(|| {
                    AppError::Protocol(format!("argument fragment for unopened tool call {}", index))
                })?;
                call.arguments.push_str(&fragment);
            }
            StreamEvent::TextDelta(chunk) => {
                if chunk.is_empty() {
                    return Ok(Flow::Continue);
                }
                self.num_tokens += estimate_tokens(&chunk);
                self.text.push_str(&chunk);
                ctx.trace.append_token(&chunk);
                if let Some(callback) = ctx.partial {
                    callback(&PartialUpdate {
                        response_so_far: self.text.clone(),
                        tokens_so_far: self.num_tokens,
                        response_chunk: chunk,
                        inner: ctx.inner,
                    });
                }
            }
            StreamEvent::Finish(reason) => self.finish_reason = Some(reason),
            StreamEvent::End => return Ok(Flow::Stop),
        }
        Ok(Flow::Continue)
    }

    fn into_response(self, finish_reason: FinishReason) -> CompletionResponse {
        CompletionResponse {
            text: self.text,
            finish_reason,
            usage: self.usage,
            tool_calls: self.tool_calls.into_values().collect(),
            cached: false,
            model: self.model,
        }
    }
}

/// Drive a provider stream to completion.
///
/// Never fails: cancellation ends with `cancel`, transport and protocol errors
/// end with `fail` after being recorded on the trace. A stream that closes
/// without an end event or a finish reason counts as truncated and also ends
/// with `fail`. Accumulated text and tool calls are returned in every case.
pub async fn fold_stream(
    mut events: SseStream,
    decoder: &mut dyn EventDecoder,
    ctx: FoldContext<'_>,
) -> CompletionResponse {
    let mut acc = StreamAccumulator::default();

    let finish_override = 'outer: loop {
        let next = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                debug!("Stream cancelled after {} chars", acc.text.len());
                break 'outer Some(FinishReason::Cancel);
            }
            next = events.next() => next,
        };

        let sse = match next {
            None if acc.finish_reason.is_none() => {
                let e = AppError::Stream("stream closed before a finish event".to_string());
                error!("{} after {} chars", e, acc.text.len());
                ctx.trace.error(&e);
                break Some(FinishReason::Fail);
            }
            None => break None,
            Some(Ok(sse)) => sse,
            Some(Err(e)) => {
                error!("Stream error: {}", e);
                ctx.trace.error(&e);
                break Some(FinishReason::Fail);
            }
        };

        let decoded = match decoder.decode(&sse) {
            Ok(decoded) => decoded,
            Err(e) => {
                error!("Failed to decode stream event: {}", e);
                ctx.trace.error(&e);
                break Some(FinishReason::Fail);
            }
        };

        for event in decoded {
            match acc.apply(event, &ctx) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => break 'outer None,
                Err(e) => {
                    error!("Stream protocol error: {}", e);
                    ctx.trace.error(&e);
                    break 'outer Some(FinishReason::Fail);
                }
            }
        }
    };

    let finish_reason = finish_override
        .or(acc.finish_reason)
        .unwrap_or(FinishReason::Undefined);
    acc.into_response(finish_reason)
}
