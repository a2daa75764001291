//! Usage and cost accounting
//!
//! [`GenerationStats`] is a tree: one node per logical generation, children for
//! nested sub-requests. Each node keeps the raw turns it recorded plus an
//! aggregate that excludes cache hits.

use crate::config::pricing::PricingTable;
use crate::models::chat::{CompletionRequest, CompletionResponse, Message, ModelIdentifier, Usage};
use crate::utils::trace::Trace;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::info;

/// Turns and children listed per node before eliding
const MAX_LISTED: usize = 10;

/// Estimated dollar cost of `usage` on `model_id`.
///
/// `None` when nothing was consumed or the model has no pricing entry.
pub fn estimate_cost(model_id: &str, usage: &Usage, pricing: &PricingTable) -> Option<f64> {
    if model_id.is_empty() || usage.total_tokens == 0 {
        return None;
    }
    let price = pricing.get(model_id)?;

    let cached = usage.cached_tokens().min(usage.prompt_tokens) as f64;
    let uncached = usage.prompt_tokens as f64 - cached;
    let input = uncached * price.price_per_million_input_tokens
        + cached * price.price_per_million_input_tokens * price.cache_rebate();
    let output = usage.completion_tokens as f64 * price.price_per_million_output_tokens;
    Some((input + output) / 1e6)
}

/// Human readable cost: cents below ten cents, dollars above
pub fn render_cost(value: Option<f64>) -> String {
    match value {
        None => String::new(),
        Some(v) if v == 0.0 || !v.is_finite() => String::new(),
        Some(v) if v <= 0.01 => format!("{:.3}¢", v * 100.0),
        Some(v) if v <= 0.1 => format!("{:.2}¢", v * 100.0),
        Some(v) => format!("{:.2}$", v),
    }
}

/// Whether the model's provider has any pricing at all
pub fn is_costeable(model: &str, pricing: &PricingTable) -> bool {
    let id = ModelIdentifier::parse(model, "");
    !id.provider.is_empty() && pricing.has_provider(&id.provider)
}

/// One recorded completion call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub messages: Vec<Message>,
    pub usage: Usage,
    /// `provider:model` as reported by the stream
    pub model: String,
    pub cached: bool,
}

/// Cost of a stats tree
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Cost {
    /// Dollars over all priced turns
    pub amount: f64,
    /// Models that consumed tokens but have no pricing
    pub unknown_models: BTreeSet<String>,
}

impl Cost {
    /// True when every token-consuming turn was priced
    pub fn is_complete(&self) -> bool {
        self.unknown_models.is_empty()
    }
}

/// Generation statistics node
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationStats {
    pub model: String,
    pub label: Option<String>,
    /// Tool invocations
    pub tool_calls: u32,
    /// Output repairs
    pub repairs: u32,
    /// Conversation turns
    pub turns: u32,
    usage: Usage,
    children: Vec<GenerationStats>,
    chat_turns: Vec<ChatTurn>,
}

impl GenerationStats {
    pub fn new(model: impl Into<String>, label: Option<String>) -> Self {
        Self { model: model.into(), label, ..Default::default() }
    }

    /// Own aggregate, children excluded
    pub fn usage(&self) -> &Usage {
        &self.usage
    }

    pub fn children(&self) -> &[GenerationStats] {
        &self.children
    }

    pub fn chat_turns(&self) -> &[ChatTurn] {
        &self.chat_turns
    }

    /// Model of the first recorded turn, else the configured model
    pub fn resolved_model(&self) -> &str {
        self.chat_turns.first().map(|t| t.model.as_str()).unwrap_or(&self.model)
    }

    /// Append a child and return it
    pub fn create_child(&mut self, model: impl Into<String>, label: Option<String>) -> &mut GenerationStats {
        self.children.push(GenerationStats::new(model, label));
        let last = self.children.len() - 1;
        &mut self.children[last]
    }

    /// Adopt a node built independently (e.g. by a concurrent task)
    pub fn push_child(&mut self, child: GenerationStats) {
        self.children.push(child);
    }

    /// Record a completion call. Cache hits are kept as turns but not aggregated.
    pub fn add_usage(&mut self, request: &CompletionRequest, response: &CompletionResponse) {
        let usage = response.usage.unwrap_or_default();
        if !response.cached {
            self.usage += &usage;
        }

        let node = ModelIdentifier::parse(&self.model, "");
        let model = match &response.model {
            Some(reported) if !node.provider.is_empty() => format!("{}:{}", node.provider, reported),
            _ => self.model.clone(),
        };
        self.chat_turns.push(ChatTurn {
            messages: request.messages.clone(),
            usage,
            model,
            cached: response.cached,
        });
    }

    /// Own aggregate plus every descendant's
    pub fn accumulated_usage(&self) -> Usage {
        let mut total = self.usage;
        for child in &self.children {
            total += &child.accumulated_usage();
        }
        total
    }

    /// Cost of every non-cached turn in the tree
    pub fn cost(&self, pricing: &PricingTable) -> Cost {
        let mut cost = Cost::default();
        self.collect_cost(pricing, &mut cost);
        cost
    }

    fn collect_cost(&self, pricing: &PricingTable, cost: &mut Cost) {
        for turn in self.chat_turns.iter().filter(|t| !t.cached && t.usage.total_tokens > 0) {
            match estimate_cost(&turn.model, &turn.usage, pricing)
                .or_else(|| estimate_cost(&self.model, &turn.usage, pricing))
            {
                Some(amount) => cost.amount += amount,
                None => {
                    cost.unknown_models.insert(turn.model.clone());
                }
            }
        }
        for child in &self.children {
            child.collect_cost(pricing, cost);
        }
    }

    fn title(&self) -> String {
        match &self.label {
            Some(label) => format!("{} ({})", label, self.resolved_model()),
            None => self.resolved_model().to_string(),
        }
    }

    /// Indented summary, one line per node and per turn
    pub fn render_lines(&self, pricing: &PricingTable) -> Vec<String> {
        let mut lines = Vec::new();
        self.render_into("", pricing, &mut lines);
        let unknowns = self.cost(pricing).unknown_models;
        if !unknowns.is_empty() {
            lines.push(format!(
                "missing pricing for {}",
                unknowns.into_iter().collect::<Vec<_>>().join(", ")
            ));
        }
        lines
    }

    fn render_into(&self, indent: &str, pricing: &PricingTable, lines: &mut Vec<String>) {
        let usage = self.accumulated_usage();
        if usage.total_tokens > 0 {
            let cost = self.cost(pricing);
            let line = format!(
                "{}{}> {} tokens ({} -> {}) {}",
                indent,
                self.title(),
                usage.total_tokens,
                usage.prompt_tokens,
                usage.completion_tokens,
                render_cost(Some(cost.amount))
            );
            lines.push(line.trim_end().to_string());
        }

        if self.chat_turns.len() > 1 {
            for turn in self.chat_turns.iter().take(MAX_LISTED) {
                let mut parts = vec![format!("{} messages", turn.messages.len())];
                if turn.usage.total_tokens > 0 {
                    parts.push(format!("{} tokens", turn.usage.total_tokens));
                }
                if turn.cached {
                    parts.push("cached".to_string());
                } else {
                    let cost = render_cost(estimate_cost(&turn.model, &turn.usage, pricing));
                    if !cost.is_empty() {
                        parts.push(cost);
                    }
                }
                lines.push(format!("{}  {}", indent, parts.join(", ")));
            }
            if self.chat_turns.len() > MAX_LISTED {
                lines.push(format!("{}  ...", indent));
            }
        }

        let child_indent = format!("{}  ", indent);
        for child in self.children.iter().take(MAX_LISTED) {
            child.render_into(&child_indent, pricing, lines);
        }
        if self.children.len() > MAX_LISTED {
            lines.push(format!("{}  ...", indent));
        }
    }

    /// Write the summary to the log
    pub fn log(&self, pricing: &PricingTable) {
        for line in self.render_lines(pricing) {
            info!("{}", line);
        }
    }

    /// Write the summary to a trace
    pub fn trace(&self, trace: &Trace, pricing: &PricingTable) {
        let usage = self.accumulated_usage();
        trace.item_value("prompt", usage.prompt_tokens);
        trace.item_value("completion", usage.completion_tokens);
        trace.item_value("tokens", usage.total_tokens);
        let cost = render_cost(Some(self.cost(pricing).amount));
        if !cost.is_empty() {
            trace.item_value("cost", cost);
        }
        if self.tool_calls > 0 {
            trace.item_value("tool calls", self.tool_calls);
        }
        if self.repairs > 0 {
            trace.item_value("repairs", self.repairs);
        }
        if self.turns > 0 {
            trace.item_value("turns", self.turns);
        }
        if usage.cached_tokens() > 0 {
            trace.item_value("cached tokens", usage.cached_tokens());
        }
        let details = usage.completion_tokens_details;
        if details.reasoning_tokens > 0 {
            trace.item_value("reasoning tokens", details.reasoning_tokens);
        }
        if details.accepted_prediction_tokens > 0 {
            trace.item_value("accepted prediction tokens", details.accepted_prediction_tokens);
        }
        if details.rejected_prediction_tokens > 0 {
            trace.item_value("rejected prediction tokens", details.rejected_prediction_tokens);
        }
        trace.details_fenced("generation stats", self.render_lines(pricing).join("\n"), "text");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::pricing::{ConfigSource, Layers, ModelPricing};
    use crate::models::chat::FinishReason;

    fn response(usage: Usage, cached: bool) -> CompletionResponse {
        CompletionResponse {
            usage: Some(usage),
            cached,
            finish_reason: FinishReason::Stop,
            ..Default::default()
        }
    }

    #[test]
    fn test_render_cost_thresholds() {
        assert_eq!(render_cost(None), "");
        assert_eq!(render_cost(Some(0.0)), "");
        assert_eq!(render_cost(Some(0.0008)), "0.080¢");
        assert_eq!(render_cost(Some(0.05)), "5.00¢");
        assert_eq!(render_cost(Some(1.234)), "1.23$");
    }

    #[test]
    fn test_cached_turn_recorded_not_aggregated() {
        let request = CompletionRequest::new("openai:gpt-4o", vec![Message::user("hi")]);
        let mut stats = GenerationStats::new("openai:gpt-4o", None);
        stats.add_usage(&request, &response(Usage::new(10, 5), false));
        stats.add_usage(&request, &response(Usage::new(10, 5), true));

        assert_eq!(stats.chat_turns().len(), 2);
        assert_eq!(stats.usage().total_tokens, 15);
    }

    #[test]
    fn test_turn_model_uses_reported_name() {
        let request = CompletionRequest::new("openai:gpt-4o", vec![Message::user("hi")]);
        let mut stats = GenerationStats::new("openai:gpt-4o", None);
        let mut resp = response(Usage::new(1, 1), false);
        resp.model = Some("gpt-4o-2024-08-06".to_string());
        stats.add_usage(&request, &resp);

        assert_eq!(stats.resolved_model(), "openai:gpt-4o-2024-08-06");
    }

    #[test]
    fn test_render_lines_elides_children() {
        let pricing = PricingTable::from_layers(&Layers::new().layer(
            ConfigSource::Default,
            [("openai:gpt-4o".to_string(), ModelPricing::new(1.0, 1.0))],
        ));
        let request = CompletionRequest::new("openai:gpt-4o", vec![Message::user("hi")]);
        let mut root = GenerationStats::new("openai:gpt-4o", Some("root".to_string()));
        for _ in 0..12 {
            root.create_child("openai:gpt-4o", None).add_usage(&request, &response(Usage::new(1, 1), false));
        }
        root.create_child("mystery:model", None).add_usage(&request, &response(Usage::new(1, 1), false));

        let lines = root.render_lines(&pricing);
        assert!(lines[0].starts_with("root (openai:gpt-4o)> 26 tokens"));
        assert_eq!(lines.iter().filter(|l| l.starts_with("  openai:gpt-4o>")).count(), 10);
        assert!(lines.contains(&"  ...".to_string()));
        assert_eq!(lines.last().unwrap(), "missing pricing for mystery:model");
    }
}
