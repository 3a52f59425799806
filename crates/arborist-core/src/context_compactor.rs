//! Context compaction.
//!
//! When a session's token usage crosses the configured threshold, summarizes the
//! oldest portion of its history through the LLM in JSON-only mode and replaces it
//! with a single synthetic TEXT part, leaving REASONING parts out of the summary
//! input entirely — hidden model-internal thought is never fed back through a
//! summary.

use crate::llm::provider::LLMProvider;
use crate::part::{Message, Part, PartPayload, Role};
use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

/// Rough token estimate: four characters per token.
pub fn estimate_tokens(text: &str) -> usize {
    (text.chars().count() / 4).max(1)
}

#[derive(Debug, Deserialize)]
struct SummaryResponse {
    summary: String,
}

pub struct ContextCompactor {
    provider: Arc<dyn LLMProvider>,
    token_budget: usize,
}

impl ContextCompactor {
    pub fn new(provider: Arc<dyn LLMProvider>, token_budget: usize) -> Self {
        Self { provider, token_budget }
    }

    /// `true` once the session's estimated token footprint exceeds the configured
    /// budget.
    pub fn needs_compaction(&self, messages: &[Message]) -> bool {
        self.total_tokens(messages) > self.token_budget
    }

    fn total_tokens(&self, messages: &[Message]) -> usize {
        messages
            .iter()
            .flat_map(|m| &m.parts)
            .map(|p| estimate_tokens(&summarizable_text(&p.payload).unwrap_or_default()))
            .sum()
    }

    /// Summarize every message but the most recent `keep_recent` into a single
    /// synthetic assistant message, prepended to the kept tail.
    pub async fn compact(&self, messages: &[Message], keep_recent: usize) -> Result<Vec<Message>> {
        if messages.len() <= keep_recent {
            return Ok(messages.to_vec());
        }

        let (to_summarize, tail) = messages.split_at(messages.len() - keep_recent);
        let transcript = render_transcript(to_summarize);

        let llm_messages = vec![crate::llm::types::Message::user(&format!(
            "Summarize the following conversation transcript in 2-4 sentences, \
             preserving any decisions, file paths, or open questions a future turn \
             would need. Respond as JSON: {{\"summary\": \"...\"}}.\n\n{transcript}"
        ))];
        let config = crate::llm::types::GenerateConfig::default();

        let parsed: SummaryResponse = serde_json::from_value(
            self.provider
                .generate_json(&llm_messages, &config)
                .await
                .context("context compaction: summary generation failed")?,
        )
        .context("context compaction: summary response missing `summary` field")?;

        info!(
            summarized_messages = to_summarize.len(),
            kept_messages = tail.len(),
            "compacted session context"
        );

        let mut summary_message = Message::new(
            tail.first().map(|m| m.session_id.as_str()).unwrap_or_default(),
            Role::Assistant,
        );
        summary_message.push(Part::text(
            &summary_message.id.clone(),
            &summary_message.session_id.clone(),
            format!("[compacted summary of {} earlier messages]\n{}", to_summarize.len(), parsed.summary),
        ));

        let mut result = vec![summary_message];
        result.extend_from_slice(tail);
        Ok(result)
    }
}

fn summarizable_text(payload: &PartPayload) -> Option<String> {
    match payload {
        PartPayload::Reasoning { .. } => None,
        PartPayload::Text { text } | PartPayload::User { text } => Some(text.clone()),
        PartPayload::Tool { tool_name, parameters, result, .. } => Some(json!({
            "tool": tool_name,
            "parameters": parameters,
            "result": result,
        }).to_string()),
        PartPayload::Goal { title, description, .. } => Some(format!("{title}: {description}")),
        PartPayload::Progress { step_name, .. } => Some(step_name.clone()),
        PartPayload::Todo { items } => Some(
            items
                .iter()
                .map(|i| i.content.as_str())
                .collect::<Vec<_>>()
                .join("; "),
        ),
    }
}

fn render_transcript(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| {
            let body: Vec<String> = m.parts.iter().filter_map(|p| summarizable_text(&p.payload)).collect();
            format!("{:?}: {}", m.role, body.join(" "))
        })
        .collect::<Vec<_>>()
        .join("\n")
}
