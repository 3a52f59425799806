//! Sub-task executor.
//!
//! For every tool invocation a transient sub-session carries only the tool's
//! parameters and the minimal project context needed to format the result; it is
//! discarded once the tool returns, and only the formatted summary crosses back
//! into the parent session. This keeps a single large tool output (a big file read,
//! a wide grep) from inflating the parent session's token footprint.

use crate::dispatcher::{Dispatcher, RemoteToolCall};
use crate::errors::CoreError;
use serde_json::Value;
use tokio::sync::mpsc::Sender;

/// Cap applied to a tool's formatted summary before it re-enters the parent
/// session. Content beyond this is truncated with a note, not silently dropped.
const MAX_SUMMARY_CHARS: usize = 8_000;

pub struct SubTaskResult {
    pub call_id: String,
    pub summary: String,
    pub is_error: bool,
}

/// Run one tool call in an ephemeral context and fold the result down to a string
/// summary sized for re-entry into the parent session.
pub async fn run_sub_task(
    dispatcher: &Dispatcher,
    tool_name: &str,
    params: Value,
    call_id: &str,
    remote_tx: Option<&Sender<RemoteToolCall>>,
) -> SubTaskResult {
    match dispatcher.dispatch(tool_name, params, call_id, remote_tx).await {
        Ok(value) => SubTaskResult {
            call_id: call_id.to_string(),
            summary: format_summary(&value),
            is_error: false,
        },
        Err(e) => SubTaskResult {
            call_id: call_id.to_string(),
            summary: format_error(&e),
            is_error: true,
        },
    }
}

fn format_summary(value: &Value) -> String {
    let rendered = match value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    };
    truncate(&rendered)
}

fn format_error(err: &CoreError) -> String {
    truncate(&format!("{}: {}", err.kind(), err))
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= MAX_SUMMARY_CHARS {
        return text.to_string();
    }
    let truncated: String = text.chars().take(MAX_SUMMARY_CHARS).collect();
    format!("{truncated}\n... [truncated, {} characters omitted]", text.chars().count() - MAX_SUMMARY_CHARS)
}
