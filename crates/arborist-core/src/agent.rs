//! Reason-act agent loop.
//!
//! Lexes the LLM's `StreamChunk` stream directly into `Part`s as they arrive (TEXT,
//! REASONING and TOOL parts can interleave within one assistant message). Real
//! cancellation is cooperative: an `Arc<AtomicBool>` flag is checked at the points
//! §5 names — before each LLM request, before submitting a new tool call, and while
//! awaiting a tool reply.

use crate::context_compactor::ContextCompactor;
use crate::dispatcher::{Dispatcher, RemoteToolCall};
use crate::errors::CoreError;
use crate::llm::provider::LLMProvider;
use crate::llm::types as llm;
use crate::part::{Message, Part, PartPayload, Role, Session, ToolState};
use crate::sub_task::run_sub_task;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::Sender;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    pub system_prompt: String,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub model: String,
    /// Number of most-recent messages context compaction always keeps verbatim.
    #[serde(default = "default_keep_recent")]
    pub keep_recent_messages: usize,
}

fn default_max_iterations() -> usize {
    10
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_keep_recent() -> usize {
    6
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            system_prompt: "You are a helpful assistant with access to tools.".to_string(),
            max_iterations: default_max_iterations(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            model: String::new(),
            keep_recent_messages: default_keep_recent(),
        }
    }
}

/// Per-session cooperative cancellation flag. Cloned into every in-flight turn;
/// `STOP` sets it, the next cooperative checkpoint observes it.
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// One increment in a turn's Part stream: either a Part was created or
/// mutated in place, or the turn has emitted its last Part.
/// Re-emission of the same `Part::id` is an update, not a duplicate.
#[derive(Debug, Clone)]
pub enum PartEvent {
    Emitted(Part),
    Complete { session_id: String },
}

/// Outbound channel a turn streams `PartEvent`s to as they're lexed out of the
/// live `StreamChunk` stream. At most one subscriber per turn.
pub type StreamSink = Sender<PartEvent>;

async fn emit_part(stream_tx: Option<&StreamSink>, part: &Part) {
    if let Some(tx) = stream_tx {
        let _ = tx.send(PartEvent::Emitted(part.clone())).await;
    }
}

pub struct Agent {
    pub config: AgentConfig,
    provider: Arc<dyn LLMProvider>,
    dispatcher: Arc<Dispatcher>,
    compactor: Option<Arc<ContextCompactor>>,
}

impl Agent {
    pub fn new(config: AgentConfig, provider: Arc<dyn LLMProvider>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            config,
            provider,
            dispatcher,
            compactor: None,
        }
    }

    pub fn with_compactor(mut self, compactor: Arc<ContextCompactor>) -> Self {
        self.compactor = Some(compactor);
        self
    }

    /// Run one user turn to completion: append the user message, loop LLM
    /// generation and tool dispatch until a terminal TEXT part is produced, the
    /// iteration cap is hit, or `cancel` fires. Returns the final assistant TEXT.
    ///
    /// `stream_tx`, when given, receives every Part as it's created or mutated,
    /// plus exactly one `PartEvent::Complete` when the turn ends, win or lose.
    pub async fn run_turn(
        &self,
        session: &mut Session,
        user_text: &str,
        cancel: &CancellationToken,
        stream_tx: Option<&StreamSink>,
        remote_tx: Option<&Sender<RemoteToolCall>>,
    ) -> Result<String, CoreError> {
        let result = self.run_turn_inner(session, user_text, cancel, stream_tx, remote_tx).await;
        if let Some(tx) = stream_tx {
            let _ = tx.send(PartEvent::Complete { session_id: session.id.clone() }).await;
        }
        result
    }

    async fn run_turn_inner(
        &self,
        session: &mut Session,
        user_text: &str,
        cancel: &CancellationToken,
        stream_tx: Option<&StreamSink>,
        remote_tx: Option<&Sender<RemoteToolCall>>,
    ) -> Result<String, CoreError> {
        let mut user_msg = Message::new(&session.id, Role::User);
        user_msg.push(Part::user_echo(&user_msg.id.clone(), &session.id, user_text));
        session.append(user_msg);

        if let Some(compactor) = &self.compactor {
            if compactor.needs_compaction(&session.messages) {
                match compactor.compact(&session.messages, self.config.keep_recent_messages).await {
                    Ok(compacted) => session.messages = compacted,
                    Err(e) => warn!(error = %e, "context compaction failed, continuing with full history"),
                }
            }
        }

        for iteration in 0..self.config.max_iterations {
            if cancel.is_cancelled() {
                self.emit_cancellation_text(session, stream_tx).await;
                return Err(CoreError::Cancelled("turn cancelled before LLM request".into()));
            }

            let llm_messages = to_llm_messages(&session.messages);
            let config = llm::GenerateConfig {
                model: self.config.model.clone(),
                max_tokens: self.config.max_tokens,
                temperature: self.config.temperature,
                system_prompt: Some(self.config.system_prompt.clone()),
            };

            let mut stream = self
                .provider
                .generate_stream(&llm_messages, &[], &config)
                .await
                .map_err(|e| CoreError::classify(&e))?;

            let mut assistant_msg = Message::new(&session.id, Role::Assistant);
            let mut text_idx: Option<usize> = None;
            let mut reasoning_idx: Option<usize> = None;
            let mut tool_indices: HashMap<String, usize> = HashMap::new(); // call_id -> part index
            let mut tool_input_buf: HashMap<String, String> = HashMap::new(); // call_id -> json buf
            let mut call_ids: Vec<String> = Vec::new(); // emission order, for run_tool_calls
            let mut final_text = String::new();
            let mut stop_reason = llm::StopReason::EndTurn;

            // Lex the live StreamChunk stream directly into Parts: each chunk either
            // starts a new Part or mutates one already pushed onto `assistant_msg`,
            // and every creation/mutation is re-emitted through `stream_tx` in place
            // with the same `id`, so a receiver sees an update, never a duplicate.
            while let Some(chunk) = stream.recv().await {
                match chunk {
                    llm::StreamChunk::TextDelta(delta) => {
                        let idx = *text_idx.get_or_insert_with(|| {
                            assistant_msg.push(Part::text(&assistant_msg.id.clone(), &session.id, ""));
                            assistant_msg.parts.len() - 1
                        });
                        assistant_msg.parts[idx].append_text(&delta);
                        final_text.push_str(&delta);
                        emit_part(stream_tx, &assistant_msg.parts[idx]).await;
                    }
                    llm::StreamChunk::ReasoningDelta(delta) => {
                        let idx = *reasoning_idx.get_or_insert_with(|| {
                            assistant_msg.push(Part::reasoning(&assistant_msg.id.clone(), &session.id, ""));
                            assistant_msg.parts.len() - 1
                        });
                        assistant_msg.parts[idx].append_text(&delta);
                        emit_part(stream_tx, &assistant_msg.parts[idx]).await;
                    }
                    llm::StreamChunk::ToolCallStart { id, name } => {
                        assistant_msg.push(Part::tool_pending(
                            &assistant_msg.id.clone(),
                            &session.id,
                            name,
                            serde_json::json!({}),
                            id.clone(),
                        ));
                        let idx = assistant_msg.parts.len() - 1;
                        tool_indices.insert(id.clone(), idx);
                        tool_input_buf.insert(id.clone(), String::new());
                        call_ids.push(id);
                        emit_part(stream_tx, &assistant_msg.parts[idx]).await;
                    }
                    llm::StreamChunk::ToolCallDelta { id, input_delta } => {
                        let Some(buf) = tool_input_buf.get_mut(&id) else { continue };
                        buf.push_str(&input_delta);
                        if let (Ok(params), Some(&idx)) = (serde_json::from_str(buf), tool_indices.get(&id)) {
                            assistant_msg.parts[idx].set_tool_parameters(params);
                            emit_part(stream_tx, &assistant_msg.parts[idx]).await;
                        }
                    }
                    llm::StreamChunk::Done { stop_reason: reason, usage } => {
                        info!(
                            input_tokens = usage.input_tokens,
                            output_tokens = usage.output_tokens,
                            "LLM generation complete"
                        );
                        stop_reason = reason;
                    }
                }
            }

            session.append(assistant_msg);

            match stop_reason {
                llm::StopReason::EndTurn if call_ids.is_empty() => {
                    return Ok(final_text);
                }
                llm::StopReason::MaxTokens if call_ids.is_empty() => {
                    if !final_text.is_empty() {
                        warn!("context limit reached, returning partial response");
                        return Ok(final_text);
                    }
                    return Err(CoreError::InvalidArgument("context window exceeded with no output".into()));
                }
                _ => {
                    self.run_tool_calls(session, &call_ids, cancel, stream_tx, remote_tx).await?;
                }
            }

            if iteration + 1 == self.config.max_iterations {
                warn!(max = self.config.max_iterations, "max iterations reached, stopping agent loop");
                return Err(CoreError::InvalidArgument(format!(
                    "max iterations ({}) reached without a terminal response",
                    self.config.max_iterations
                )));
            }
        }

        Err(CoreError::InvalidArgument("agent loop exited without a terminal response".into()))
    }

    /// Cancellation clause (c): emit a final TEXT part noting the cancellation
    /// before the `Cancelled` error propagates.
    async fn emit_cancellation_text(&self, session: &mut Session, stream_tx: Option<&StreamSink>) {
        let mut msg = Message::new(&session.id, Role::Assistant);
        msg.push(Part::text(&msg.id.clone(), &session.id, "Turn cancelled."));
        emit_part(stream_tx, &msg.parts[0]).await;
        session.append(msg);
    }

    async fn run_tool_calls(
        &self,
        session: &mut Session,
        call_ids: &[String],
        cancel: &CancellationToken,
        stream_tx: Option<&StreamSink>,
        remote_tx: Option<&Sender<RemoteToolCall>>,
    ) -> Result<(), CoreError> {
        for call_id in call_ids {
            if cancel.is_cancelled() {
                self.mark_tool_cancelled(session, call_id, stream_tx).await;
                continue;
            }

            let Some((tool_name, params)) = self.tool_call_args(session, call_id) else { continue };
            self.transition_tool(session, call_id, ToolState::Running, None, None, stream_tx).await;

            let result = run_sub_task(&self.dispatcher, &tool_name, params, call_id, remote_tx).await;

            if cancel.is_cancelled() {
                self.mark_tool_cancelled(session, call_id, stream_tx).await;
                continue;
            }

            if result.is_error {
                self.transition_tool(session, call_id, ToolState::Error, None, Some(result.summary), stream_tx)
                    .await;
            } else {
                self.transition_tool(
                    session,
                    call_id,
                    ToolState::Completed,
                    Some(serde_json::Value::String(result.summary)),
                    None,
                    stream_tx,
                )
                .await;
            }
        }
        Ok(())
    }

    fn tool_call_args(&self, session: &Session, call_id: &str) -> Option<(String, serde_json::Value)> {
        let part = session.messages.last()?.parts.iter().find(|p| p.call_id() == Some(call_id))?;
        match &part.payload {
            PartPayload::Tool { tool_name, parameters, .. } => Some((tool_name.clone(), parameters.clone())),
            _ => None,
        }
    }

    async fn mark_tool_cancelled(&self, session: &mut Session, call_id: &str, stream_tx: Option<&StreamSink>) {
        self.transition_tool(session, call_id, ToolState::Error, None, Some("cancelled".to_string()), stream_tx)
            .await;
    }

    async fn transition_tool(
        &self,
        session: &mut Session,
        call_id: &str,
        next: ToolState,
        result: Option<serde_json::Value>,
        error: Option<String>,
        stream_tx: Option<&StreamSink>,
    ) {
        let Some(msg) = session.messages.last_mut() else { return };
        let Some(part) = msg.parts.iter_mut().find(|p| p.call_id() == Some(call_id)) else { return };
        part.set_tool_state(next, result, error);
        emit_part(stream_tx, part).await;
    }
}

/// Flatten our `Part`-based message history into the provider-facing `llm::Message`
/// wire format, dropping REASONING parts (never sent back to the model) and
/// rendering completed TOOL parts as tool-result messages.
fn to_llm_messages(messages: &[Message]) -> Vec<llm::Message> {
    let mut out = Vec::new();
    for msg in messages {
        for part in &msg.parts {
            match &part.payload {
                PartPayload::Text { text } => out.push(llm::Message {
                    role: role_to_llm(msg.role),
                    content: llm::Content::Text { text: text.clone() },
                }),
                PartPayload::User { text } => out.push(llm::Message::user(text)),
                PartPayload::Reasoning { .. } => {}
                PartPayload::Tool { tool_name, call_id, state, parameters, result, error, .. } => {
                    out.push(llm::Message {
                        role: role_to_llm(msg.role),
                        content: llm::Content::ToolCall(llm::ToolCall {
                            id: call_id.clone(),
                            name: tool_name.clone(),
                            input: parameters.clone(),
                        }),
                    });
                    if matches!(state, ToolState::Completed | ToolState::Error) {
                        let output = result
                            .as_ref()
                            .and_then(|v| v.as_str().map(str::to_string))
                            .or_else(|| error.clone())
                            .unwrap_or_default();
                        out.push(llm::Message::tool_result(call_id, tool_name, &output, *state == ToolState::Error));
                    }
                }
                PartPayload::Goal { .. } | PartPayload::Progress { .. } | PartPayload::Todo { .. } => {}
            }
        }
    }
    out
}

fn role_to_llm(role: Role) -> llm::Role {
    match role {
        Role::User => llm::Role::User,
        Role::Assistant => llm::Role::Assistant,
        Role::System => llm::Role::System,
    }
}

pub fn new_call_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::{PermissionLevel, Tool, ToolRegistry, ToolSchemaInfo};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering as AOrdering};
    use std::time::Duration;

    struct ScriptedLLM {
        responses: Vec<llm::GenerateResponse>,
        call_count: AtomicUsize,
    }

    impl ScriptedLLM {
        fn new(responses: Vec<llm::GenerateResponse>) -> Self {
            Self { responses, call_count: AtomicUsize::new(0) }
        }
    }

    #[async_trait]
    impl LLMProvider for ScriptedLLM {
        async fn generate(
            &self,
            _messages: &[llm::Message],
            _tools: &[llm::ToolSchema],
            _config: &llm::GenerateConfig,
        ) -> anyhow::Result<llm::GenerateResponse> {
            let idx = self.call_count.fetch_add(1, AOrdering::SeqCst);
            self.responses
                .get(idx)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no more scripted responses"))
        }
        fn supports_vision(&self) -> bool {
            false
        }
        fn model_name(&self) -> &str {
            "mock"
        }
    }

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        async fn execute(&self, input: serde_json::Value) -> anyhow::Result<serde_json::Value> {
            Ok(input)
        }
        fn name(&self) -> &str {
            "echo"
        }
        fn schema(&self) -> ToolSchemaInfo {
            ToolSchemaInfo { name: "echo".into(), description: "".into(), parameters: json!({"type": "object"}) }
        }
        fn permission_level(&self) -> PermissionLevel {
            PermissionLevel::Read
        }
    }

    fn dispatcher() -> Arc<Dispatcher> {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        Arc::new(Dispatcher::new(Arc::new(registry), 4, Duration::from_secs(5)))
    }

    fn end_turn(text: &str) -> llm::GenerateResponse {
        llm::GenerateResponse {
            content: llm::Content::Text { text: text.into() },
            stop_reason: llm::StopReason::EndTurn,
            usage: llm::Usage::default(),
            model: "mock".into(),
        }
    }

    fn tool_call(id: &str, name: &str, input: serde_json::Value) -> llm::GenerateResponse {
        llm::GenerateResponse {
            content: llm::Content::ToolCall(llm::ToolCall { id: id.into(), name: name.into(), input }),
            stop_reason: llm::StopReason::ToolUse,
            usage: llm::Usage::default(),
            model: "mock".into(),
        }
    }

    #[tokio::test]
    async fn simple_turn_returns_text_and_appends_two_messages() {
        let provider = Arc::new(ScriptedLLM::new(vec![end_turn("hello there")]));
        let agent = Agent::new(AgentConfig::default(), provider, dispatcher());
        let mut session = Session::new("P1");
        let cancel = CancellationToken::new();

        let text = agent.run_turn(&mut session, "hi", &cancel, None, None).await.unwrap();
        assert_eq!(text, "hello there");
        assert_eq!(session.message_count(), 2);
    }

    #[tokio::test]
    async fn tool_call_then_final_response_transitions_tool_state() {
        let provider = Arc::new(ScriptedLLM::new(vec![
            tool_call("c1", "echo", json!({"x": 1})),
            end_turn("done"),
        ]));
        let agent = Agent::new(AgentConfig::default(), provider, dispatcher());
        let mut session = Session::new("P1");
        let cancel = CancellationToken::new();

        let text = agent.run_turn(&mut session, "run echo", &cancel, None, None).await.unwrap();
        assert_eq!(text, "done");

        let tool_part = session.messages[1]
            .parts
            .iter()
            .find(|p| p.call_id() == Some("c1"))
            .unwrap();
        assert_eq!(tool_part.payload.as_tool_state(), Some(ToolState::Completed));
    }

    #[tokio::test]
    async fn cancellation_before_request_short_circuits() {
        let provider = Arc::new(ScriptedLLM::new(vec![end_turn("should not be reached")]));
        let agent = Agent::new(AgentConfig::default(), provider, dispatcher());
        let mut session = Session::new("P1");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = agent.run_turn(&mut session, "hi", &cancel, None, None).await.unwrap_err();
        assert!(matches!(err, CoreError::Cancelled(_)));
    }

    #[tokio::test]
    async fn max_iterations_is_enforced() {
        let responses: Vec<_> = (0..5).map(|i| tool_call(&format!("c{i}"), "echo", json!({}))).collect();
        let provider = Arc::new(ScriptedLLM::new(responses));
        let mut config = AgentConfig::default();
        config.max_iterations = 2;
        let agent = Agent::new(config, provider, dispatcher());
        let mut session = Session::new("P1");
        let cancel = CancellationToken::new();

        let err = agent.run_turn(&mut session, "loop", &cancel, None, None).await.unwrap_err();
        assert!(err.to_string().contains("max iterations"));
    }

    #[test]
    fn to_llm_messages_preserves_tool_call_parameters() {
        let mut message = Message::new("S1", Role::Assistant);
        let mut part = Part::tool_pending("M1", "S1", "echo", json!({"x": 1}), "c1");
        part.set_tool_state(ToolState::Running, None, None);
        part.set_tool_state(ToolState::Completed, Some(json!("ok")), None);
        message.push(part);

        let llm_messages = to_llm_messages(&[message]);
        let tool_call_msg = llm_messages
            .iter()
            .find(|m| matches!(&m.content, llm::Content::ToolCall(_)))
            .unwrap();
        match &tool_call_msg.content {
            llm::Content::ToolCall(tc) => assert_eq!(tc.input, json!({"x": 1})),
            other => panic!("expected ToolCall, got {:?}", other),
        }
    }
}
