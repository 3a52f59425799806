use std::sync::Arc;

use arborist_core::{
    Agent, CancellationToken, CoreError, Dispatcher, RemoteToolCall, RemoteToolReply, SessionStore, StreamSink,
};
use dashmap::DashMap;
use tokio::sync::mpsc::Sender;

/// Drives the agent loop on behalf of the WebSocket channel. Session
/// exclusivity and persistence are delegated to `SessionStore::begin_turn`/
/// `end_turn`; this layer only adds the cooperative cancellation registry that
/// `STOP` needs to reach a turn already in flight on another task.
pub struct SessionManager {
    store: Arc<SessionStore>,
    agent: Arc<Agent>,
    dispatcher: Arc<Dispatcher>,
    cancels: DashMap<String, CancellationToken>,
}

pub enum TurnOutcome {
    Completed { session_id: String, content: String },
    Cancelled { session_id: String },
    Failed { session_id: String, message: String },
}

impl SessionManager {
    pub fn new(store: Arc<SessionStore>, agent: Arc<Agent>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            store,
            agent,
            dispatcher,
            cancels: DashMap::new(),
        }
    }

    /// Run one `AGENT_CHAT` turn to completion. Returns `CoreError::SessionBusy`
    /// immediately (without registering a cancellation token) if the named
    /// session already has a turn in flight.
    pub async fn run_turn(
        &self,
        session_id: &str,
        project_key: &str,
        message: &str,
        part_tx: &StreamSink,
        remote_tx: &Sender<RemoteToolCall>,
    ) -> Result<TurnOutcome, CoreError> {
        let (id, mut turn) = self.store.begin_turn(session_id, project_key).await?;
        let cancel = CancellationToken::new();
        self.cancels.insert(id.clone(), cancel.clone());

        let result = self.agent.run_turn(&mut turn, message, &cancel, Some(part_tx), Some(remote_tx)).await;
        self.cancels.remove(&id);
        self.store.end_turn(project_key, turn).await;

        Ok(match result {
            Ok(content) => TurnOutcome::Completed { session_id: id, content },
            Err(CoreError::Cancelled(_)) => TurnOutcome::Cancelled { session_id: id },
            Err(e) => TurnOutcome::Failed { session_id: id, message: e.to_string() },
        })
    }

    /// Signal `STOP` for a session with a turn in flight. Returns `false` if no
    /// turn is currently running for that session (a no-op acknowledgement, not
    /// an error — STOP on an idle session is harmless).
    pub fn stop(&self, session_id: &str) -> bool {
        match self.cancels.get(session_id) {
            Some(cancel) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Deliver a `TOOL_RESULT` reply for a pending REMOTE dispatch.
    pub fn resolve_tool_result(&self, reply: RemoteToolReply) {
        self.dispatcher.resolve_remote(reply);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arborist_core::llm::provider::LLMProvider;
    use arborist_core::llm::types as llm;
    use arborist_core::{AgentConfig, ToolRegistry};
    use async_trait::async_trait;
    use std::time::Duration;

    struct EchoLLM;

    #[async_trait]
    impl LLMProvider for EchoLLM {
        async fn generate(
            &self,
            _messages: &[llm::Message],
            _tools: &[llm::ToolSchema],
            _config: &llm::GenerateConfig,
        ) -> anyhow::Result<llm::GenerateResponse> {
            Ok(llm::GenerateResponse {
                content: llm::Content::Text { text: "hello there".into() },
                stop_reason: llm::StopReason::EndTurn,
                usage: llm::Usage::default(),
                model: "mock".into(),
            })
        }
        fn supports_vision(&self) -> bool {
            false
        }
        fn model_name(&self) -> &str {
            "mock"
        }
    }

    fn manager(dir: &std::path::Path) -> SessionManager {
        let store = Arc::new(SessionStore::new(dir.to_path_buf()));
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(ToolRegistry::new()), 4, Duration::from_secs(5)));
        let agent = Arc::new(Agent::new(AgentConfig::default(), Arc::new(EchoLLM), dispatcher.clone()));
        SessionManager::new(store, agent, dispatcher)
    }

    #[tokio::test]
    async fn run_turn_returns_completed_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let (part_tx, _part_rx) = tokio::sync::mpsc::channel(8);
        let (tx, _rx) = tokio::sync::mpsc::channel(4);

        let outcome = manager.run_turn("", "P1", "hi", &part_tx, &tx).await.unwrap();
        match outcome {
            TurnOutcome::Completed { content, .. } => assert_eq!(content, "hello there"),
            _ => panic!("expected Completed"),
        }
    }

    #[tokio::test]
    async fn stop_on_idle_session_returns_false() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        assert!(!manager.stop("nonexistent"));
    }

    struct TwoTurnLLM {
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl LLMProvider for TwoTurnLLM {
        async fn generate(
            &self,
            _messages: &[llm::Message],
            _tools: &[llm::ToolSchema],
            _config: &llm::GenerateConfig,
        ) -> anyhow::Result<llm::GenerateResponse> {
            let n = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if n == 0 {
                Ok(llm::GenerateResponse {
                    content: llm::Content::ToolCall(llm::ToolCall {
                        id: "c1".into(),
                        name: "echo".into(),
                        input: serde_json::json!({}),
                    }),
                    stop_reason: llm::StopReason::ToolUse,
                    usage: llm::Usage::default(),
                    model: "mock".into(),
                })
            } else {
                Ok(llm::GenerateResponse {
                    content: llm::Content::Text { text: "should not be reached".into() },
                    stop_reason: llm::StopReason::EndTurn,
                    usage: llm::Usage::default(),
                    model: "mock".into(),
                })
            }
        }
        fn supports_vision(&self) -> bool {
            false
        }
        fn model_name(&self) -> &str {
            "mock"
        }
    }

    struct SlowEchoTool;

    #[async_trait]
    impl arborist_core::Tool for SlowEchoTool {
        async fn execute(&self, input: serde_json::Value) -> anyhow::Result<serde_json::Value> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(input)
        }
        fn name(&self) -> &str {
            "echo"
        }
        fn schema(&self) -> arborist_core::ToolSchemaInfo {
            arborist_core::ToolSchemaInfo {
                name: "echo".into(),
                description: "".into(),
                parameters: serde_json::json!({"type": "object"}),
            }
        }
        fn permission_level(&self) -> arborist_core::PermissionLevel {
            arborist_core::PermissionLevel::Read
        }
    }

    #[tokio::test]
    async fn stop_cancels_a_turn_between_tool_call_and_next_llm_request() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::new(dir.path().to_path_buf()));
        let registry = ToolRegistry::new();
        registry.register(Arc::new(SlowEchoTool));
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(registry), 4, Duration::from_secs(5)));
        let provider = Arc::new(TwoTurnLLM { calls: std::sync::atomic::AtomicUsize::new(0) });
        let agent = Arc::new(Agent::new(AgentConfig::default(), provider, dispatcher.clone()));
        let manager = Arc::new(SessionManager::new(store, agent, dispatcher));
        let (part_tx, _part_rx) = tokio::sync::mpsc::channel(8);
        let (tx, _rx) = tokio::sync::mpsc::channel(4);

        let m = manager.clone();
        let part_tx2 = part_tx.clone();
        let tx2 = tx.clone();
        let handle =
            tokio::spawn(async move { m.run_turn("", "P1", "run echo", &part_tx2, &tx2).await.unwrap() });

        // The tool call (50ms) is in flight; poll for its session id to appear in
        // the cancellation registry, then issue STOP on it before the agent loop's
        // next cooperative checkpoint.
        let mut session_id = None;
        for _ in 0..20 {
            if let Some(entry) = manager.cancels.iter().next() {
                session_id = Some(entry.key().clone());
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        let session_id = session_id.expect("turn should have registered a cancellation token");
        assert!(manager.stop(&session_id));

        let outcome = handle.await.unwrap();
        assert!(matches!(outcome, TurnOutcome::Cancelled { .. }));
    }
}
