//! Session, Message and Part data model.
//!
//! A `Session` owns an append-only sequence of `Message`s; each `Message` owns an
//! ordered sequence of `Part`s. `Part` is a tagged union over seven variants, each
//! with its own payload and (for TOOL) its own state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Idle,
    Busy,
    /// Transient label for observation only; not a durable state.
    Retry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// Shared status enum for GOAL parts and individual TODO items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemStatus {
    Pending,
    InProgress,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToolState {
    Pending,
    Running,
    Completed,
    Error,
}

impl ToolState {
    /// TOOL state machine: PENDING -> RUNNING -> (COMPLETED | ERROR); no other edges.
    pub fn can_transition_to(self, next: ToolState) -> bool {
        matches!(
            (self, next),
            (ToolState::Pending, ToolState::Running)
                | (ToolState::Running, ToolState::Completed)
                | (ToolState::Running, ToolState::Error)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TodoItem {
    pub id: String,
    pub content: String,
    pub status: ItemStatus,
}

/// One typed event in an assistant message's output stream (GLOSSARY: Part).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PartPayload {
    Text {
        text: String,
    },
    /// Hidden model-internal thought; never included in context-compaction summaries
    /// and never shown to the user.
    Reasoning {
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    Tool {
        tool_name: String,
        parameters: Value,
        call_id: String,
        state: ToolState,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
    },
    Goal {
        title: String,
        description: String,
        status: ItemStatus,
    },
    #[serde(rename_all = "camelCase")]
    Progress {
        current_step: u32,
        total_steps: u32,
        step_name: String,
    },
    Todo {
        items: Vec<TodoItem>,
    },
    /// Echoes user input; kept distinct from TEXT to ease UI rendering.
    User {
        text: String,
    },
}

impl PartPayload {
    pub fn is_terminal_text(&self) -> bool {
        matches!(self, PartPayload::Text { text } if !text.is_empty())
    }

    pub fn as_tool_state(&self) -> Option<ToolState> {
        match self {
            PartPayload::Tool { state, .. } => Some(*state),
            _ => None,
        }
    }

    /// The variant tag, matching the wire `type` discriminant.
    pub fn kind(&self) -> &'static str {
        match self {
            PartPayload::Text { .. } => "TEXT",
            PartPayload::Reasoning { .. } => "REASONING",
            PartPayload::Tool { .. } => "TOOL",
            PartPayload::Goal { .. } => "GOAL",
            PartPayload::Progress { .. } => "PROGRESS",
            PartPayload::Todo { .. } => "TODO",
            PartPayload::User { .. } => "USER",
        }
    }

    /// Short human-readable summary for transports that carry a flat `content`
    /// string rather than the full payload (the gateway's AGENT_RESPONSE frame).
    pub fn preview(&self) -> String {
        const MAX_CHARS: usize = 200;
        let truncate = |s: &str| {
            if s.chars().count() > MAX_CHARS {
                format!("{}…", s.chars().take(MAX_CHARS).collect::<String>())
            } else {
                s.to_string()
            }
        };
        match self {
            PartPayload::Text { text } | PartPayload::Reasoning { text } | PartPayload::User { text } => truncate(text),
            PartPayload::Tool { tool_name, state, .. } => format!("{tool_name} ({state:?})"),
            PartPayload::Goal { title, .. } => truncate(title),
            PartPayload::Progress { current_step, total_steps, step_name } => {
                format!("{current_step}/{total_steps} {step_name}")
            }
            PartPayload::Todo { items } => format!("{} item(s)", items.len()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    pub id: String,
    pub message_id: String,
    pub session_id: String,
    pub created_time: DateTime<Utc>,
    pub updated_time: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: PartPayload,
}

impl Part {
    fn new(message_id: &str, session_id: &str, payload: PartPayload) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            message_id: message_id.to_string(),
            session_id: session_id.to_string(),
            created_time: now,
            updated_time: now,
            payload,
        }
    }

    pub fn text(message_id: &str, session_id: &str, text: impl Into<String>) -> Self {
        Self::new(message_id, session_id, PartPayload::Text { text: text.into() })
    }

    pub fn reasoning(message_id: &str, session_id: &str, text: impl Into<String>) -> Self {
        Self::new(
            message_id,
            session_id,
            PartPayload::Reasoning { text: text.into() },
        )
    }

    pub fn user_echo(message_id: &str, session_id: &str, text: impl Into<String>) -> Self {
        Self::new(message_id, session_id, PartPayload::User { text: text.into() })
    }

    pub fn tool_pending(
        message_id: &str,
        session_id: &str,
        tool_name: impl Into<String>,
        parameters: Value,
        call_id: impl Into<String>,
    ) -> Self {
        Self::new(
            message_id,
            session_id,
            PartPayload::Tool {
                tool_name: tool_name.into(),
                parameters,
                call_id: call_id.into(),
                state: ToolState::Pending,
                result: None,
                error: None,
                title: None,
                content: None,
            },
        )
    }

    /// Transition a TOOL part's state in place. Panics on an illegal edge since that
    /// indicates a bug in the caller (the agent loop), not a recoverable runtime error.
    pub fn set_tool_state(&mut self, next: ToolState, result: Option<Value>, error: Option<String>) {
        if let PartPayload::Tool { state, result: r, error: e, .. } = &mut self.payload {
            assert!(
                state.can_transition_to(next),
                "illegal TOOL state transition {:?} -> {:?}",
                state,
                next
            );
            *state = next;
            *r = result;
            *e = error;
        } else {
            panic!("set_tool_state called on a non-TOOL part");
        }
    }

    pub fn call_id(&self) -> Option<&str> {
        match &self.payload {
            PartPayload::Tool { call_id, .. } => Some(call_id),
            _ => None,
        }
    }

    /// Append `delta` to a TEXT or REASONING part's text in place, advancing
    /// `updatedTime`. No-op (returns `false`) on any other payload kind.
    pub fn append_text(&mut self, delta: &str) -> bool {
        match &mut self.payload {
            PartPayload::Text { text } | PartPayload::Reasoning { text } => {
                text.push_str(delta);
                self.updated_time = Utc::now();
                true
            }
            _ => false,
        }
    }

    /// Replace a TOOL part's accumulated input parameters in place, as
    /// `ToolCallDelta` chunks complete a parseable JSON object. No-op on any
    /// other payload kind.
    pub fn set_tool_parameters(&mut self, params: Value) {
        if let PartPayload::Tool { parameters, .. } = &mut self.payload {
            *parameters = params;
            self.updated_time = Utc::now();
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub parts: Vec<Part>,
    pub created_time: DateTime<Utc>,
}

impl Message {
    pub fn new(session_id: &str, role: Role) -> Self {
        Self {
            id: new_id(),
            session_id: session_id.to_string(),
            role,
            parts: Vec::new(),
            created_time: Utc::now(),
        }
    }

    pub fn push(&mut self, part: Part) {
        self.parts.push(part);
    }

    /// ASSISTANT messages end with a terminal part per §4.3 step 6: a non-empty TEXT
    /// part with no tool-call envelope still pending.
    pub fn ends_with_terminal_text(&self) -> bool {
        self.parts
            .last()
            .map(|p| p.payload.is_terminal_text())
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub project_key: String,
    pub messages: Vec<Message>,
    pub status: SessionStatus,
    pub created_time: DateTime<Utc>,
    pub updated_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_commit_time: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(project_key: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            project_key: project_key.into(),
            messages: Vec::new(),
            status: SessionStatus::Idle,
            created_time: now,
            updated_time: now,
            user_ip: None,
            user_name: None,
            last_commit_time: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn append(&mut self, message: Message) {
        self.updated_time = Utc::now();
        self.messages.push(message);
    }

    pub fn latest_user_message(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.role == Role::User)
    }

    pub fn latest_assistant_message(&self) -> Option<&Message> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_state_machine_rejects_skip() {
        assert!(ToolState::Pending.can_transition_to(ToolState::Running));
        assert!(!ToolState::Pending.can_transition_to(ToolState::Completed));
        assert!(ToolState::Running.can_transition_to(ToolState::Completed));
        assert!(ToolState::Running.can_transition_to(ToolState::Error));
        assert!(!ToolState::Completed.can_transition_to(ToolState::Running));
    }

    #[test]
    fn tool_part_transitions_in_place_preserve_id() {
        let mut part = Part::tool_pending("m1", "s1", "read_file", serde_json::json!({}), "c1");
        let id = part.id.clone();
        part.set_tool_state(ToolState::Running, None, None);
        part.set_tool_state(
            ToolState::Completed,
            Some(serde_json::json!({"ok": true})),
            None,
        );
        assert_eq!(part.id, id);
        assert_eq!(part.payload.as_tool_state(), Some(ToolState::Completed));
    }

    #[test]
    #[should_panic(expected = "illegal TOOL state transition")]
    fn tool_part_rejects_pending_to_completed() {
        let mut part = Part::tool_pending("m1", "s1", "read_file", serde_json::json!({}), "c1");
        part.set_tool_state(ToolState::Completed, None, None);
    }

    #[test]
    fn session_append_is_ordered() {
        let mut session = Session::new("P1");
        let mut m1 = Message::new(&session.id, Role::User);
        m1.push(Part::user_echo(&m1.id, &session.id, "hi"));
        session.append(m1);
        assert_eq!(session.message_count(), 1);
        assert_eq!(session.latest_user_message().unwrap().parts.len(), 1);
        assert!(session.latest_assistant_message().is_none());
    }

    #[test]
    fn part_serializes_with_flattened_header_and_camel_case() {
        let part = Part::tool_pending("m1", "s1", "read_file", serde_json::json!({"relativePath": "a.rs"}), "c1");
        let v = serde_json::to_value(&part).unwrap();
        assert_eq!(v["type"], "TOOL");
        assert_eq!(v["toolName"], "read_file");
        assert_eq!(v["callId"], "c1");
        assert_eq!(v["state"], "PENDING");
    }
}
