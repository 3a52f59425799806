use arborist_core::{Part, PartPayload};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Client → core message. One WebSocket connection carries one channel;
/// `AGENT_CHAT.sessionId` is empty to start a session and stable thereafter.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    AgentChat {
        message: String,
        #[serde(default)]
        session_id: String,
        project_key: String,
        #[serde(default)]
        project_path: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolResult {
        call_id: String,
        success: bool,
        #[serde(default)]
        result: Value,
        #[serde(default)]
        execution_time: Option<u64>,
        #[serde(default)]
        error: Option<String>,
    },
    Stop,
    Ping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentResponseStatus {
    Processing,
    WaitingConfirm,
    Completed,
    Success,
    Failed,
    Error,
    Cancelled,
}

/// Core → client message.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    AgentResponse {
        session_id: String,
        status: AgentResponseStatus,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        process: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        stage: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ToolCall {
        call_id: String,
        tool_name: String,
        params: Value,
    },
    #[serde(rename_all = "camelCase")]
    Stopped {
        session_id: String,
        message: String,
    },
    Pong {
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        error_code: String,
        error_message: String,
    },
}

impl ServerMessage {
    pub fn processing(session_id: impl Into<String>) -> Self {
        ServerMessage::AgentResponse {
            session_id: session_id.into(),
            status: AgentResponseStatus::Processing,
            content: String::new(),
            process: None,
            stage: None,
        }
    }

    /// Wire one incrementally-lexed Part as an AGENT_RESPONSE frame: per
    /// the wire protocol reference, AGENT_RESPONSE carries either a Part or a final-state update,
    /// distinguished by `process`/`stage` being set. `process` names the Part kind
    /// (TOOL, TEXT, ...); `stage` adds the tool name or progress step where one exists.
    pub fn part_update(session_id: impl Into<String>, part: &Part) -> Self {
        let stage = match &part.payload {
            PartPayload::Tool { tool_name, .. } => Some(tool_name.clone()),
            PartPayload::Progress { step_name, .. } => Some(step_name.clone()),
            _ => None,
        };
        ServerMessage::AgentResponse {
            session_id: session_id.into(),
            status: AgentResponseStatus::Processing,
            content: part.payload.preview(),
            process: Some(part.payload.kind().to_string()),
            stage,
        }
    }

    pub fn completed(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        ServerMessage::AgentResponse {
            session_id: session_id.into(),
            status: AgentResponseStatus::Completed,
            content: content.into(),
            process: None,
            stage: None,
        }
    }

    pub fn cancelled(session_id: impl Into<String>) -> Self {
        ServerMessage::AgentResponse {
            session_id: session_id.into(),
            status: AgentResponseStatus::Cancelled,
            content: "turn cancelled".to_string(),
            process: None,
            stage: None,
        }
    }

    pub fn failed(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        ServerMessage::AgentResponse {
            session_id: session_id.into(),
            status: AgentResponseStatus::Failed,
            content: content.into(),
            process: None,
            stage: None,
        }
    }

    pub fn error(error_code: impl Into<String>, error_message: impl Into<String>) -> Self {
        ServerMessage::Error {
            error_code: error_code.into(),
            error_message: error_message.into(),
        }
    }
}

/// Health check response, used by the plain HTTP `/health` route.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}
