//! Tool dispatch pipeline.
//!
//! LOCAL tools run on a bounded worker pool; REMOTE tools are handed to an outbound
//! channel as a `{callId, toolName, params}` envelope and the dispatcher awaits a
//! correlated reply through a `oneshot` channel keyed by `callId`: one `callId`,
//! exactly one reply, delivered to exactly one waiter.

use crate::errors::CoreError;
use crate::tool::{ExecutionMode, Tool, ToolRegistry};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Semaphore};
use tracing::{info, warn};

/// Envelope sent to the IDE host for a REMOTE tool call.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteToolCall {
    pub call_id: String,
    pub tool_name: String,
    pub params: Value,
}

/// Reply received back from the IDE host for a REMOTE tool call.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteToolReply {
    pub call_id: String,
    pub result: Option<Value>,
    pub error: Option<String>,
}

pub struct Dispatcher {
    registry: Arc<ToolRegistry>,
    local_permits: Semaphore,
    pending_remote: DashMap<String, oneshot::Sender<RemoteToolReply>>,
    remote_timeout: Duration,
}

impl Dispatcher {
    pub fn new(registry: Arc<ToolRegistry>, max_parallel_local: usize, remote_timeout: Duration) -> Self {
        Self {
            registry,
            local_permits: Semaphore::new(max_parallel_local.max(1)),
            pending_remote: DashMap::new(),
            remote_timeout,
        }
    }

    /// Coerce loosely-typed JSON input against a tool's declared schema: numeric
    /// strings become numbers, `"true"`/`"false"` strings become booleans. Anything
    /// that already matches its declared type, or has no declared type, passes
    /// through unchanged.
    pub fn coerce_params(schema: &Value, params: &Value) -> Value {
        let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
            return params.clone();
        };
        let Some(obj) = params.as_object() else {
            return params.clone();
        };

        let mut coerced = obj.clone();
        for (key, prop_schema) in properties {
            let Some(declared_type) = prop_schema.get("type").and_then(Value::as_str) else {
                continue;
            };
            let Some(value) = coerced.get(key).cloned() else {
                continue;
            };
            let Some(replacement) = coerce_scalar(declared_type, &value) else {
                continue;
            };
            coerced.insert(key.clone(), replacement);
        }
        Value::Object(coerced)
    }

    /// Dispatch one tool call by name, routing LOCAL or REMOTE per the tool's own
    /// `execution_mode`.
    pub async fn dispatch(
        &self,
        tool_name: &str,
        params: Value,
        call_id: &str,
        remote_tx: Option<&tokio::sync::mpsc::Sender<RemoteToolCall>>,
    ) -> Result<Value, CoreError> {
        let tool = self
            .registry
            .get(tool_name)
            .ok_or_else(|| CoreError::UnknownTool(tool_name.to_string()))?;

        let coerced = Self::coerce_params(&tool.schema().parameters, &params);

        match tool.execution_mode(&coerced) {
            ExecutionMode::Local => self.dispatch_local(tool, coerced, call_id).await,
            ExecutionMode::Remote => {
                let tx = remote_tx.ok_or_else(|| {
                    CoreError::InvalidArgument(format!(
                        "tool {tool_name} requested REMOTE execution but no outbound channel is wired"
                    ))
                })?;
                self.dispatch_remote(tool_name, coerced, call_id, tx).await
            }
        }
    }

    async fn dispatch_local(&self, tool: Arc<dyn Tool>, params: Value, call_id: &str) -> Result<Value, CoreError> {
        let _permit = self
            .local_permits
            .acquire()
            .await
            .map_err(|_| CoreError::Cancelled(format!("dispatcher shut down before call {call_id} ran")))?;

        info!(tool = tool.name(), call_id, "dispatching LOCAL tool");
        tool.execute(params)
            .await
            .map_err(|e| CoreError::classify(&e))
    }

    async fn dispatch_remote(
        &self,
        tool_name: &str,
        params: Value,
        call_id: &str,
        remote_tx: &tokio::sync::mpsc::Sender<RemoteToolCall>,
    ) -> Result<Value, CoreError> {
        if self.pending_remote.contains_key(call_id) {
            return Err(CoreError::InvalidArgument(format!(
                "duplicate callId {call_id}: a REMOTE call with this id is already in flight"
            )));
        }

        let (tx, rx) = oneshot::channel();
        self.pending_remote.insert(call_id.to_string(), tx);

        let envelope = RemoteToolCall {
            call_id: call_id.to_string(),
            tool_name: tool_name.to_string(),
            params,
        };
        if remote_tx.send(envelope).await.is_err() {
            self.pending_remote.remove(call_id);
            return Err(CoreError::Transient("outbound channel to IDE host is closed".into()));
        }

        let reply = tokio::time::timeout(self.remote_timeout, rx).await;
        self.pending_remote.remove(call_id);

        match reply {
            Ok(Ok(reply)) => match reply.error {
                Some(err) => Err(CoreError::classify(&anyhow::anyhow!(err))),
                None => Ok(reply.result.unwrap_or(Value::Null)),
            },
            Ok(Err(_)) => Err(CoreError::Cancelled(format!("call {call_id} was cancelled before a reply arrived"))),
            Err(_) => Err(CoreError::Timeout(format!("no REMOTE reply for call {call_id} within timeout"))),
        }
    }

    /// Deliver a reply for a pending REMOTE call. A reply for an unknown or
    /// already-resolved `callId` is idempotently ignored (duplicate replies are not
    /// an error — the first reply already won).
    pub fn resolve_remote(&self, reply: RemoteToolReply) {
        if let Some((_, tx)) = self.pending_remote.remove(&reply.call_id) {
            let _ = tx.send(reply);
        } else {
            warn!(call_id = %reply.call_id, "dropped REMOTE reply for unknown or already-resolved call");
        }
    }

    pub fn pending_remote_count(&self) -> usize {
        self.pending_remote.len()
    }
}

fn coerce_scalar(declared_type: &str, value: &Value) -> Option<Value> {
    match (declared_type, value) {
        ("number" | "integer", Value::String(s)) => s.trim().parse::<f64>().ok().map(|n| {
            serde_json::Number::from_f64(n)
                .map(Value::Number)
                .unwrap_or(Value::Null)
        }),
        ("boolean", Value::String(s)) => match s.trim() {
            "true" => Some(Value::Bool(true)),
            "false" => Some(Value::Bool(false)),
            _ => None,
        },
        _ => None,
    }
}
