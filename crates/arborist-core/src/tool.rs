//! Tool registry.
//!
//! Every tool carries its schema and permission level alongside an explicit
//! `execution_mode`, distinguishing tools the core can run in-process (§4.5, LOCAL)
//! from ones a remote client must execute and report back (REMOTE).

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PermissionLevel {
    Read,
    Write,
    Execute,
    Network,
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Local,
    Remote,
}

#[derive(Debug, Clone)]
pub struct ToolSchemaInfo {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[async_trait]
pub trait Tool: Send + Sync {
    /// Execute the tool with validated input, returning its raw JSON result.
    async fn execute(&self, input: Value) -> Result<Value>;

    fn name(&self) -> &str;

    fn schema(&self) -> ToolSchemaInfo;

    fn permission_level(&self) -> PermissionLevel;

    /// Where this invocation should run. Every catalog tool in this crate is LOCAL;
    /// REMOTE exists so the dispatcher (§4.5) has a real branch to exercise against a
    /// future IDE-hosted tool.
    fn execution_mode(&self, _params: &Value) -> ExecutionMode {
        ExecutionMode::Local
    }
}

/// Name-keyed map of registered tools. Read-mostly; registration happens at startup
/// and is idempotent by name (re-registration replaces).
#[derive(Default)]
pub struct ToolRegistry {
    tools: DashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|entry| entry.value().clone())
    }

    pub fn describe(&self) -> Vec<ToolSchemaInfo> {
        self.tools.iter().map(|entry| entry.value().schema()).collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
