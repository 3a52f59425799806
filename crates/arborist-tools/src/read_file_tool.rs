use anyhow::{bail, Context, Result};
use arborist_core::{PermissionLevel, Tool, ToolSchemaInfo};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::workspace_guard::WorkspaceGuard;

pub struct ReadFileTool {
    guard: Arc<WorkspaceGuard>,
}

impl ReadFileTool {
    pub fn new(guard: Arc<WorkspaceGuard>) -> Self {
        Self { guard }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    async fn execute(&self, input: Value) -> Result<Value> {
        let path_str = input["relativePath"]
            .as_str()
            .context("Missing required field 'relativePath'")?;
        // 1-based, inclusive; 0/absent means "from the start" / "to the end".
        let start_line = input["startLine"].as_u64().unwrap_or(1).max(1) as usize;
        let end_line = input["endLine"].as_u64().map(|n| n as usize);

        let path = self.guard.resolve(path_str)?;

        if !path.exists() {
            bail!("File not found: {}", path_str);
        }

        self.guard.check_size(&path).await?;

        let bytes = tokio::fs::read(&path).await.context("Failed to read file")?;
        if bytes.is_empty() {
            return Ok(json!({
                "content": "",
                "totalLines": 0,
                "linesShown": 0,
                "startLine": 0,
            }));
        }
        let check_len = bytes.len().min(8192);
        if bytes[..check_len].contains(&0) {
            bail!("Binary file detected, cannot read: {}", path_str);
        }
        let content = String::from_utf8(bytes).context("File is not valid UTF-8")?;

        let lines: Vec<&str> = content.lines().collect();
        let total_lines = lines.len();

        let start = (start_line - 1).min(total_lines);
        let end = end_line.map(|e| e.min(total_lines)).unwrap_or(total_lines).max(start);

        let numbered: Vec<String> = lines[start..end]
            .iter()
            .enumerate()
            .map(|(i, line)| format!("{:>6}\t{}", start + i + 1, line))
            .collect();

        Ok(json!({
            "content": numbered.join("\n"),
            "totalLines": total_lines,
            "linesShown": end - start,
            "startLine": start + 1,
        }))
    }

    fn name(&self) -> &str {
        "read_file"
    }

    fn schema(&self) -> ToolSchemaInfo {
        ToolSchemaInfo {
            name: "read_file".to_string(),
            description: "Read a file, optionally restricted to a 1-based inclusive line range".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "relativePath": { "type": "string", "description": "File path relative to the workspace root" },
                    "startLine": { "type": "integer", "description": "First line to include, 1-based (default 1)" },
                    "endLine": { "type": "integer", "description": "Last line to include, 1-based (default: end of file)" }
                },
                "required": ["relativePath"]
            }),
        }
    }

    fn permission_level(&self) -> PermissionLevel {
        PermissionLevel::Read
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard(dir: &std::path::Path) -> Arc<WorkspaceGuard> {
        Arc::new(WorkspaceGuard::new(dir.to_path_buf(), 10).unwrap())
    }

    #[tokio::test]
    async fn reads_whole_file_by_default() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "one\ntwo\nthree\n").unwrap();
        let tool = ReadFileTool::new(guard(dir.path()));
        let result = tool.execute(json!({"relativePath": "a.txt"})).await.unwrap();
        assert_eq!(result["totalLines"], 3);
        assert_eq!(result["linesShown"], 3);
    }

    #[tokio::test]
    async fn respects_start_and_end_line() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "a\nb\nc\nd\ne\n").unwrap();
        let tool = ReadFileTool::new(guard(dir.path()));
        let result = tool
            .execute(json!({"relativePath": "a.txt", "startLine": 2, "endLine": 3}))
            .await
            .unwrap();
        assert_eq!(result["linesShown"], 2);
        assert_eq!(result["startLine"], 2);
        let content = result["content"].as_str().unwrap();
        assert!(content.contains("b"));
        assert!(content.contains("c"));
        assert!(!content.contains("\td\n"));
    }
}
