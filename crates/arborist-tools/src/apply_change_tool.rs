use anyhow::{bail, Context, Result};
use arborist_core::{PermissionLevel, Tool, ToolSchemaInfo};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::io::Write;
use std::sync::Arc;

use crate::workspace_guard::WorkspaceGuard;

/// `apply_change`: with an empty or absent `searchContent` it creates a new
/// file at `relativePath`; otherwise it replaces the unique occurrence of
/// `searchContent` with `replaceContent`, failing if the match isn't unique.
pub struct ApplyChangeTool {
    guard: Arc<WorkspaceGuard>,
}

impl ApplyChangeTool {
    pub fn new(guard: Arc<WorkspaceGuard>) -> Self {
        Self { guard }
    }

    async fn write_atomic(&self, path: &std::path::Path, content: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.context("Failed to create parent directories")?;
        }
        let parent = path.parent().unwrap_or_else(|| self.guard.root()).to_path_buf();
        let content = content.to_string();
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut tmp = tempfile::NamedTempFile::new_in(&parent).context("Failed to create temp file for atomic write")?;
            tmp.write_all(content.as_bytes())?;
            tmp.flush()?;
            tmp.persist(&path).context(format!("Failed to persist file: {:?}", path))?;
            Ok(())
        })
        .await
        .context("atomic write task panicked")??;
        Ok(())
    }
}

#[async_trait]
impl Tool for ApplyChangeTool {
    async fn execute(&self, input: Value) -> Result<Value> {
        let path_str = input["relativePath"]
            .as_str()
            .context("Missing required field 'relativePath'")?;
        let search_content = input["searchContent"].as_str().unwrap_or("");
        let replace_content = input["replaceContent"]
            .as_str()
            .context("Missing required field 'replaceContent'")?;

        let path = self.guard.resolve(path_str)?;

        if search_content.is_empty() {
            if path.exists() {
                bail!("File already exists, refusing to overwrite via an empty searchContent: {}", path_str);
            }
            self.write_atomic(&path, replace_content).await?;
            return Ok(json!({
                "relativePath": path_str,
                "created": true,
                "bytesWritten": replace_content.len(),
            }));
        }

        if !path.exists() {
            bail!("File not found: {}", path_str);
        }
        self.guard.check_size(&path).await?;

        let content = tokio::fs::read_to_string(&path).await.context("Failed to read file")?;
        let match_count = content.matches(search_content).count();

        if match_count == 0 {
            bail!("searchContent not found in file: {}", path_str);
        }
        if match_count > 1 {
            bail!("searchContent matched {} times in {} (must be unique)", match_count, path_str);
        }

        let new_content = content.replacen(search_content, replace_content, 1);
        self.write_atomic(&path, &new_content).await?;

        Ok(json!({
            "relativePath": path_str,
            "created": false,
            "replacements": 1,
        }))
    }

    fn name(&self) -> &str {
        "apply_change"
    }

    fn schema(&self) -> ToolSchemaInfo {
        ToolSchemaInfo {
            name: "apply_change".to_string(),
            description: "Create a file, or replace the unique occurrence of searchContent in an existing file".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "relativePath": { "type": "string", "description": "File path relative to the workspace root" },
                    "searchContent": { "type": "string", "description": "Exact text to find; empty or absent creates a new file" },
                    "replaceContent": { "type": "string", "description": "Replacement text, or full content for a new file" },
                    "description": { "type": "string", "description": "Human-readable description of the change" }
                },
                "required": ["relativePath", "replaceContent"]
            }),
        }
    }

    fn permission_level(&self) -> PermissionLevel {
        PermissionLevel::Write
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard(dir: &std::path::Path) -> Arc<WorkspaceGuard> {
        Arc::new(WorkspaceGuard::new(dir.to_path_buf(), 10).unwrap())
    }

    #[tokio::test]
    async fn empty_search_content_creates_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ApplyChangeTool::new(guard(dir.path()));
        let result = tool
            .execute(json!({"relativePath": "new.txt", "replaceContent": "hello"}))
            .await
            .unwrap();
        assert_eq!(result["created"], true);
        assert_eq!(std::fs::read_to_string(dir.path().join("new.txt")).unwrap(), "hello");
    }

    #[tokio::test]
    async fn empty_search_content_refuses_to_overwrite_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("existing.txt"), "already here").unwrap();
        let tool = ApplyChangeTool::new(guard(dir.path()));
        let result = tool
            .execute(json!({"relativePath": "existing.txt", "replaceContent": "overwritten"}))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn unique_match_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("code.rs"), "fn hello() {}\nfn world() {}\n").unwrap();
        let tool = ApplyChangeTool::new(guard(dir.path()));
        let result = tool
            .execute(json!({
                "relativePath": "code.rs",
                "searchContent": "fn hello() {}",
                "replaceContent": "fn greeting() {}"
            }))
            .await
            .unwrap();
        assert_eq!(result["replacements"], 1);
        let content = std::fs::read_to_string(dir.path().join("code.rs")).unwrap();
        assert!(content.contains("fn greeting() {}"));
        assert!(content.contains("fn world() {}"));
    }

    #[tokio::test]
    async fn ambiguous_match_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "aaa bbb aaa").unwrap();
        let tool = ApplyChangeTool::new(guard(dir.path()));
        let result = tool
            .execute(json!({"relativePath": "f.txt", "searchContent": "aaa", "replaceContent": "ccc"}))
            .await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("must be unique"));
    }

    #[tokio::test]
    async fn missing_match_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "hello").unwrap();
        let tool = ApplyChangeTool::new(guard(dir.path()));
        let result = tool
            .execute(json!({"relativePath": "f.txt", "searchContent": "nonexistent", "replaceContent": "x"}))
            .await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("not found"));
    }
}
