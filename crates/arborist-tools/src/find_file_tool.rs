use anyhow::{Context, Result};
use arborist_core::{PermissionLevel, Tool, ToolSchemaInfo};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::workspace_guard::{is_hidden_dir, WorkspaceGuard};

const DEFAULT_LIMIT: usize = 200;

/// `find_file`: recursive filename search under the workspace root.
/// `pattern` supports `*`/`?` glob wildcards; without wildcards it is matched
/// as a substring. `filePattern` further restricts results to paths matching
/// a second glob (e.g. `*.rs`), letting a caller combine "name contains X"
/// with "is a Rust file".
pub struct FindFileTool {
    guard: Arc<WorkspaceGuard>,
}

impl FindFileTool {
    pub fn new(guard: Arc<WorkspaceGuard>) -> Self {
        Self { guard }
    }

    fn walk(&self, dir: &Path, out: &mut Vec<PathBuf>) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if path.is_dir() {
                if is_hidden_dir(&name) {
                    continue;
                }
                self.walk(&path, out);
            } else if path.is_file() {
                out.push(path);
            }
        }
    }
}

/// Minimal glob match supporting `*` (any run of characters) and `?` (single character).
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let mut memo = vec![vec![None; text.len() + 1]; pattern.len() + 1];
    glob_match_inner(&pattern, &text, 0, 0, &mut memo)
}

fn glob_match_inner(p: &[char], t: &[char], pi: usize, ti: usize, memo: &mut Vec<Vec<Option<bool>>>) -> bool {
    if let Some(cached) = memo[pi][ti] {
        return cached;
    }
    let result = if pi == p.len() {
        ti == t.len()
    } else {
        match p[pi] {
            '*' => {
                (ti..=t.len()).any(|j| glob_match_inner(p, t, pi + 1, j, memo))
            }
            '?' => ti < t.len() && glob_match_inner(p, t, pi + 1, ti + 1, memo),
            c => ti < t.len() && t[ti].eq_ignore_ascii_case(&c) && glob_match_inner(p, t, pi + 1, ti + 1, memo),
        }
    };
    memo[pi][ti] = Some(result);
    result
}

fn matches_pattern(pattern: &str, candidate: &str) -> bool {
    if pattern.contains('*') || pattern.contains('?') {
        glob_match(pattern, candidate)
    } else {
        candidate.to_lowercase().contains(&pattern.to_lowercase())
    }
}

#[async_trait]
impl Tool for FindFileTool {
    async fn execute(&self, input: Value) -> Result<Value> {
        let pattern = input["pattern"]
            .as_str()
            .context("Missing required field 'pattern'")?;
        let file_pattern = input["filePattern"].as_str();
        let limit = input["limit"].as_u64().unwrap_or(DEFAULT_LIMIT as u64) as usize;

        let mut files = Vec::new();
        self.walk(self.guard.root(), &mut files);

        let mut results = Vec::new();
        let mut truncated = false;
        for path in &files {
            let rel = path
                .strip_prefix(self.guard.root())
                .unwrap_or(path)
                .to_string_lossy()
                .replace('\\', "/");
            let file_name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();

            if !matches_pattern(pattern, &rel) && !matches_pattern(pattern, &file_name) {
                continue;
            }
            if let Some(fp) = file_pattern {
                if !matches_pattern(fp, &file_name) {
                    continue;
                }
            }

            if results.len() >= limit {
                truncated = true;
                break;
            }
            results.push(json!({ "relativePath": rel }));
        }

        Ok(json!({
            "files": results,
            "matchCount": results.len(),
            "truncated": truncated,
        }))
    }

    fn name(&self) -> &str {
        "find_file"
    }

    fn schema(&self) -> ToolSchemaInfo {
        ToolSchemaInfo {
            name: "find_file".to_string(),
            description: "Find files by name or glob pattern under the workspace root".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "pattern": { "type": "string", "description": "Substring or glob (*, ?) to match against file name/path" },
                    "filePattern": { "type": "string", "description": "Additional glob restricting matches by file name, e.g. '*.rs'" },
                    "limit": { "type": "integer", "description": "Maximum number of results to return" }
                },
                "required": ["pattern"]
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

    fn guard(dir: &Path) -> Arc<WorkspaceGuard> {
        Arc::new(WorkspaceGuard::new(dir.to_path_buf(), 10).unwrap())
    }

    #[tokio::test]
    async fn substring_pattern_matches_file_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("agent.rs"), "").unwrap();
        std::fs::write(dir.path().join("other.rs"), "").unwrap();
        let tool = FindFileTool::new(guard(dir.path()));
        let result = tool.execute(json!({"pattern": "agent"})).await.unwrap();
        assert_eq!(result["matchCount"], 1);
    }

    #[tokio::test]
    async fn glob_pattern_matches_nested_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src/tools")).unwrap();
        std::fs::write(dir.path().join("src/tools/grep.rs"), "").unwrap();
        std::fs::write(dir.path().join("README.md"), "").unwrap();
        let tool = FindFileTool::new(guard(dir.path()));
        let result = tool.execute(json!({"pattern": "*.rs"})).await.unwrap();
        assert_eq!(result["matchCount"], 1);
    }

    #[tokio::test]
    async fn file_pattern_further_restricts_matches() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tool_config.rs"), "").unwrap();
        std::fs::write(dir.path().join("tool_config.toml"), "").unwrap();
        let tool = FindFileTool::new(guard(dir.path()));
        let result = tool
            .execute(json!({"pattern": "config", "filePattern": "*.toml"}))
            .await
            .unwrap();
        assert_eq!(result["matchCount"], 1);
    }

    #[tokio::test]
    async fn hidden_directories_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".git/config"), "").unwrap();
        let tool = FindFileTool::new(guard(dir.path()));
        let result = tool.execute(json!({"pattern": "config"})).await.unwrap();
        assert_eq!(result["matchCount"], 0);
    }
}
