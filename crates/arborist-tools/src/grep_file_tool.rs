use anyhow::{Context, Result};
use arborist_core::{PermissionLevel, Tool, ToolSchemaInfo};
use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::workspace_guard::{is_hidden_dir, WorkspaceGuard};

const DEFAULT_LIMIT: usize = 200;

struct Match {
    path: String,
    line_number: usize,
    line: String,
    context_before: Vec<String>,
    context_after: Vec<String>,
}

/// `grep_file`: recursive pattern search across the workspace, with optional
/// path scoping, regex/literal mode, case sensitivity, and surrounding context.
pub struct GrepFileTool {
    guard: Arc<WorkspaceGuard>,
}

impl GrepFileTool {
    pub fn new(guard: Arc<WorkspaceGuard>) -> Self {
        Self { guard }
    }

    fn build_regex(&self, pattern: &str, is_regex: bool, case_sensitive: bool) -> Result<Regex> {
        let escaped;
        let source = if is_regex {
            pattern
        } else {
            escaped = regex::escape(pattern);
            &escaped
        };
        RegexBuilder::new(source)
            .case_insensitive(!case_sensitive)
            .build()
            .context("Invalid regex pattern")
    }

    fn walk(&self, dir: &Path, root: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
        let entries = match std::fs::read_dir(dir) {
            Ok(e) => e,
            Err(_) => return Ok(()),
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if path.is_dir() && is_hidden_dir(&name) {
                continue;
            }
            if path.is_dir() {
                self.walk(&path, root, out)?;
            } else if path.is_file() {
                out.push(path);
            }
        }
        Ok(())
    }

    async fn search_file(&self, path: &Path, regex: &Regex, context_lines: usize) -> Vec<Match> {
        let Ok(content) = tokio::fs::read_to_string(path).await else {
            return Vec::new();
        };
        let lines: Vec<&str> = content.lines().collect();
        let rel = path
            .strip_prefix(self.guard.root())
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/");

        let mut matches = Vec::new();
        for (idx, line) in lines.iter().enumerate() {
            if regex.is_match(line) {
                let before_start = idx.saturating_sub(context_lines);
                let after_end = (idx + context_lines + 1).min(lines.len());
                matches.push(Match {
                    path: rel.clone(),
                    line_number: idx + 1,
                    line: line.to_string(),
                    context_before: lines[before_start..idx].iter().map(|s| s.to_string()).collect(),
                    context_after: lines[idx + 1..after_end].iter().map(|s| s.to_string()).collect(),
                });
            }
        }
        matches
    }
}

#[async_trait]
impl Tool for GrepFileTool {
    async fn execute(&self, input: Value) -> Result<Value> {
        let pattern = input["pattern"]
            .as_str()
            .context("Missing required field 'pattern'")?;
        let is_regex = input["regex"].as_bool().unwrap_or(false);
        let case_sensitive = input["caseSensitive"].as_bool().unwrap_or(false);
        let context_lines = input["contextLines"].as_u64().unwrap_or(0) as usize;
        let limit = input["limit"].as_u64().unwrap_or(DEFAULT_LIMIT as u64) as usize;

        let regex = self.build_regex(pattern, is_regex, case_sensitive)?;

        let scan_root = match input["relativePath"].as_str() {
            Some(p) => self.guard.resolve(p)?,
            None => self.guard.root().to_path_buf(),
        };

        let mut files = Vec::new();
        if scan_root.is_file() {
            files.push(scan_root.clone());
        } else {
            self.walk(&scan_root, self.guard.root(), &mut files)?;
        }

        let mut matches = Vec::new();
        let mut truncated = false;
        for file in &files {
            if !WorkspaceGuard::is_text_file(file).await.unwrap_or(false) {
                continue;
            }
            let file_matches = self.search_file(file, &regex, context_lines).await;
            for m in file_matches {
                if matches.len() >= limit {
                    truncated = true;
                    break;
                }
                matches.push(m);
            }
            if truncated {
                break;
            }
        }

        let results: Vec<Value> = matches
            .iter()
            .map(|m| {
                json!({
                    "relativePath": m.path,
                    "lineNumber": m.line_number,
                    "line": m.line,
                    "contextBefore": m.context_before,
                    "contextAfter": m.context_after,
                })
            })
            .collect();

        Ok(json!({
            "matches": results,
            "matchCount": results.len(),
            "truncated": truncated,
        }))
    }

    fn name(&self) -> &str {
        "grep_file"
    }

    fn schema(&self) -> ToolSchemaInfo {
        ToolSchemaInfo {
            name: "grep_file".to_string(),
            description: "Search workspace file contents for a literal or regex pattern".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "pattern": { "type": "string", "description": "Literal text or regex to search for" },
                    "relativePath": { "type": "string", "description": "Restrict the search to this file or directory" },
                    "regex": { "type": "boolean", "description": "Treat pattern as a regular expression (default false)" },
                    "caseSensitive": { "type": "boolean", "description": "Case-sensitive match (default false)" },
                    "contextLines": { "type": "integer", "description": "Lines of context to include around each match" },
                    "limit": { "type": "integer", "description": "Maximum number of matches to return" }
                },
                "required": ["pattern"]
            }),
        }
    }

    fn permission_level(&self) -> PermissionLevel {
        PermissionLevel::Read
    }
}
