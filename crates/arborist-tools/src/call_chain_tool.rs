use anyhow::{bail, Context, Result};
use arborist_core::{PermissionLevel, Tool, ToolSchemaInfo};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::workspace_guard::{is_hidden_dir, WorkspaceGuard};

const SOURCE_EXTENSIONS: &[&str] = &["rs", "ts", "tsx", "js", "jsx", "py", "go", "java"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Callers,
    Callees,
    Both,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct Occurrence {
    relative_path: String,
    line_number: usize,
    snippet: String,
}

/// `call_chain`: a best-effort textual index of who calls a method and what
/// it calls, found by scanning identifier occurrences rather than building a
/// real AST/symbol table. `callers` finds lines elsewhere in the workspace that
/// invoke `method`; `callees` finds identifiers invoked inside `method`'s own
/// definition. Depth only bounds how many hops `both` traversal takes before
/// it stops expanding the frontier.
pub struct CallChainTool {
    guard: Arc<WorkspaceGuard>,
}

impl CallChainTool {
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
                let is_source = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| SOURCE_EXTENSIONS.contains(&e))
                    .unwrap_or(false);
                if is_source {
                    out.push(path);
                }
            }
        }
    }

    async fn find_definition(&self, method: &str, files: &[PathBuf]) -> Result<Option<(PathBuf, String, usize)>> {
        let def_re = Regex::new(&format!(
            r"(?:fn|function|def)\s+{}\s*[\(<]",
            regex::escape(method)
        ))?;
        for path in files {
            let Ok(content) = tokio::fs::read_to_string(path).await else {
                continue;
            };
            if let Some(line_idx) = content.lines().position(|l| def_re.is_match(l)) {
                return Ok(Some((path.clone(), content, line_idx)));
            }
        }
        Ok(None)
    }

    fn extract_body(&self, content: &str, start_line: usize) -> String {
        let lines: Vec<&str> = content.lines().collect();
        let mut depth = 0i32;
        let mut started = false;
        let mut end = lines.len();
        for (idx, line) in lines.iter().enumerate().skip(start_line) {
            for ch in line.chars() {
                match ch {
                    '{' => {
                        depth += 1;
                        started = true;
                    }
                    '}' => depth -= 1,
                    _ => {}
                }
            }
            if started && depth <= 0 {
                end = idx + 1;
                break;
            }
        }
        lines[start_line..end].join("\n")
    }

    async fn find_callers(&self, method: &str, files: &[PathBuf], def_path: Option<&Path>, limit: usize) -> Result<Vec<Occurrence>> {
        let call_re = Regex::new(&format!(r"\b{}\s*\(", regex::escape(method)))?;
        let def_re = Regex::new(&format!(r"(?:fn|function|def)\s+{}\s*[\(<]", regex::escape(method)))?;
        let mut occurrences = Vec::new();
        for path in files {
            let Ok(content) = tokio::fs::read_to_string(path).await else {
                continue;
            };
            let rel = path
                .strip_prefix(self.guard.root())
                .unwrap_or(path)
                .to_string_lossy()
                .replace('\\', "/");
            for (idx, line) in content.lines().enumerate() {
                if def_re.is_match(line) {
                    continue;
                }
                if Some(path.as_path()) == def_path && idx == 0 {
                    continue;
                }
                if call_re.is_match(line) {
                    occurrences.push(Occurrence {
                        relative_path: rel.clone(),
                        line_number: idx + 1,
                        snippet: line.trim().to_string(),
                    });
                    if occurrences.len() >= limit {
                        return Ok(occurrences);
                    }
                }
            }
        }
        Ok(occurrences)
    }

    fn find_callees(&self, body: &str, method: &str, rel_path: &str, limit: usize) -> Result<Vec<Occurrence>> {
        let call_re = Regex::new(r"\b([A-Za-z_][A-Za-z0-9_]*)\s*\(")?;
        let mut seen = HashSet::new();
        let mut occurrences = Vec::new();
        for (idx, line) in body.lines().enumerate() {
            for cap in call_re.captures_iter(line) {
                let name = cap.get(1).unwrap().as_str();
                if name == method || is_control_keyword(name) || !seen.insert(name.to_string()) {
                    continue;
                }
                occurrences.push(Occurrence {
                    relative_path: rel_path.to_string(),
                    line_number: idx + 1,
                    snippet: line.trim().to_string(),
                });
                if occurrences.len() >= limit {
                    return Ok(occurrences);
                }
            }
        }
        Ok(occurrences)
    }
}

fn is_control_keyword(name: &str) -> bool {
    matches!(
        name,
        "if" | "while" | "for" | "match" | "loop" | "return" | "else" | "switch" | "catch" | "with"
    )
}

#[async_trait]
impl Tool for CallChainTool {
    async fn execute(&self, input: Value) -> Result<Value> {
        let method = input["method"]
            .as_str()
            .context("Missing required field 'method'")?;
        let direction_str = input["direction"].as_str().unwrap_or("both");
        let direction: Direction = serde_json::from_value(json!(direction_str))
            .with_context(|| format!("Invalid direction: {}", direction_str))?;
        let depth = input["depth"].as_u64().unwrap_or(1).clamp(1, 5) as usize;
        let include_source = input["includeSource"].as_bool().unwrap_or(false);
        let limit = 50usize;

        let mut files = Vec::new();
        self.walk(self.guard.root(), &mut files);

        let definition = self.find_definition(method, &files).await?;
        let (def_path, def_content, def_line) = match &definition {
            Some((p, c, l)) => (Some(p.as_path()), Some(c.as_str()), Some(*l)),
            None => (None, None, None),
        };

        let mut callers = Vec::new();
        let mut callees = Vec::new();

        if matches!(direction, Direction::Callers | Direction::Both) {
            let mut frontier = vec![method.to_string()];
            let mut visited = HashSet::new();
            for _ in 0..depth {
                let mut next_frontier = Vec::new();
                for name in &frontier {
                    if !visited.insert(name.clone()) {
                        continue;
                    }
                    let found = self.find_callers(name, &files, def_path, limit).await?;
                    for f in &found {
                        next_frontier.push(f.snippet.clone());
                    }
                    callers.extend(found);
                    if callers.len() >= limit {
                        break;
                    }
                }
                frontier = next_frontier;
                if callers.len() >= limit {
                    break;
                }
            }
            callers.truncate(limit);
        }

        if matches!(direction, Direction::Callees | Direction::Both) {
            if let (Some(content), Some(line)) = (def_content, def_line) {
                let body = self.extract_body(content, line);
                let rel = def_path
                    .map(|p| p.strip_prefix(self.guard.root()).unwrap_or(p).to_string_lossy().replace('\\', "/"))
                    .unwrap_or_default();
                callees = self.find_callees(&body, method, &rel, limit)?;
            }
        }

        if callers.is_empty() && callees.is_empty() && definition.is_none() {
            bail!("No definition or call sites found for method: {}", method);
        }

        let definition_json = definition.as_ref().map(|(p, _, l)| {
            let rel = p.strip_prefix(self.guard.root()).unwrap_or(p).to_string_lossy().replace('\\', "/");
            json!({ "relativePath": rel, "lineNumber": l + 1 })
        });

        let mut response = json!({
            "method": method,
            "direction": direction_str,
            "definition": definition_json,
            "callers": callers.iter().map(occurrence_json).collect::<Vec<_>>(),
            "callees": callees.iter().map(occurrence_json).collect::<Vec<_>>(),
        });

        if include_source {
            if let (Some(content), Some(line)) = (def_content, def_line) {
                response["source"] = json!(self.extract_body(content, line));
            }
        }

        Ok(response)
    }

    fn name(&self) -> &str {
        "call_chain"
    }

    fn schema(&self) -> ToolSchemaInfo {
        ToolSchemaInfo {
            name: "call_chain".to_string(),
            description: "Best-effort textual scan for callers and/or callees of a method name".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "method": { "type": "string", "description": "Method or function name to trace" },
                    "direction": { "type": "string", "enum": ["callers", "callees", "both"], "description": "Which direction to traverse (default both)" },
                    "depth": { "type": "integer", "description": "How many hops to expand when traversing callers (default 1, max 5)" },
                    "includeSource": { "type": "boolean", "description": "Include the definition's source text in the response" }
                },
                "required": ["method"]
            }),
        }
    }

    fn permission_level(&self) -> PermissionLevel {
        PermissionLevel::Read
    }
}

fn occurrence_json(o: &Occurrence) -> Value {
    json!({
        "relativePath": o.relative_path,
        "lineNumber": o.line_number,
        "snippet": o.snippet,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard(dir: &Path) -> Arc<WorkspaceGuard> {
        Arc::new(WorkspaceGuard::new(dir.to_path_buf(), 10).unwrap())
    }

    #[tokio::test]
    async fn finds_definition_and_callers() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("lib.rs"),
            "fn helper() {\n    println!(\"hi\");\n}\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("main.rs"),
            "fn main() {\n    helper();\n}\n",
        )
        .unwrap();
        let tool = CallChainTool::new(guard(dir.path()));
        let result = tool
            .execute(json!({"method": "helper", "direction": "callers"}))
            .await
            .unwrap();
        assert_eq!(result["definition"]["relativePath"], "lib.rs");
        let callers = result["callers"].as_array().unwrap();
        assert_eq!(callers.len(), 1);
        assert_eq!(callers[0]["relativePath"], "main.rs");
    }

    #[tokio::test]
    async fn finds_callees_inside_definition_body() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("lib.rs"),
            "fn outer() {\n    inner_one();\n    inner_two();\n}\n",
        )
        .unwrap();
        let tool = CallChainTool::new(guard(dir.path()));
        let result = tool
            .execute(json!({"method": "outer", "direction": "callees"}))
            .await
            .unwrap();
        let callees = result["callees"].as_array().unwrap();
        assert_eq!(callees.len(), 2);
    }

    #[tokio::test]
    async fn unknown_method_with_no_hits_errors() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("lib.rs"), "fn something_else() {}\n").unwrap();
        let tool = CallChainTool::new(guard(dir.path()));
        let result = tool.execute(json!({"method": "totally_absent"})).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn include_source_attaches_definition_text() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("lib.rs"), "fn tiny() {\n    1\n}\n").unwrap();
        let tool = CallChainTool::new(guard(dir.path()));
        let result = tool
            .execute(json!({"method": "tiny", "direction": "callees", "includeSource": true}))
            .await
            .unwrap();
        assert!(result["source"].as_str().unwrap().contains("fn tiny()"));
    }
}
