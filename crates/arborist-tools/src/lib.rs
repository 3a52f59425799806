pub mod apply_change_tool;
pub mod call_chain_tool;
pub mod find_file_tool;
pub mod grep_file_tool;
pub mod read_file_tool;
pub mod workspace_guard;

pub use apply_change_tool::ApplyChangeTool;
pub use call_chain_tool::{CallChainTool, Direction as CallChainDirection};
pub use find_file_tool::FindFileTool;
pub use grep_file_tool::GrepFileTool;
pub use read_file_tool::ReadFileTool;
pub use workspace_guard::WorkspaceGuard;

use anyhow::Result;
use arborist_core::ToolRegistry;
use std::path::PathBuf;
use std::sync::Arc;

/// Register the filesystem/code-navigation tool catalog (read, apply_change,
/// grep, find, call_chain) on a registry, all scoped to `workspace`.
pub fn register_filesystem_tools(
    registry: &ToolRegistry,
    workspace: PathBuf,
    max_file_size_mb: u64,
) -> Result<()> {
    let guard = Arc::new(WorkspaceGuard::new(workspace, max_file_size_mb)?);
    registry.register(Arc::new(ReadFileTool::new(guard.clone())));
    registry.register(Arc::new(ApplyChangeTool::new(guard.clone())));
    registry.register(Arc::new(GrepFileTool::new(guard.clone())));
    registry.register(Arc::new(FindFileTool::new(guard.clone())));
    registry.register(Arc::new(CallChainTool::new(guard)));
    Ok(())
}
