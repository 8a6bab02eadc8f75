//! Directory listing tool.

use async_trait::async_trait;
use tanren_core::error::ToolError;
use tanren_core::tool::{Tool, ToolContext, ToolResult};

use crate::path::PathGuard;

pub struct ListDirTool {
    guard: PathGuard,
    max_entries: usize,
}

impl ListDirTool {
    pub fn new() -> Self {
        Self::with_guard(PathGuard::default())
    }

    pub fn with_guard(guard: PathGuard) -> Self {
        Self {
            guard,
            max_entries: 500,
        }
    }
}

impl Default for ListDirTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List the entries of a directory. Subdirectories end with '/'."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory to list"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(
        &self,
        _ctx: &ToolContext,
        arguments: serde_json::Value,
    ) -> Result<ToolResult, ToolError> {
        let path = arguments["path"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'path' argument".into()))?;

        let resolved = self
            .guard
            .check(path)
            .map_err(|e| ToolError::PermissionDenied {
                tool_name: self.name().into(),
                reason: e.to_string(),
            })?;

        let mut dir = match tokio::fs::read_dir(&resolved).await {
            Ok(dir) => dir,
            Err(e) => {
                return Ok(ToolResult::error(format!(
                    "Failed to list directory {path}: {e}"
                )));
            }
        };

        let mut entries = Vec::new();
        loop {
            match dir.next_entry().await {
                Ok(Some(entry)) => {
                    let mut name = entry.file_name().to_string_lossy().into_owned();
                    if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                        name.push('/');
                    }
                    entries.push(name);
                }
                Ok(None) => break,
                Err(e) => {
                    return Ok(ToolResult::error(format!(
                        "Failed to list directory {path}: {e}"
                    )));
                }
            }
        }
        entries.sort();

        let total = entries.len();
        entries.truncate(self.max_entries);
        let mut output = entries.join("\n");
        if total > self.max_entries {
            output.push_str(&format!("\n... {} more entries", total - self.max_entries));
        }

        Ok(ToolResult {
            output,
            is_error: false,
            data: Some(serde_json::json!({ "count": total })),
        })
    }
}
