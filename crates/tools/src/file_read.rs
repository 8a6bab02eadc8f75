//! File read tool: read a UTF-8 file behind the path guard.

use async_trait::async_trait;
use tanren_core::error::ToolError;
use tanren_core::tool::{Tool, ToolContext, ToolResult};
use tracing::debug;

use crate::path::PathGuard;

pub struct FileReadTool {
    guard: PathGuard,
    /// Files larger than this are cut, with a note appended.
    max_bytes: usize,
}

impl FileReadTool {
    pub const DEFAULT_MAX_BYTES: usize = 256 * 1024;

    pub fn new() -> Self {
        Self::with_guard(PathGuard::default())
    }

    pub fn with_guard(guard: PathGuard) -> Self {
        Self {
            guard,
            max_bytes: Self::DEFAULT_MAX_BYTES,
        }
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes.max(1);
        self
    }
}

impl Default for FileReadTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for FileReadTool {
    fn name(&self) -> &str {
        "file_read"
    }

    fn description(&self) -> &str {
        "Read the contents of a text file at the given path."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path of the file to read"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(
        &self,
        ctx: &ToolContext,
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

        debug!(call_id = %ctx.call_id, path = %resolved.display(), "Reading file");

        let read = tokio::select! {
            _ = ctx.cancel.cancelled() => return Ok(ToolResult::error("file read canceled")),
            read = tokio::fs::read_to_string(&resolved) => read,
        };

        match read {
            Ok(mut content) => {
                if content.len() > self.max_bytes {
                    let mut cut = self.max_bytes;
                    while !content.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    content.truncate(cut);
                    content.push_str(&format!("\n[file truncated at {cut} bytes]"));
                }
                Ok(ToolResult::ok(content))
            }
            Err(e) => Ok(ToolResult::error(format!("Failed to read file {path}: {e}"))),
        }
    }
}
