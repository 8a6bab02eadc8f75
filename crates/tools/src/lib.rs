//! Reference tools for the agent loop.
//!
//! Both tools sit behind a [`PathGuard`]: `..` traversal is rejected and
//! sensitive locations (~/.ssh, ~/.gnupg, ...) are refused by default.

pub mod file_read;
pub mod list_dir;
pub mod path;

use tanren_core::tool::ToolRegistry;

pub use file_read::FileReadTool;
pub use list_dir::ListDirTool;
pub use path::{PathError, PathGuard};

/// A registry holding `file_read` and `list_dir` with the default guard.
pub fn default_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Box::new(FileReadTool::new()));
    registry.register(Box::new(ListDirTool::new()));
    registry
}
