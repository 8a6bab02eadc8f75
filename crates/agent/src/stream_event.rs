//! Agent-level streaming events.
//!
//! The loop pushes these to an optional unbounded channel while it runs, so
//! a caller can render progress without waiting for the turn to finish.

use serde::{Deserialize, Serialize};
use tanren_core::provider::Usage;

/// Events emitted by the agent loop.
///
/// - `iteration`  : a completion request is about to be sent
/// - `chunk`      : partial text from the model
/// - `tool_call`  : a tool call is being dispatched
/// - `tool_result`: a tool call produced its result
/// - `done`       : the turn ended
/// - `error`      : the turn failed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentStreamEvent {
    Iteration { iteration: u32 },

    Chunk { content: String },

    ToolCall {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    ToolResult {
        id: String,
        name: String,
        output: String,
        is_error: bool,
        duration_ms: u64,
    },

    Done {
        outcome: String,
        usage: Option<Usage>,
        iterations: u32,
        tool_executions: u32,
    },

    Error { message: String },
}

impl AgentStreamEvent {
    /// Wire name of this event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Iteration { .. } => "iteration",
            Self::Chunk { .. } => "chunk",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }
}
