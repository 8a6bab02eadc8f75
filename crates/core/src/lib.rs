//! # Tanren Core
//!
//! Domain types, traits, and error definitions for the Tanren agentic RAG
//! runtime. This crate has **no framework dependencies**: it defines the
//! domain model that the other crates implement against.
//!
//! ## Design Philosophy
//!
//! Every external capability is a trait here:
//! - [`Provider`] for completions (blocking or streamed), embeddings and tokenizing
//! - [`Tool`] for anything the model can invoke
//! - [`Embedder`] and [`MemoryBackend`] for long-term memory
//!
//! Implementations live in their own crates, and tests swap in scripted fakes.

pub mod error;
pub mod memory;
pub mod message;
pub mod provider;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{ContextError, Error, MemoryError, ProviderError, Result, ToolError};
pub use memory::{Embedder, MemoryBackend, MemoryRecord, ScoredRecord};
pub use message::{Message, MessageToolCall, Role, SessionId};
pub use provider::{Provider, ProviderRequest, ProviderResponse, StreamChunk, ToolCallDelta};
pub use tool::{Tool, ToolContext, ToolRegistry, ToolResult};
