//! LLM provider implementations for Tanren.
//!
//! All providers implement the `tanren_core::Provider` trait.

pub mod embedder;
pub mod openai_compat;
pub mod sse;

pub use embedder::ProviderEmbedder;
pub use openai_compat::OpenAiCompatProvider;
