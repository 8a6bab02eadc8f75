//! Memory store implementations for Tanren.
//!
//! [`HybridMemory`] is the production store: records ranked by a weighted
//! mix of embedding similarity and keyword overlap, optionally mirrored to
//! a JSONL file. [`NoopMemory`] turns memory off.

pub mod hash_embedder;
pub mod hybrid;
pub mod jsonl;
pub mod noop;
pub mod vector;

pub use hash_embedder::HashEmbedder;
pub use hybrid::HybridMemory;
pub use noop::NoopMemory;
pub use vector::{ScoreWeights, cosine_similarity, keyword_overlap, semantic_similarity};
