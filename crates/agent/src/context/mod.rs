//! Context window management.
//!
//! | Part | Lifetime | Trim strategy |
//! |------|----------|---------------|
//! | Pinned (system prompt, memories, context files) | Until removed | Never trimmed |
//! | Summary of evicted conversation | Until replaced | Never trimmed, always the last pin |
//! | Windowed (conversation) | Sliding | Oldest evicted first |
//!
//! After every mutation `pinned + windowed <= ctx_size - response_budget`,
//! unless the pinned part alone is too large, which is reported as
//! `ContextError::PinnedExceedsBudget`.

pub mod token;
pub mod window;

pub use token::{CharRatioEstimator, TokenEstimator};
pub use window::{BudgetInfo, ContextWindow};
