//! The agent core of Tanren.
//!
//! One user turn flows through:
//!
//! 1. **Recall** relevant past turns from the memory store
//! 2. **Pin** them into the context window, next to the system prompt
//! 3. **Complete** against the provider, accumulating streamed fragments
//! 4. **If tool calls**: run them (concurrently by default), append the
//!    results in call order, and go back to step 3
//! 5. **Finish** with an answer, or stop early when the same call keeps
//!    failing, the provider errors, or the turn is canceled
//! 6. **Store** the completed turn back into memory

pub mod accumulate;
pub mod context;
pub mod loop_runner;
pub mod session;
pub mod stream_event;
pub mod stuck;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use accumulate::ResponseAccumulator;
pub use context::{BudgetInfo, CharRatioEstimator, ContextWindow, TokenEstimator};
pub use loop_runner::{AgentLoop, AgentTurn, TRUNCATION_MARKER, TurnOutcome};
pub use session::{Session, format_memory};
pub use stream_event::AgentStreamEvent;
pub use stuck::{RepeatTracker, StuckInfo, canonical_key};
