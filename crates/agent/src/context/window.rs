//! The pinned + sliding context window.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::Serialize;
use tanren_config::ContextConfig;
use tanren_core::error::ContextError;
use tanren_core::message::{Message, Role};
use tracing::debug;

use super::token::{CharRatioEstimator, TokenEstimator};

/// What a pinned message is for, so slots can be replaced as a group.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PinSlot {
    Fixed,
    Memory,
    File(String),
    /// Always the last pin.
    Summary,
}

const SUMMARY_PREFIX: &str = "[Conversation summary] ";

#[derive(Debug, Clone)]
struct Entry {
    message: Message,
    tokens: usize,
}

/// Token accounting for a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BudgetInfo {
    pub ctx_size: usize,
    pub response_budget: usize,
    pub pinned_tokens: usize,
    /// Part of `pinned_tokens` taken by the conversation summary.
    pub summary_tokens: usize,
    pub windowed_tokens: usize,
    /// Tokens still free for conversation history.
    pub available: usize,
    pub pinned_count: usize,
    pub windowed_count: usize,
}

/// Message sequence bounded by a token budget.
///
/// Pinned messages always precede windowed ones in [`snapshot`](Self::snapshot)
/// and are never evicted. Windowed messages are evicted oldest-first
/// whenever the budget is exceeded. Eviction is silent; callers that want
/// to fold lost history into a summary compare snapshots and watch
/// [`needs_summary`](Self::needs_summary).
#[derive(Debug)]
pub struct ContextWindow {
    ctx_size: usize,
    response_budget: usize,
    estimator: Arc<dyn TokenEstimator>,
    pinned: Vec<(PinSlot, Entry)>,
    windowed: VecDeque<Entry>,
    evicted_since_summary: usize,
    pinned_tokens: usize,
    windowed_tokens: usize,
}

impl ContextWindow {
    pub fn new(ctx_size: usize, response_budget: usize) -> Self {
        Self {
            ctx_size,
            response_budget,
            estimator: Arc::new(CharRatioEstimator::default()),
            pinned: Vec::new(),
            windowed: VecDeque::new(),
            evicted_since_summary: 0,
            pinned_tokens: 0,
            windowed_tokens: 0,
        }
    }

    pub fn from_config(config: &ContextConfig) -> Self {
        Self::new(config.ctx_size, config.response_budget)
            .with_estimator(Arc::new(CharRatioEstimator::new(config.chars_per_token)))
    }

    /// Builder form of [`set_estimator`](Self::set_estimator) for an empty window.
    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    /// Tokens the pinned and windowed parts may use together.
    pub fn token_budget(&self) -> usize {
        self.ctx_size.saturating_sub(self.response_budget)
    }

    pub fn estimator(&self) -> Arc<dyn TokenEstimator> {
        Arc::clone(&self.estimator)
    }

    /// Install a different estimator, re-estimate everything and re-enforce
    /// the budget.
    pub fn set_estimator(
        &mut self,
        estimator: Arc<dyn TokenEstimator>,
    ) -> Result<(), ContextError> {
        self.estimator = estimator;
        for (_, entry) in &mut self.pinned {
            entry.tokens = self.estimator.estimate_message(&entry.message);
        }
        for entry in &mut self.windowed {
            entry.tokens = self.estimator.estimate_message(&entry.message);
        }
        self.pinned_tokens = self.pinned.iter().map(|(_, e)| e.tokens).sum();
        self.windowed_tokens = self.windowed.iter().map(|e| e.tokens).sum();
        self.enforce()
    }

    /// Append a pinned message.
    ///
    /// The message is kept even when the result is `PinnedExceedsBudget`,
    /// so the caller can inspect it and [`remove_pinned`](Self::remove_pinned).
    pub fn add_pinned(&mut self, message: Message) -> Result<(), ContextError> {
        self.push_pinned(PinSlot::Fixed, message);
        self.enforce()
    }

    /// Append a windowed message, evicting the oldest ones as needed.
    pub fn add_windowed(&mut self, message: Message) -> Result<(), ContextError> {
        let entry = self.entry(message);
        self.windowed_tokens += entry.tokens;
        self.windowed.push_back(entry);
        self.enforce()
    }

    /// Pin a file's content, replacing any earlier pin for the same path.
    pub fn add_context_file(
        &mut self,
        path: impl Into<String>,
        content: &str,
    ) -> Result<(), ContextError> {
        let path = path.into();
        self.remove_slots(|slot| matches!(slot, PinSlot::File(p) if *p == path));
        let message = Message::system(format!("[File: {path}]\n{content}"));
        self.push_pinned(PinSlot::File(path), message);
        self.enforce()
    }

    /// Returns whether a pin for `path` existed.
    pub fn remove_context_file(&mut self, path: &str) -> bool {
        self.remove_slots(|slot| matches!(slot, PinSlot::File(p) if p == path)) > 0
    }

    /// Swap the memory-injection pins for `messages`.
    pub fn replace_memories(&mut self, messages: Vec<Message>) -> Result<(), ContextError> {
        self.remove_slots(|slot| *slot == PinSlot::Memory);
        for message in messages {
            self.push_pinned(PinSlot::Memory, message);
        }
        self.enforce()
    }

    /// Pin a summary of earlier conversation after every other pin,
    /// replacing the previous one. An empty summary removes it.
    ///
    /// Resets [`needs_summary`](Self::needs_summary).
    pub fn set_summary(&mut self, summary: &str) -> Result<(), ContextError> {
        self.remove_slots(|slot| *slot == PinSlot::Summary);
        self.evicted_since_summary = 0;
        let summary = summary.trim();
        if !summary.is_empty() {
            self.push_pinned(
                PinSlot::Summary,
                Message::system(format!("{SUMMARY_PREFIX}{summary}")),
            );
        }
        self.enforce()
    }

    /// The current summary text, without its prefix.
    pub fn summary(&self) -> Option<&str> {
        self.pinned
            .iter()
            .find(|(slot, _)| *slot == PinSlot::Summary)
            .map(|(_, e)| {
                e.message
                    .content
                    .strip_prefix(SUMMARY_PREFIX)
                    .unwrap_or(&e.message.content)
            })
    }

    /// Whether messages were evicted since the summary was last set.
    pub fn needs_summary(&self) -> bool {
        self.evicted_since_summary > 0
    }

    /// Remove a pinned message by id.
    pub fn remove_pinned(&mut self, id: &str) -> bool {
        let before = self.pinned.len();
        self.pinned.retain(|(_, e)| e.message.id != id);
        self.recount_pinned();
        self.pinned.len() != before
    }

    /// Pinned then windowed messages, in order.
    pub fn snapshot(&self) -> Vec<Message> {
        self.pinned
            .iter()
            .map(|(_, e)| e.message.clone())
            .chain(self.windowed.iter().map(|e| e.message.clone()))
            .collect()
    }

    /// `ctx_size - pinned - response_budget`, clamped at zero.
    pub fn available_for_history(&self) -> usize {
        self.ctx_size
            .saturating_sub(self.pinned_tokens)
            .saturating_sub(self.response_budget)
    }

    pub fn budget(&self) -> BudgetInfo {
        BudgetInfo {
            ctx_size: self.ctx_size,
            response_budget: self.response_budget,
            pinned_tokens: self.pinned_tokens,
            summary_tokens: self
                .pinned
                .iter()
                .filter(|(slot, _)| *slot == PinSlot::Summary)
                .map(|(_, e)| e.tokens)
                .sum(),
            windowed_tokens: self.windowed_tokens,
            available: self.available_for_history(),
            pinned_count: self.pinned.len(),
            windowed_count: self.windowed.len(),
        }
    }

    pub fn total_tokens(&self) -> usize {
        self.pinned_tokens + self.windowed_tokens
    }

    pub fn pinned_len(&self) -> usize {
        self.pinned.len()
    }

    pub fn windowed_len(&self) -> usize {
        self.windowed.len()
    }

    /// Drop the conversation and its summary, keep the other pins.
    pub fn clear_history(&mut self) {
        self.windowed.clear();
        self.windowed_tokens = 0;
        self.evicted_since_summary = 0;
        self.remove_slots(|slot| *slot == PinSlot::Summary);
    }

    pub fn clear(&mut self) {
        self.clear_history();
        self.pinned.clear();
        self.pinned_tokens = 0;
    }

    fn entry(&self, message: Message) -> Entry {
        let tokens = self.estimator.estimate_message(&message);
        Entry { message, tokens }
    }

    fn push_pinned(&mut self, slot: PinSlot, message: Message) {
        let entry = self.entry(message);
        self.pinned_tokens += entry.tokens;
        let at = self
            .pinned
            .iter()
            .position(|(s, _)| *s == PinSlot::Summary)
            .unwrap_or(self.pinned.len());
        self.pinned.insert(at, (slot, entry));
    }

    fn remove_slots(&mut self, matches: impl Fn(&PinSlot) -> bool) -> usize {
        let before = self.pinned.len();
        self.pinned.retain(|(slot, _)| !matches(slot));
        self.recount_pinned();
        before - self.pinned.len()
    }

    fn recount_pinned(&mut self) {
        self.pinned_tokens = self.pinned.iter().map(|(_, e)| e.tokens).sum();
    }

    fn enforce(&mut self) -> Result<(), ContextError> {
        let budget = self.token_budget();
        let mut evicted = 0usize;

        while self.total_tokens() > budget {
            let Some(oldest) = self.windowed.pop_front() else {
                break;
            };
            self.windowed_tokens -= oldest.tokens;
            evicted += 1;

            // A tool result is meaningless once its originating call is gone.
            while self
                .windowed
                .front()
                .is_some_and(|e| e.message.role == Role::Tool)
            {
                if let Some(orphan) = self.windowed.pop_front() {
                    self.windowed_tokens -= orphan.tokens;
                    evicted += 1;
                }
            }
        }

        if evicted > 0 {
            self.evicted_since_summary += evicted;
            debug!(
                evicted,
                remaining = self.windowed.len(),
                tokens = self.total_tokens(),
                budget,
                "Evicted windowed messages"
            );
        }

        if self.pinned_tokens > budget {
            return Err(ContextError::PinnedExceedsBudget {
                pinned_tokens: self.pinned_tokens,
                budget,
            });
        }
        Ok(())
    }
}
