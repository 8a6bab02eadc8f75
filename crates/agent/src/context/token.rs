//! Token estimation.
//!
//! The window manager never talks to a real tokenizer on the hot path. It
//! uses a character-ratio heuristic (default 3.5 characters per token,
//! rounded up), optionally calibrated once against the backend tokenizer.

use std::fmt;

use tanren_core::message::Message;
use tanren_core::provider::Provider;
use tracing::{debug, warn};

/// Fixed per-message overhead for role name and wire delimiters.
pub const MESSAGE_OVERHEAD: usize = 4;

/// Fixed overhead per tool call carried by an assistant message.
pub const TOOL_CALL_OVERHEAD: usize = 4;

/// Default characters-per-token ratio.
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 3.5;

/// Multi-sentence sample sent to the tokenizer during calibration.
const CALIBRATION_SAMPLE: &str = "The quick brown fox jumps over the lazy dog. \
    Pack my box with five dozen liquor jugs. \
    How vexingly quick daft zebras jump! \
    In 1969, Apollo 11 landed on the Moon; the crew returned safely on July 24th. \
    fn main() { println!(\"hello, world\"); }";

/// Deterministic text-to-token estimate.
pub trait TokenEstimator: Send + Sync + fmt::Debug {
    fn estimate(&self, text: &str) -> usize;

    /// Estimate for a whole message, including overheads.
    fn estimate_message(&self, message: &Message) -> usize {
        let mut tokens = MESSAGE_OVERHEAD + self.estimate(&message.content);
        for call in &message.tool_calls {
            tokens += TOOL_CALL_OVERHEAD + self.estimate(&call.name) + self.estimate(&call.arguments);
        }
        if let Some(id) = &message.tool_call_id {
            tokens += self.estimate(id);
        }
        tokens
    }

    fn estimate_messages(&self, messages: &[Message]) -> usize {
        messages.iter().map(|m| self.estimate_message(m)).sum()
    }
}

/// `ceil(len / chars_per_token)`, with `len` in bytes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CharRatioEstimator {
    chars_per_token: f64,
}

impl CharRatioEstimator {
    /// Non-finite or non-positive ratios fall back to the default.
    pub fn new(chars_per_token: f64) -> Self {
        let chars_per_token = if chars_per_token.is_finite() && chars_per_token > 0.0 {
            chars_per_token
        } else {
            DEFAULT_CHARS_PER_TOKEN
        };
        Self { chars_per_token }
    }

    pub fn chars_per_token(&self) -> f64 {
        self.chars_per_token
    }

    /// Derive the ratio from a measured sample. `None` when `tokens` is zero.
    pub fn from_sample(chars: usize, tokens: usize) -> Option<Self> {
        (tokens > 0 && chars > 0).then(|| Self::new(chars as f64 / tokens as f64))
    }

    /// Calibrate against the provider's tokenizer.
    ///
    /// Any failure leaves the default ratio in place and logs a warning.
    pub async fn calibrate(provider: &dyn Provider) -> Self {
        match provider.tokenize(CALIBRATION_SAMPLE).await {
            Ok(tokens) => match Self::from_sample(CALIBRATION_SAMPLE.len(), tokens) {
                Some(estimator) => {
                    debug!(
                        provider = provider.name(),
                        chars_per_token = estimator.chars_per_token,
                        "Calibrated token estimator"
                    );
                    estimator
                }
                None => {
                    warn!(
                        provider = provider.name(),
                        "Tokenizer returned zero tokens, keeping default ratio"
                    );
                    Self::default()
                }
            },
            Err(e) => {
                warn!(
                    provider = provider.name(),
                    error = %e,
                    "Token estimator calibration failed, keeping default ratio"
                );
                Self::default()
            }
        }
    }
}

impl Default for CharRatioEstimator {
    fn default() -> Self {
        Self {
            chars_per_token: DEFAULT_CHARS_PER_TOKEN,
        }
    }
}

impl TokenEstimator for CharRatioEstimator {
    fn estimate(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        (text.len() as f64 / self.chars_per_token).ceil() as usize
    }
}
