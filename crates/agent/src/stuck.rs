//! Repeat detection for the agent loop.
//!
//! Every executed tool call is recorded as a canonical key plus whether it
//! failed. The loop is stuck when the trailing run of records is the same
//! failing call `threshold` times in a row. A success, or any different
//! call, ends the run.

use std::collections::VecDeque;

use serde_json::Value;

/// `name` plus the arguments re-serialised with sorted keys and no
/// whitespace. Unparsable arguments fall back to the trimmed raw string.
pub fn canonical_key(name: &str, arguments: &str) -> String {
    match serde_json::from_str::<Value>(arguments) {
        Ok(value) => format!("{name}:{}", canonical_json(&value)),
        Err(_) => format!("{name}:{}", arguments.trim()),
    }
}

fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", Value::String(k.clone()), canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        other => other.to_string(),
    }
}

/// Details of a detected loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StuckInfo {
    pub tool: String,
    pub attempts: usize,
    pub explanation: String,
}

#[derive(Debug, Clone)]
struct Attempt {
    tool: String,
    key: String,
    failed: bool,
}

#[derive(Debug, Clone)]
pub struct RepeatTracker {
    threshold: usize,
    recent: VecDeque<Attempt>,
}

impl RepeatTracker {
    pub fn new(threshold: usize) -> Self {
        let threshold = threshold.max(1);
        Self {
            threshold,
            recent: VecDeque::with_capacity(threshold),
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Record the outcome of one executed call.
    pub fn record(&mut self, name: &str, arguments: &str, failed: bool) {
        if self.recent.len() == self.threshold {
            self.recent.pop_front();
        }
        self.recent.push_back(Attempt {
            tool: name.to_string(),
            key: canonical_key(name, arguments),
            failed,
        });
    }

    pub fn reset(&mut self) {
        self.recent.clear();
    }

    /// `Some` when the last `threshold` records are the same failing call.
    pub fn check(&self) -> Option<StuckInfo> {
        if self.recent.len() < self.threshold {
            return None;
        }
        let last = self.recent.back()?;
        let repeated = self
            .recent
            .iter()
            .all(|a| a.failed && a.key == last.key);
        if !repeated {
            return None;
        }

        Some(StuckInfo {
            tool: last.tool.clone(),
            attempts: self.threshold,
            explanation: format!(
                "I stopped because the `{}` tool failed {} times in a row with the same \
                 arguments. Retrying it unchanged will not help; please check the input or \
                 give me different instructions.",
                last.tool, self.threshold
            ),
        })
    }
}

impl Default for RepeatTracker {
    fn default() -> Self {
        Self::new(3)
    }
}
