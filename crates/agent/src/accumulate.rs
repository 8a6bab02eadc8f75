//! Reassembly of streamed completion fragments.
//!
//! Text deltas are concatenated. Tool-call deltas are keyed by their
//! index: the id comes from the first fragment that carries a non-empty
//! one, while name and argument pieces are concatenated in arrival order.
//! Nothing here is acted on until [`ResponseAccumulator::finish`].

use std::collections::BTreeMap;

use tanren_core::message::{Message, MessageToolCall};
use tanren_core::provider::{ProviderResponse, StreamChunk, Usage};

#[derive(Debug, Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

#[derive(Debug, Default)]
pub struct ResponseAccumulator {
    content: String,
    calls: BTreeMap<u32, PartialCall>,
    finish_reason: Option<String>,
    usage: Option<Usage>,
    done: bool,
}

impl ResponseAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one fragment in. Returns the text delta it carried, if any.
    pub fn push(&mut self, chunk: StreamChunk) -> Option<String> {
        for delta in chunk.tool_calls {
            let call = self.calls.entry(delta.index).or_default();
            if call.id.is_empty()
                && let Some(id) = delta.id.filter(|id| !id.is_empty())
            {
                call.id = id;
            }
            if let Some(name) = delta.name {
                call.name.push_str(&name);
            }
            if let Some(arguments) = delta.arguments {
                call.arguments.push_str(&arguments);
            }
        }

        if chunk.finish_reason.is_some() {
            self.finish_reason = chunk.finish_reason;
        }
        if chunk.usage.is_some() {
            self.usage = chunk.usage;
        }
        self.done |= chunk.done;

        let text = chunk.content.filter(|c| !c.is_empty())?;
        self.content.push_str(&text);
        Some(text)
    }

    /// Whether the producer signalled the end of the response.
    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.calls.is_empty()
    }

    /// Build the final response. Calls that never received an id get
    /// `call_{index}`.
    pub fn finish(self, model: impl Into<String>) -> ProviderResponse {
        let tool_calls = self
            .calls
            .into_iter()
            .map(|(index, call)| {
                let id = if call.id.is_empty() {
                    format!("call_{index}")
                } else {
                    call.id
                };
                MessageToolCall::new(id, call.name, call.arguments)
            })
            .collect();

        ProviderResponse {
            message: Message::assistant_with_tool_calls(self.content, tool_calls),
            usage: self.usage,
            model: model.into(),
            finish_reason: self.finish_reason,
        }
    }
}
