//! Server-sent events decoding for OpenAI-style streaming completions.
//!
//! Bytes arrive in arbitrary pieces; [`SseDecoder`] buffers them into
//! complete lines and yields the payload of each `data:` line. Each payload
//! is mapped to a [`StreamChunk`] carrying the raw tool-call deltas; the
//! agent loop does the reassembly.

use serde::Deserialize;
use tanren_core::error::ProviderError;
use tanren_core::provider::{StreamChunk, ToolCallDelta, Usage};

/// One decoded SSE payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    Data(String),
    /// The `[DONE]` sentinel.
    Done,
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes, returning every event completed by them.
    ///
    /// Lines are split on raw bytes so a multi-byte UTF-8 character cut
    /// across two network reads is decoded intact.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);

        let mut events = Vec::new();
        while let Some(end) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=end).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(event) = parse_line(line.trim_end_matches(['\n', '\r'])) {
                events.push(event);
            }
        }
        events
    }

    /// Whatever is left once the byte stream has ended.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = String::from_utf8_lossy(&rest);
        parse_line(rest.trim())
    }
}

fn parse_line(line: &str) -> Option<SseEvent> {
    if line.is_empty() || line.starts_with(':') {
        return None;
    }
    let data = line.strip_prefix("data:")?.trim();
    if data == "[DONE]" {
        Some(SseEvent::Done)
    } else {
        Some(SseEvent::Data(data.to_string()))
    }
}

/// Map one `data:` payload to a fragment. `Ok(None)` for payloads that carry
/// nothing (e.g. a bare role announcement).
///
/// A payload that is not valid JSON ends the stream as interrupted; an
/// in-band `{"error": ...}` object becomes an `ApiError`.
pub fn parse_chunk(data: &str) -> Result<Option<StreamChunk>, ProviderError> {
    let response: StreamResponse = serde_json::from_str(data)
        .map_err(|e| ProviderError::StreamInterrupted(format!("malformed SSE payload: {e}")))?;

    if let Some(error) = response.error {
        return Err(error.into_provider_error());
    }

    let mut chunk = StreamChunk {
        usage: response.usage.map(|u| Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }),
        ..StreamChunk::default()
    };

    if let Some(choice) = response.choices.into_iter().next() {
        chunk.content = choice.delta.content.filter(|c| !c.is_empty());
        chunk.finish_reason = choice.finish_reason;
        chunk.tool_calls = choice
            .delta
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| {
                let (name, arguments) = match tc.function {
                    Some(f) => (f.name, f.arguments),
                    None => (None, None),
                };
                ToolCallDelta {
                    index: tc.index,
                    id: tc.id,
                    name,
                    arguments,
                }
            })
            .collect();
    }

    let empty = chunk.content.is_none()
        && chunk.tool_calls.is_empty()
        && chunk.finish_reason.is_none()
        && chunk.usage.is_none();
    Ok((!empty).then_some(chunk))
}

// --- Streaming wire types ---

#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<StreamUsage>,
    #[serde(default)]
    error: Option<StreamError>,
}

#[derive(Debug, Deserialize)]
struct StreamError {
    #[serde(default)]
    message: Option<String>,
    /// Numeric on llama.cpp, a string such as "context_length_exceeded" elsewhere.
    #[serde(default)]
    code: Option<serde_json::Value>,
}

impl StreamError {
    fn into_provider_error(self) -> ProviderError {
        let status_code = self
            .code
            .as_ref()
            .and_then(serde_json::Value::as_u64)
            .and_then(|c| u16::try_from(c).ok())
            .unwrap_or(500);
        let message = match (self.message, self.code) {
            (Some(message), _) => message,
            (None, Some(code)) => format!("provider error {code}"),
            (None, None) => "provider reported an error mid-stream".into(),
        };
        ProviderError::ApiError {
            status_code,
            message,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct StreamToolCallDelta {
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}
