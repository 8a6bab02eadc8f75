//! Scripted providers and tools shared by the unit tests.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tanren_core::error::{ProviderError, ToolError};
use tanren_core::message::{Message, MessageToolCall};
use tanren_core::provider::{
    ChunkReceiver, Provider, ProviderRequest, ProviderResponse, StreamChunk, ToolCallDelta, Usage,
};
use tanren_core::tool::{Tool, ToolContext, ToolResult};
use tokio_util::sync::CancellationToken;

/// A provider that returns a sequence of scripted responses.
///
/// Each call to `complete` returns the next response in the queue; once the
/// script is exhausted every call fails with a 500.
pub struct SequentialMockProvider {
    responses: Mutex<Vec<ProviderResponse>>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl SequentialMockProvider {
    pub fn new(responses: Vec<ProviderResponse>) -> Self {
        Self {
            responses: Mutex::new(responses),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn single_text(text: &str) -> Self {
        Self::new(vec![make_text_response(text)])
    }

    /// Tool calls first, then a final answer.
    pub fn tool_then_answer(tool_calls: Vec<MessageToolCall>, thought: &str, answer: &str) -> Self {
        Self::new(vec![
            make_tool_call_response(tool_calls, thought),
            make_text_response(answer),
        ])
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Requests received so far, in order.
    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for SequentialMockProvider {
    fn name(&self) -> &str {
        "sequential_mock"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let mut requests = self.requests.lock().unwrap();
        let call = requests.len();
        requests.push(request);

        self.responses
            .lock()
            .unwrap()
            .get(call)
            .cloned()
            .ok_or_else(|| ProviderError::ApiError {
                status_code: 500,
                message: format!("script exhausted at call #{call}"),
            })
    }
}

/// Replays scripted fragment sequences through `stream`, one per call.
/// The producer does not add a final fragment on its own.
pub struct ScriptedStreamProvider {
    scripts: Mutex<Vec<Vec<StreamChunk>>>,
}

impl ScriptedStreamProvider {
    pub fn new(mut scripts: Vec<Vec<StreamChunk>>) -> Self {
        scripts.reverse();
        Self {
            scripts: Mutex::new(scripts),
        }
    }
}

#[async_trait]
impl Provider for ScriptedStreamProvider {
    fn name(&self) -> &str {
        "scripted_stream"
    }

    async fn complete(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        Err(ProviderError::NotConfigured("streaming only".into()))
    }

    async fn stream(&self, _request: ProviderRequest) -> Result<ChunkReceiver, ProviderError> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop()
            .ok_or_else(|| ProviderError::NotConfigured("script exhausted".into()))?;

        let (tx, rx) = tokio::sync::mpsc::channel(4);
        tokio::spawn(async move {
            for chunk in script {
                if tx.send(Ok(chunk)).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }
}

/// Sends one fragment and then waits for the receiver to go away.
#[derive(Default)]
pub struct HangingStreamProvider {
    pub released: Arc<AtomicBool>,
}

#[async_trait]
impl Provider for HangingStreamProvider {
    fn name(&self) -> &str {
        "hanging_stream"
    }

    async fn complete(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        Err(ProviderError::NotConfigured("streaming only".into()))
    }

    async fn stream(&self, _request: ProviderRequest) -> Result<ChunkReceiver, ProviderError> {
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        let released = self.released.clone();
        tokio::spawn(async move {
            let _ = tx.send(Ok(StreamChunk::text("thinking"))).await;
            tx.closed().await;
            released.store(true, Ordering::SeqCst);
        });
        Ok(rx)
    }
}

/// Cancels the token while answering; the first call requests tools, later
/// calls answer with text.
pub struct CancelOnCompleteProvider {
    token: CancellationToken,
    calls: Vec<MessageToolCall>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl CancelOnCompleteProvider {
    pub fn new(token: CancellationToken, calls: Vec<MessageToolCall>) -> Self {
        Self {
            token,
            calls,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for CancelOnCompleteProvider {
    fn name(&self) -> &str {
        "cancel_on_complete"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let mut requests = self.requests.lock().unwrap();
        requests.push(request);
        if requests.len() == 1 {
            self.token.cancel();
            Ok(make_tool_call_response(self.calls.clone(), ""))
        } else {
            Ok(make_text_response("done"))
        }
    }
}

/// A completion that never arrives.
pub struct PendingProvider;

#[async_trait]
impl Provider for PendingProvider {
    fn name(&self) -> &str {
        "pending"
    }

    async fn complete(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        std::future::pending().await
    }
}

fn usage() -> Option<Usage> {
    Some(Usage {
        prompt_tokens: 10,
        completion_tokens: 5,
        total_tokens: 15,
    })
}

pub fn make_text_response(text: &str) -> ProviderResponse {
    ProviderResponse {
        message: Message::assistant(text),
        usage: usage(),
        model: "mock-model".into(),
        finish_reason: Some("stop".into()),
    }
}

pub fn make_tool_call_response(tool_calls: Vec<MessageToolCall>, thought: &str) -> ProviderResponse {
    ProviderResponse {
        message: Message::assistant_with_tool_calls(thought, tool_calls),
        usage: usage(),
        model: "mock-model".into(),
        finish_reason: Some("tool_calls".into()),
    }
}

pub fn make_tool_call(id: &str, name: &str, args: serde_json::Value) -> MessageToolCall {
    MessageToolCall::new(id, name, args.to_string())
}

pub fn tool_delta(
    index: u32,
    id: Option<&str>,
    name: Option<&str>,
    arguments: Option<&str>,
) -> StreamChunk {
    StreamChunk {
        tool_calls: vec![ToolCallDelta {
            index,
            id: id.map(Into::into),
            name: name.map(Into::into),
            arguments: arguments.map(Into::into),
        }],
        ..StreamChunk::default()
    }
}

fn schema() -> serde_json::Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

fn text_arg(arguments: &serde_json::Value) -> String {
    match &arguments["text"] {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Returns its `text` argument.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the text argument"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        schema()
    }

    async fn execute(
        &self,
        _ctx: &ToolContext,
        arguments: serde_json::Value,
    ) -> Result<ToolResult, ToolError> {
        Ok(ToolResult::ok(text_arg(&arguments)))
    }
}

enum FailMode {
    ErrorResult,
    InvalidArguments,
    ExecutionFailed,
}

/// Fails every call in a configurable way.
pub struct FailTool(FailMode);

impl FailTool {
    pub fn error_result() -> Self {
        Self(FailMode::ErrorResult)
    }

    pub fn invalid_arguments() -> Self {
        Self(FailMode::InvalidArguments)
    }

    pub fn execution_failed() -> Self {
        Self(FailMode::ExecutionFailed)
    }
}

#[async_trait]
impl Tool for FailTool {
    fn name(&self) -> &str {
        "fail"
    }

    fn description(&self) -> &str {
        "Always fails"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        schema()
    }

    async fn execute(
        &self,
        _ctx: &ToolContext,
        _arguments: serde_json::Value,
    ) -> Result<ToolResult, ToolError> {
        match self.0 {
            FailMode::ErrorResult => Ok(ToolResult::error("No such file or directory")),
            FailMode::InvalidArguments => Err(ToolError::InvalidArguments("bad input".into())),
            FailMode::ExecutionFailed => Err(ToolError::ExecutionFailed {
                tool_name: "fail".into(),
                reason: "backend unavailable".into(),
            }),
        }
    }
}

/// Sleeps `ms` and returns `text`, tracking peak concurrency.
#[derive(Default)]
pub struct SleepTool {
    active: Arc<AtomicUsize>,
    pub peak: Arc<AtomicUsize>,
}

#[async_trait]
impl Tool for SleepTool {
    fn name(&self) -> &str {
        "sleep"
    }

    fn description(&self) -> &str {
        "Sleep, then return text"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        schema()
    }

    async fn execute(
        &self,
        _ctx: &ToolContext,
        arguments: serde_json::Value,
    ) -> Result<ToolResult, ToolError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let ms = arguments["ms"].as_u64().unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(ToolResult::ok(text_arg(&arguments)))
    }
}

/// Cancels the turn from inside a tool call.
pub struct CancelingTool {
    token: CancellationToken,
}

impl CancelingTool {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }
}

#[async_trait]
impl Tool for CancelingTool {
    fn name(&self) -> &str {
        "cancel"
    }

    fn description(&self) -> &str {
        "Cancel the surrounding turn"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        schema()
    }

    async fn execute(
        &self,
        ctx: &ToolContext,
        _arguments: serde_json::Value,
    ) -> Result<ToolResult, ToolError> {
        self.token.cancel();
        assert!(ctx.cancel.is_cancelled());
        Ok(ToolResult::ok("canceled"))
    }
}
