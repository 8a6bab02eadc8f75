//! The agent loop: completion → tool calls → completion, until the model
//! answers, repeats a failing call, errors, or the turn is canceled.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tanren_config::AppConfig;
use tanren_core::error::{Error, ProviderError, ToolError};
use tanren_core::message::{Message, MessageToolCall, Role};
use tanren_core::provider::{Provider, ProviderRequest, ProviderResponse, ToolDefinition, Usage};
use tanren_core::tool::{ToolContext, ToolRegistry, ToolResult};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::accumulate::ResponseAccumulator;
use crate::context::token::{CharRatioEstimator, TokenEstimator};
use crate::stream_event::AgentStreamEvent;
use crate::stuck::RepeatTracker;

/// Appended to tool results cut down by the context ceiling.
pub const TRUNCATION_MARKER: &str = "[truncated to fit context window]";

/// Bytes of a truncated tool result that are kept.
const TRUNCATED_PREFIX_BYTES: usize = 200;

/// How a turn ended.
#[derive(Debug)]
pub enum TurnOutcome {
    /// The model answered without requesting tools.
    Completed { answer: String },

    /// The same call kept failing; the explanation was appended to the
    /// message sequence.
    Stuck {
        tool: String,
        attempts: usize,
        explanation: String,
    },

    /// Completion error, tool infrastructure error or iteration limit.
    Failed(Error),

    Canceled,
}

impl TurnOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed { .. } => "completed",
            Self::Stuck { .. } => "stuck",
            Self::Failed(_) => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// Everything a run produced.
#[derive(Debug)]
pub struct AgentTurn {
    /// The caller's messages followed by everything appended during the run.
    pub messages: Vec<Message>,

    /// Index of the first message appended by the run.
    pub appended_from: usize,

    pub outcome: TurnOutcome,

    /// Completion requests sent.
    pub completions: u32,

    /// Tool invocations that actually reached a tool.
    pub tool_executions: u32,

    pub iterations: u32,

    pub usage: Usage,
}

impl AgentTurn {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            appended_from: messages.len(),
            messages,
            outcome: TurnOutcome::Canceled,
            completions: 0,
            tool_executions: 0,
            iterations: 0,
            usage: Usage::default(),
        }
    }

    /// A turn that failed before the loop started.
    pub fn failed(messages: Vec<Message>, error: Error) -> Self {
        let mut turn = Self::new(messages);
        turn.outcome = TurnOutcome::Failed(error);
        turn
    }

    /// Messages appended during the run.
    pub fn new_messages(&self) -> &[Message] {
        &self.messages[self.appended_from..]
    }

    pub fn answer(&self) -> Option<&str> {
        match &self.outcome {
            TurnOutcome::Completed { answer } => Some(answer),
            _ => None,
        }
    }
}

/// Result of dispatching one tool call.
struct CallReport {
    result: ToolResult,
    /// Whether a tool actually ran (unknown tools and bad arguments don't).
    executed: bool,
    fatal: Option<ToolError>,
    duration_ms: u64,
}

impl CallReport {
    fn rejected(message: String) -> Self {
        Self {
            result: ToolResult::error(message),
            executed: false,
            fatal: None,
            duration_ms: 0,
        }
    }
}

/// Drives one turn against a completion provider and a tool registry.
pub struct AgentLoop {
    provider: Arc<dyn Provider>,

    tools: Arc<ToolRegistry>,

    model: String,

    temperature: f32,

    /// Max tokens per completion
    max_tokens: Option<u32>,

    /// Completion requests allowed per turn
    max_iterations: u32,

    stuck_threshold: usize,

    /// Run the calls of one response concurrently
    parallel_tools: bool,

    streaming: bool,

    /// Clear assistant text that accompanies tool calls
    strip_narration: bool,

    tool_timeout: Option<Duration>,

    /// Token ceiling for the request sequence; large tool results are cut
    /// to fit when it is exceeded.
    context_ceiling: Option<usize>,

    estimator: Arc<dyn TokenEstimator>,

    events: Option<mpsc::UnboundedSender<AgentStreamEvent>>,
}

impl AgentLoop {
    pub fn new(
        provider: Arc<dyn Provider>,
        tools: Arc<ToolRegistry>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            tools,
            model: model.into(),
            temperature: 0.7,
            max_tokens: None,
            max_iterations: 20,
            stuck_threshold: 3,
            parallel_tools: true,
            streaming: false,
            strip_narration: true,
            tool_timeout: None,
            context_ceiling: None,
            estimator: Arc::new(CharRatioEstimator::default()),
            events: None,
        }
    }

    /// Build a loop from the `provider` and `agent` config sections.
    pub fn from_config(
        provider: Arc<dyn Provider>,
        tools: Arc<ToolRegistry>,
        config: &AppConfig,
    ) -> Self {
        let agent = &config.agent;
        let mut this = Self::new(provider, tools, config.provider.model.clone())
            .with_temperature(agent.temperature)
            .with_max_tokens(agent.max_response_tokens)
            .with_max_iterations(agent.max_iterations)
            .with_stuck_threshold(agent.stuck_threshold)
            .with_parallel_tools(agent.parallel_tools)
            .with_streaming(config.provider.stream)
            .with_strip_narration(agent.strip_narration);
        if let Some(secs) = agent.tool_timeout_secs {
            this = this.with_tool_timeout(Duration::from_secs(secs));
        }
        this
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }

    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }

    /// Consecutive identical failing calls before the turn is stopped.
    pub fn with_stuck_threshold(mut self, threshold: usize) -> Self {
        self.stuck_threshold = threshold.max(1);
        self
    }

    pub fn with_parallel_tools(mut self, enabled: bool) -> Self {
        self.parallel_tools = enabled;
        self
    }

    /// Use `Provider::stream` and accumulate fragments instead of `complete`.
    pub fn with_streaming(mut self, enabled: bool) -> Self {
        self.streaming = enabled;
        self
    }

    pub fn with_strip_narration(mut self, enabled: bool) -> Self {
        self.strip_narration = enabled;
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = Some(timeout);
        self
    }

    pub fn with_context_ceiling(
        mut self,
        ceiling: usize,
        estimator: Arc<dyn TokenEstimator>,
    ) -> Self {
        self.context_ceiling = Some(ceiling);
        self.estimator = estimator;
        self
    }

    /// Send [`AgentStreamEvent`]s to `sender` while running.
    pub fn with_events(mut self, sender: mpsc::UnboundedSender<AgentStreamEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Run one turn over `messages`.
    ///
    /// Never panics and never returns early with `Err`: every ending,
    /// including failures, is reported through [`AgentTurn::outcome`].
    pub async fn run(&self, messages: Vec<Message>, cancel: &CancellationToken) -> AgentTurn {
        let mut turn = AgentTurn::new(messages);
        let mut tracker = RepeatTracker::new(self.stuck_threshold);
        let definitions = self.tools.definitions();

        info!(
            model = %self.model,
            messages = turn.messages.len(),
            tools = definitions.len(),
            streaming = self.streaming,
            "Starting agent turn"
        );

        turn.outcome = loop {
            // awaiting_completion
            if cancel.is_cancelled() {
                break TurnOutcome::Canceled;
            }
            if turn.iterations >= self.max_iterations {
                warn!(max = self.max_iterations, "Iteration limit reached");
                break TurnOutcome::Failed(Error::IterationLimit {
                    max: self.max_iterations,
                });
            }
            turn.iterations += 1;
            debug!(iteration = turn.iterations, state = "awaiting_completion", "Agent loop iteration");
            self.emit(AgentStreamEvent::Iteration {
                iteration: turn.iterations,
            });

            let request = self.request(&turn.messages, &definitions);
            turn.completions += 1;
            let response = match self.complete(request, cancel).await {
                Ok(Some(response)) => response,
                Ok(None) => break TurnOutcome::Canceled,
                Err(e) => {
                    warn!(error = %e, "Completion failed");
                    break TurnOutcome::Failed(e.into());
                }
            };
            if let Some(usage) = &response.usage {
                turn.usage.add(usage);
            }

            let mut message = response.message;
            if !message.has_tool_calls() {
                let answer = message.content.clone();
                turn.messages.push(message);
                break TurnOutcome::Completed { answer };
            }

            // awaiting_tool_results
            if self.strip_narration {
                message.content.clear();
            }
            let calls = message.tool_calls.clone();
            turn.messages.push(message);

            if cancel.is_cancelled() {
                // Every tool call needs a result before the next request.
                for call in &calls {
                    turn.messages
                        .push(Message::tool_result(call.id.clone(), not_run(&call.name)));
                }
                break TurnOutcome::Canceled;
            }

            debug!(
                iteration = turn.iterations,
                state = "awaiting_tool_results",
                calls = calls.len(),
                parallel = self.parallel_tools,
                "Executing tool calls"
            );
            let reports = self.execute_batch(&calls, cancel).await;

            let mut fatal = None;
            for (call, report) in calls.iter().zip(reports) {
                tracker.record(&call.name, &call.arguments, report.result.is_error || report.fatal.is_some());
                if report.executed {
                    turn.tool_executions += 1;
                }
                self.emit(AgentStreamEvent::ToolResult {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    output: report.result.output.clone(),
                    is_error: report.result.is_error,
                    duration_ms: report.duration_ms,
                });
                turn.messages
                    .push(Message::tool_result(call.id.clone(), report.result.output));
                if let Some(e) = report.fatal {
                    fatal.get_or_insert(e);
                }
            }

            if let Some(e) = fatal {
                warn!(error = %e, "Tool infrastructure failure");
                break TurnOutcome::Failed(e.into());
            }
            if cancel.is_cancelled() {
                break TurnOutcome::Canceled;
            }
            if let Some(info) = tracker.check() {
                warn!(
                    tool = %info.tool,
                    attempts = info.attempts,
                    "Repeated failing tool call, stopping turn"
                );
                turn.messages.push(Message::assistant(info.explanation.clone()));
                break TurnOutcome::Stuck {
                    tool: info.tool,
                    attempts: info.attempts,
                    explanation: info.explanation,
                };
            }
        };

        if let TurnOutcome::Failed(e) = &turn.outcome {
            self.emit(AgentStreamEvent::Error {
                message: e.to_string(),
            });
        }
        self.emit(AgentStreamEvent::Done {
            outcome: turn.outcome.label().to_string(),
            usage: (turn.usage != Usage::default()).then_some(turn.usage),
            iterations: turn.iterations,
            tool_executions: turn.tool_executions,
        });

        info!(
            outcome = turn.outcome.label(),
            completions = turn.completions,
            tool_executions = turn.tool_executions,
            total_tokens = turn.usage.total_tokens,
            "Agent turn finished"
        );
        turn
    }

    fn request(&self, messages: &[Message], definitions: &[ToolDefinition]) -> ProviderRequest {
        let mut messages = messages.to_vec();
        if let Some(ceiling) = self.context_ceiling {
            fit_tool_results(&mut messages, ceiling, self.estimator.as_ref());
        }
        ProviderRequest {
            model: self.model.clone(),
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            tools: definitions.to_vec(),
            stream: self.streaming,
            stop: vec![],
        }
    }

    /// One completion. `Ok(None)` means the token fired first; the pending
    /// request future or stream receiver is dropped, which releases the
    /// connection.
    async fn complete(
        &self,
        request: ProviderRequest,
        cancel: &CancellationToken,
    ) -> Result<Option<ProviderResponse>, ProviderError> {
        if !self.streaming {
            return tokio::select! {
                biased;
                _ = cancel.cancelled() => Ok(None),
                response = self.provider.complete(request) => response.map(Some),
            };
        }

        let mut rx = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            rx = self.provider.stream(request) => rx?,
        };

        let mut accumulator = ResponseAccumulator::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                next = rx.recv() => next,
            };
            match next {
                Some(Ok(chunk)) => {
                    if let Some(text) = accumulator.push(chunk) {
                        self.emit(AgentStreamEvent::Chunk { content: text });
                    }
                    if accumulator.is_done() {
                        break;
                    }
                }
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(ProviderError::StreamInterrupted(
                        "stream closed before the final fragment".into(),
                    ));
                }
            }
        }
        Ok(Some(accumulator.finish(self.model.clone())))
    }

    /// Dispatch a batch. Reports come back in call order.
    async fn execute_batch(
        &self,
        calls: &[MessageToolCall],
        cancel: &CancellationToken,
    ) -> Vec<CallReport> {
        if self.parallel_tools {
            return join_all(calls.iter().map(|call| self.execute_call(call, cancel))).await;
        }

        let mut reports = Vec::with_capacity(calls.len());
        for call in calls {
            if cancel.is_cancelled() {
                reports.push(CallReport::rejected(not_run(&call.name)));
                continue;
            }
            reports.push(self.execute_call(call, cancel).await);
        }
        reports
    }

    async fn execute_call(&self, call: &MessageToolCall, cancel: &CancellationToken) -> CallReport {
        let Some(tool) = self.tools.lookup(&call.name) else {
            warn!(tool = %call.name, "Model requested an unknown tool");
            return CallReport::rejected(format!("unknown tool: {}", call.name));
        };

        let arguments = match parse_arguments(&call.arguments) {
            Ok(arguments) => arguments,
            Err(e) => {
                return CallReport::rejected(format!(
                    "invalid arguments for {}: {e}",
                    call.name
                ));
            }
        };

        self.emit(AgentStreamEvent::ToolCall {
            id: call.id.clone(),
            name: call.name.clone(),
            input: arguments.clone(),
        });

        let ctx = ToolContext::new(call.id.clone(), cancel.clone());
        let started = Instant::now();
        let outcome = match self.tool_timeout {
            Some(limit) => tokio::time::timeout(limit, tool.execute(&ctx, arguments))
                .await
                .unwrap_or_else(|_| {
                    Err(ToolError::Timeout {
                        tool_name: call.name.clone(),
                        timeout_secs: limit.as_secs(),
                    })
                }),
            None => tool.execute(&ctx, arguments).await,
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(result) => {
                debug!(tool = %call.name, is_error = result.is_error, duration_ms, "Tool finished");
                CallReport {
                    result,
                    executed: true,
                    fatal: None,
                    duration_ms,
                }
            }
            Err(e) if e.is_model_visible() => {
                debug!(tool = %call.name, error = %e, "Tool error reported to model");
                CallReport {
                    result: ToolResult::error(e.to_string()),
                    executed: true,
                    fatal: None,
                    duration_ms,
                }
            }
            Err(e) => CallReport {
                result: ToolResult::error(e.to_string()),
                executed: true,
                fatal: Some(e),
                duration_ms,
            },
        }
    }

    fn emit(&self, event: AgentStreamEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

/// Empty argument strings are treated as `{}`.
fn not_run(tool: &str) -> String {
    format!("{tool} was not run: the turn was canceled")
}

fn parse_arguments(raw: &str) -> Result<serde_json::Value, serde_json::Error> {
    if raw.trim().is_empty() {
        return Ok(serde_json::Value::Object(serde_json::Map::new()));
    }
    serde_json::from_str(raw)
}

/// Cut the oldest large tool results until the sequence fits `ceiling`.
fn fit_tool_results(messages: &mut [Message], ceiling: usize, estimator: &dyn TokenEstimator) {
    let mut total = estimator.estimate_messages(messages);
    for message in messages.iter_mut() {
        if total <= ceiling {
            break;
        }
        if message.role != Role::Tool
            || message.content.len() <= TRUNCATED_PREFIX_BYTES
            || message.content.ends_with(TRUNCATION_MARKER)
        {
            continue;
        }

        let before = estimator.estimate_message(message);
        let mut cut = TRUNCATED_PREFIX_BYTES;
        while !message.content.is_char_boundary(cut) {
            cut -= 1;
        }
        message.content.truncate(cut);
        message.content.push('\n');
        message.content.push_str(TRUNCATION_MARKER);
        total = total - before + estimator.estimate_message(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::*;
    use tanren_core::provider::StreamChunk;

    fn registry(tools: Vec<Box<dyn tanren_core::tool::Tool>>) -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new();
        for tool in tools {
            registry.register(tool);
        }
        Arc::new(registry)
    }

    fn user(text: &str) -> Vec<Message> {
        vec![Message::user(text)]
    }

    #[tokio::test]
    async fn text_response_completes() {
        let provider = Arc::new(SequentialMockProvider::single_text("Hello! How can I help?"));
        let agent = AgentLoop::new(provider.clone(), registry(vec![]), "mock-model");

        let turn = agent.run(user("Hello!"), &CancellationToken::new()).await;

        assert_eq!(turn.answer(), Some("Hello! How can I help?"));
        assert_eq!(turn.completions, 1);
        assert_eq!(turn.messages.len(), 2);
        assert_eq!(turn.new_messages().len(), 1);
        assert_eq!(turn.usage.total_tokens, 15);
    }

    #[tokio::test]
    async fn tool_round_trip() {
        let provider = Arc::new(SequentialMockProvider::tool_then_answer(
            vec![make_tool_call("c1", "echo", serde_json::json!({"text": "ping"}))],
            "Let me echo that.",
            "It said ping.",
        ));
        let agent = AgentLoop::new(provider.clone(), registry(vec![Box::new(EchoTool)]), "m");

        let turn = agent.run(user("echo ping"), &CancellationToken::new()).await;

        assert_eq!(turn.answer(), Some("It said ping."));
        assert_eq!(turn.tool_executions, 1);
        let roles: Vec<Role> = turn.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]);
        assert_eq!(turn.messages[2].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(turn.messages[2].content, "ping");
        // narration stripped by default
        assert_eq!(turn.messages[1].content, "");

        let second = &provider.requests()[1];
        assert_eq!(second.messages.len(), 3);
        assert_eq!(second.tools.len(), 1);
    }

    #[tokio::test]
    async fn narration_kept_when_disabled() {
        let provider = Arc::new(SequentialMockProvider::tool_then_answer(
            vec![make_tool_call("c1", "echo", serde_json::json!({"text": "x"}))],
            "thinking out loud",
            "done",
        ));
        let agent = AgentLoop::new(provider, registry(vec![Box::new(EchoTool)]), "m")
            .with_strip_narration(false);
        let turn = agent.run(user("go"), &CancellationToken::new()).await;
        assert_eq!(turn.messages[1].content, "thinking out loud");
    }

    #[tokio::test]
    async fn unknown_tool_is_model_visible() {
        let provider = Arc::new(SequentialMockProvider::tool_then_answer(
            vec![make_tool_call("c1", "teleport", serde_json::json!({}))],
            "",
            "I can't do that.",
        ));
        let agent = AgentLoop::new(provider, registry(vec![]), "m");
        let turn = agent.run(user("teleport me"), &CancellationToken::new()).await;

        assert!(turn.outcome.is_completed());
        assert_eq!(turn.messages[2].content, "unknown tool: teleport");
        assert_eq!(turn.tool_executions, 0);
    }

    #[tokio::test]
    async fn invalid_arguments_are_model_visible() {
        let bad = MessageToolCall::new("c1", "echo", "{not json");
        let provider = Arc::new(SequentialMockProvider::tool_then_answer(vec![bad], "", "ok"));
        let agent = AgentLoop::new(provider, registry(vec![Box::new(EchoTool)]), "m");
        let turn = agent.run(user("x"), &CancellationToken::new()).await;

        assert!(turn.outcome.is_completed());
        assert!(turn.messages[2].content.starts_with("invalid arguments for echo"));
    }

    #[tokio::test]
    async fn model_visible_tool_error_continues() {
        let provider = Arc::new(SequentialMockProvider::tool_then_answer(
            vec![make_tool_call("c1", "fail", serde_json::json!({}))],
            "",
            "The tool failed.",
        ));
        let agent = AgentLoop::new(
            provider,
            registry(vec![Box::new(FailTool::invalid_arguments())]),
            "m",
        );
        let turn = agent.run(user("x"), &CancellationToken::new()).await;

        assert!(turn.outcome.is_completed());
        assert!(turn.messages[2].content.contains("Invalid tool arguments"));
    }

    #[tokio::test]
    async fn execution_failure_ends_turn() {
        let provider = Arc::new(SequentialMockProvider::tool_then_answer(
            vec![make_tool_call("c1", "fail", serde_json::json!({}))],
            "",
            "never reached",
        ));
        let agent = AgentLoop::new(
            provider.clone(),
            registry(vec![Box::new(FailTool::execution_failed())]),
            "m",
        );
        let turn = agent.run(user("x"), &CancellationToken::new()).await;

        assert!(matches!(
            turn.outcome,
            TurnOutcome::Failed(Error::Tool(ToolError::ExecutionFailed { .. }))
        ));
        assert_eq!(provider.call_count(), 1);
        assert_eq!(turn.messages.last().unwrap().role, Role::Tool);
    }

    #[tokio::test]
    async fn completion_error_fails_without_retry() {
        let provider = Arc::new(SequentialMockProvider::new(vec![]));
        let agent = AgentLoop::new(provider.clone(), registry(vec![]), "m");
        let turn = agent.run(user("x"), &CancellationToken::new()).await;

        assert!(matches!(turn.outcome, TurnOutcome::Failed(Error::Provider(_))));
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn repeated_failing_call_gets_stuck() {
        let call = || make_tool_call("c", "fail", serde_json::json!({"path": "/missing"}));
        let provider = Arc::new(SequentialMockProvider::new(vec![
            make_tool_call_response(vec![call()], ""),
            make_tool_call_response(vec![call()], ""),
            make_tool_call_response(vec![call()], ""),
            make_text_response("never reached"),
        ]));
        let agent = AgentLoop::new(
            provider.clone(),
            registry(vec![Box::new(FailTool::error_result())]),
            "m",
        );
        let turn = agent.run(user("read it"), &CancellationToken::new()).await;

        match &turn.outcome {
            TurnOutcome::Stuck { tool, attempts, explanation } => {
                assert_eq!(tool, "fail");
                assert_eq!(*attempts, 3);
                assert_eq!(&turn.messages.last().unwrap().content, explanation);
            }
            other => panic!("expected stuck, got {other:?}"),
        }
        assert_eq!(provider.call_count(), 3);
        assert_eq!(turn.tool_executions, 3);
    }

    #[tokio::test]
    async fn stuck_run_inside_one_batch_stops_before_next_completion() {
        let call = |id: &str| make_tool_call(id, "fail", serde_json::json!({"path": "/missing"}));
        let provider = Arc::new(SequentialMockProvider::new(vec![
            make_tool_call_response(vec![call("c1"), call("c2"), call("c3")], ""),
            make_text_response("never reached"),
        ]));
        let agent = AgentLoop::new(
            provider.clone(),
            registry(vec![Box::new(FailTool::error_result())]),
            "m",
        );
        let turn = agent.run(user("read it"), &CancellationToken::new()).await;

        assert!(matches!(turn.outcome, TurnOutcome::Stuck { attempts: 3, .. }));
        assert_eq!(provider.call_count(), 1);
        assert_eq!(turn.tool_executions, 3);
        let roles: Vec<Role> = turn.messages.iter().rev().take(4).map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::Assistant, Role::Tool, Role::Tool, Role::Tool]);
    }

    #[tokio::test]
    async fn intervening_success_resets_stuck_run() {
        let failing = || make_tool_call("c", "fail", serde_json::json!({}));
        let echo = || make_tool_call("e", "echo", serde_json::json!({"text": "hi"}));
        let provider = Arc::new(SequentialMockProvider::new(vec![
            make_tool_call_response(vec![failing()], ""),
            make_tool_call_response(vec![failing()], ""),
            make_tool_call_response(vec![echo()], ""),
            make_tool_call_response(vec![failing()], ""),
            make_text_response("done"),
        ]));
        let agent = AgentLoop::new(
            provider.clone(),
            registry(vec![Box::new(FailTool::error_result()), Box::new(EchoTool)]),
            "m",
        );
        let turn = agent.run(user("x"), &CancellationToken::new()).await;

        assert!(turn.outcome.is_completed());
        assert_eq!(provider.call_count(), 5);
    }

    #[tokio::test]
    async fn iteration_limit_fails() {
        let call = |i: u32| make_tool_call(&format!("c{i}"), "echo", serde_json::json!({"text": i}));
        let provider = Arc::new(SequentialMockProvider::new(
            (0..5).map(|i| make_tool_call_response(vec![call(i)], "")).collect(),
        ));
        let agent = AgentLoop::new(provider.clone(), registry(vec![Box::new(EchoTool)]), "m")
            .with_max_iterations(2);
        let turn = agent.run(user("x"), &CancellationToken::new()).await;

        assert!(matches!(
            turn.outcome,
            TurnOutcome::Failed(Error::IterationLimit { max: 2 })
        ));
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    async fn parallel_results_keep_call_order() {
        let provider = Arc::new(SequentialMockProvider::tool_then_answer(
            vec![
                make_tool_call("slow", "sleep", serde_json::json!({"ms": 60, "text": "first"})),
                make_tool_call("fast", "sleep", serde_json::json!({"ms": 1, "text": "second"})),
            ],
            "",
            "done",
        ));
        let agent = AgentLoop::new(provider, registry(vec![Box::new(SleepTool::default())]), "m");
        let turn = agent.run(user("x"), &CancellationToken::new()).await;

        let results: Vec<(&str, &str)> = turn
            .messages
            .iter()
            .filter(|m| m.role == Role::Tool)
            .map(|m| (m.tool_call_id.as_deref().unwrap(), m.content.as_str()))
            .collect();
        assert_eq!(results, vec![("slow", "first"), ("fast", "second")]);
        assert_eq!(turn.tool_executions, 2);
    }

    #[tokio::test]
    async fn parallel_calls_overlap() {
        let tool = SleepTool::default();
        let peak = tool.peak.clone();
        let provider = Arc::new(SequentialMockProvider::tool_then_answer(
            vec![
                make_tool_call("a", "sleep", serde_json::json!({"ms": 30, "text": "a"})),
                make_tool_call("b", "sleep", serde_json::json!({"ms": 30, "text": "b"})),
            ],
            "",
            "done",
        ));
        let agent = AgentLoop::new(provider, registry(vec![Box::new(tool)]), "m");
        agent.run(user("x"), &CancellationToken::new()).await;
        assert_eq!(peak.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn sequential_calls_do_not_overlap() {
        let tool = SleepTool::default();
        let peak = tool.peak.clone();
        let provider = Arc::new(SequentialMockProvider::tool_then_answer(
            vec![
                make_tool_call("a", "sleep", serde_json::json!({"ms": 10, "text": "a"})),
                make_tool_call("b", "sleep", serde_json::json!({"ms": 10, "text": "b"})),
            ],
            "",
            "done",
        ));
        let agent = AgentLoop::new(provider, registry(vec![Box::new(tool)]), "m")
            .with_parallel_tools(false);
        let turn = agent.run(user("x"), &CancellationToken::new()).await;
        assert!(turn.outcome.is_completed());
        assert_eq!(peak.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn tool_timeout_is_model_visible() {
        let provider = Arc::new(SequentialMockProvider::tool_then_answer(
            vec![make_tool_call("c1", "sleep", serde_json::json!({"ms": 5_000, "text": "late"}))],
            "",
            "It timed out.",
        ));
        let agent = AgentLoop::new(provider, registry(vec![Box::new(SleepTool::default())]), "m")
            .with_tool_timeout(Duration::from_millis(20));
        let turn = agent.run(user("x"), &CancellationToken::new()).await;

        assert!(turn.outcome.is_completed());
        assert!(turn.messages[2].content.contains("Tool timed out"));
    }

    #[tokio::test]
    async fn canceled_before_start() {
        let provider = Arc::new(SequentialMockProvider::single_text("unused"));
        let agent = AgentLoop::new(provider.clone(), registry(vec![]), "m");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let turn = agent.run(user("x"), &cancel).await;
        assert!(matches!(turn.outcome, TurnOutcome::Canceled));
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn canceled_during_completion() {
        let agent = AgentLoop::new(Arc::new(PendingProvider), registry(vec![]), "m");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let turn = agent.run(user("x"), &cancel).await;
        assert!(matches!(turn.outcome, TurnOutcome::Canceled));
        assert_eq!(turn.completions, 1);
    }

    #[tokio::test]
    async fn canceled_during_tools_appends_results_then_stops() {
        let cancel = CancellationToken::new();
        let provider = Arc::new(SequentialMockProvider::tool_then_answer(
            vec![make_tool_call("c1", "cancel", serde_json::json!({}))],
            "",
            "never reached",
        ));
        let agent = AgentLoop::new(
            provider.clone(),
            registry(vec![Box::new(CancelingTool::new(cancel.clone()))]),
            "m",
        );
        let turn = agent.run(user("x"), &cancel).await;

        assert!(matches!(turn.outcome, TurnOutcome::Canceled));
        assert_eq!(turn.messages.last().unwrap().role, Role::Tool);
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn canceled_after_tool_request_answers_every_call() {
        let cancel = CancellationToken::new();
        let provider = Arc::new(CancelOnCompleteProvider::new(
            cancel.clone(),
            vec![
                make_tool_call("c1", "echo", serde_json::json!({"text": "a"})),
                make_tool_call("c2", "list_dir", serde_json::json!({"path": "/tmp"})),
            ],
        ));
        let agent = AgentLoop::new(provider, registry(vec![Box::new(EchoTool)]), "m");
        let turn = agent.run(user("x"), &cancel).await;

        assert!(matches!(turn.outcome, TurnOutcome::Canceled));
        assert_eq!(turn.tool_executions, 0);
        let tail = &turn.messages[turn.messages.len() - 2..];
        assert_eq!(tail[0].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(tail[0].content, "echo was not run: the turn was canceled");
        assert_eq!(tail[1].tool_call_id.as_deref(), Some("c2"));
        assert_eq!(tail[1].content, "list_dir was not run: the turn was canceled");
    }

    #[tokio::test]
    async fn streaming_accumulates_before_acting() {
        let provider = Arc::new(ScriptedStreamProvider::new(vec![
            vec![
                StreamChunk::text("Checking"),
                tool_delta(0, Some("call_1"), Some("echo"), Some("{\"te")),
                tool_delta(0, None, None, Some("xt\": \"hel")),
                tool_delta(0, None, None, Some("lo\"}")),
                StreamChunk::finished(Some("tool_calls".into()), None),
            ],
            vec![
                StreamChunk::text("It said "),
                StreamChunk::text("hello."),
                StreamChunk::finished(Some("stop".into()), None),
            ],
        ]));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let agent = AgentLoop::new(provider.clone(), registry(vec![Box::new(EchoTool)]), "m")
            .with_streaming(true)
            .with_events(tx);

        let turn = agent.run(user("say hello"), &CancellationToken::new()).await;

        assert_eq!(turn.answer(), Some("It said hello."));
        assert_eq!(turn.tool_executions, 1);
        assert_eq!(turn.messages[2].content, "hello");
        assert_eq!(turn.messages[1].tool_calls[0].arguments, r#"{"text": "hello"}"#);

        let mut chunks = Vec::new();
        let mut last = None;
        while let Ok(event) = rx.try_recv() {
            if let AgentStreamEvent::Chunk { content } = &event {
                chunks.push(content.clone());
            }
            last = Some(event);
        }
        assert_eq!(chunks, vec!["Checking", "It said ", "hello."]);
        assert_eq!(last.unwrap().event_type(), "done");
    }

    #[tokio::test]
    async fn streaming_error_fails_turn() {
        let provider = Arc::new(ScriptedStreamProvider::new(vec![vec![StreamChunk::text(
            "partial",
        )]]));
        let agent = AgentLoop::new(provider, registry(vec![]), "m").with_streaming(true);
        let turn = agent.run(user("x"), &CancellationToken::new()).await;
        assert!(matches!(
            turn.outcome,
            TurnOutcome::Failed(Error::Provider(ProviderError::StreamInterrupted(_)))
        ));
    }

    #[tokio::test]
    async fn canceled_stream_releases_producer() {
        let provider = Arc::new(HangingStreamProvider::default());
        let released = provider.released.clone();
        let agent = AgentLoop::new(provider, registry(vec![]), "m").with_streaming(true);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let turn = agent.run(user("x"), &cancel).await;
        assert!(matches!(turn.outcome, TurnOutcome::Canceled));

        tokio::time::timeout(Duration::from_secs(1), async {
            while !released.load(std::sync::atomic::Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("producer should observe the dropped receiver");
    }

    #[test]
    fn oversized_tool_results_are_truncated_oldest_first() {
        let estimator = CharRatioEstimator::new(1.0);
        let mut messages = vec![
            Message::user("q"),
            Message::tool_result("a", "a".repeat(1_000)),
            Message::tool_result("b", "b".repeat(1_000)),
        ];
        fit_tool_results(&mut messages, 1_500, &estimator);

        assert!(messages[1].content.ends_with(TRUNCATION_MARKER));
        assert!(messages[1].content.starts_with(&"a".repeat(TRUNCATED_PREFIX_BYTES)));
        assert_eq!(messages[2].content.len(), 1_000);
        assert!(estimator.estimate_messages(&messages) <= 1_500);
    }

    #[tokio::test]
    async fn ceiling_applies_to_request_only() {
        let provider = Arc::new(SequentialMockProvider::tool_then_answer(
            vec![make_tool_call("c1", "echo", serde_json::json!({"text": "z".repeat(2_000)}))],
            "",
            "done",
        ));
        let agent = AgentLoop::new(provider.clone(), registry(vec![Box::new(EchoTool)]), "m")
            .with_context_ceiling(1_000, Arc::new(CharRatioEstimator::new(1.0)));
        let turn = agent.run(user("x"), &CancellationToken::new()).await;

        assert_eq!(turn.messages[2].content.len(), 2_000);
        let sent = &provider.requests()[1].messages[2].content;
        assert!(sent.ends_with(TRUNCATION_MARKER));
    }

    #[tokio::test]
    async fn events_follow_the_turn() {
        let provider = Arc::new(SequentialMockProvider::tool_then_answer(
            vec![make_tool_call("c1", "echo", serde_json::json!({"text": "hi"}))],
            "",
            "done",
        ));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let agent =
            AgentLoop::new(provider, registry(vec![Box::new(EchoTool)]), "m").with_events(tx);
        agent.run(user("x"), &CancellationToken::new()).await;

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.event_type());
        }
        assert_eq!(
            kinds,
            vec!["iteration", "tool_call", "tool_result", "iteration", "done"]
        );
    }
}
