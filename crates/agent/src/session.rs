//! A conversation session: memory recall, the context window and the agent
//! loop composed into one `turn()` call.

use std::sync::Arc;

use tanren_config::AppConfig;
use tanren_core::error::ContextError;
use tanren_core::memory::{MemoryBackend, ScoredRecord};
use tanren_core::message::{Message, SessionId};
use tanren_core::provider::Provider;
use tanren_core::tool::ToolRegistry;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::{CharRatioEstimator, ContextWindow};
use crate::loop_runner::{AgentLoop, AgentTurn, TurnOutcome};

/// Pinned system message for one recalled record.
pub fn format_memory(scored: &ScoredRecord) -> Message {
    let record = &scored.record;
    Message::system(format!(
        "[Memory from {}] User asked: {}\nAssistant replied: {}",
        record.created_at.format("%Y-%m-%d"),
        record.user_text,
        record.assistant_text
    ))
}

pub struct Session {
    id: SessionId,
    window: ContextWindow,
    agent: AgentLoop,
    memory: Option<Arc<dyn MemoryBackend>>,
    recall_limit: usize,
}

impl Session {
    pub fn new(window: ContextWindow, agent: AgentLoop) -> Self {
        Self {
            id: SessionId::new(),
            window,
            agent,
            memory: None,
            recall_limit: 5,
        }
    }

    /// Build a session from configuration. The system prompt, if any, is
    /// pinned; memory is attached only when enabled.
    pub fn from_config(
        config: &AppConfig,
        provider: Arc<dyn Provider>,
        tools: Arc<ToolRegistry>,
        memory: Option<Arc<dyn MemoryBackend>>,
    ) -> Result<Self, ContextError> {
        let mut window = ContextWindow::from_config(&config.context);
        if let Some(prompt) = &config.agent.system_prompt {
            window.add_pinned(Message::system(prompt.clone()))?;
        }

        let mut session = Self::new(window, AgentLoop::from_config(provider, tools, config))
            .with_recall_limit(config.memory.recall_limit);
        if config.memory.enabled
            && let Some(memory) = memory
        {
            session = session.with_memory(memory);
        }
        Ok(session)
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryBackend>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_recall_limit(mut self, limit: usize) -> Self {
        self.recall_limit = limit;
        self
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn window(&self) -> &ContextWindow {
        &self.window
    }

    /// For pinning context files or replacing the system prompt.
    pub fn window_mut(&mut self) -> &mut ContextWindow {
        &mut self.window
    }

    /// Replace the window's estimator with one calibrated against the
    /// provider's tokenizer.
    pub async fn calibrate_estimator(&mut self) -> Result<(), ContextError> {
        let estimator = CharRatioEstimator::calibrate(self.agent.provider().as_ref()).await;
        self.window.set_estimator(Arc::new(estimator))
    }

    /// Run one user turn.
    pub async fn turn(&mut self, input: &str, cancel: &CancellationToken) -> AgentTurn {
        info!(session_id = %self.id, input_len = input.len(), "Session turn");

        let recalled = self.recall(input).await;
        if let Err(e) = self.window.replace_memories(recalled) {
            return AgentTurn::failed(self.window.snapshot(), e.into());
        }
        if let Err(e) = self.window.add_windowed(Message::user(input)) {
            return AgentTurn::failed(self.window.snapshot(), e.into());
        }

        let turn = self.agent.run(self.window.snapshot(), cancel).await;

        for message in turn.new_messages() {
            if let Err(e) = self.window.add_windowed(message.clone()) {
                warn!(session_id = %self.id, error = %e, "Could not keep turn message in window");
            }
        }

        if let TurnOutcome::Completed { answer } = &turn.outcome {
            self.remember(input, answer).await;
        }
        turn
    }

    async fn recall(&self, input: &str) -> Vec<Message> {
        let Some(memory) = &self.memory else {
            return vec![];
        };
        if self.recall_limit == 0 {
            return vec![];
        }

        match memory.search(input, self.recall_limit).await {
            Ok(records) => {
                if !records.is_empty() {
                    debug!(count = records.len(), "Recalled memories for context");
                }
                records.iter().map(format_memory).collect()
            }
            Err(e) => {
                warn!(session_id = %self.id, error = %e, "Memory recall failed");
                vec![]
            }
        }
    }

    async fn remember(&self, input: &str, answer: &str) {
        let Some(memory) = &self.memory else {
            return;
        };
        match memory
            .store_in_session(&self.id.to_string(), input, answer)
            .await
        {
            Ok(id) => debug!(memory_id = %id, "Stored turn in memory"),
            Err(e) => warn!(session_id = %self.id, error = %e, "Failed to store turn in memory"),
        }
    }
}
