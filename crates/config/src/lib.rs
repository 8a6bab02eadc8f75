//! Configuration loading, validation, and management for Tanren.
//!
//! Loads configuration from `~/.tanren/config.toml` with environment
//! variable overrides. Validates all settings at startup.

pub mod logging;

pub use logging::LoggingConfig;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.tanren/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Inference / embedding backend
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Context window budget
    #[serde(default)]
    pub context: ContextConfig,

    /// Agent loop behaviour
    #[serde(default)]
    pub agent: AgentConfig,

    /// Long-term memory
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Base URL of the OpenAI-compatible API (including `/v1`)
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Chat model
    #[serde(default = "default_model")]
    pub model: String,

    /// Embedding model used by the memory store
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    /// HTTP request timeout
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Use SSE streaming for completions
    #[serde(default = "default_true")]
    pub stream: bool,
}

fn default_base_url() -> String {
    "http://127.0.0.1:8080/v1".into()
}
fn default_model() -> String {
    "default".into()
}
fn default_embedding_model() -> String {
    "nomic-embed-text".into()
}
fn default_timeout_secs() -> u64 {
    300
}
fn default_true() -> bool {
    true
}

/// Redact a secret for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &redact(&self.api_key))
            .field("model", &self.model)
            .field("embedding_model", &self.embedding_model)
            .field("timeout_secs", &self.timeout_secs)
            .field("stream", &self.stream)
            .finish()
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            model: default_model(),
            embedding_model: default_embedding_model(),
            timeout_secs: default_timeout_secs(),
            stream: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Model context size in tokens
    #[serde(default = "default_ctx_size")]
    pub ctx_size: usize,

    /// Tokens held back for the model's reply
    #[serde(default = "default_response_budget")]
    pub response_budget: usize,

    /// Heuristic ratio used until (or instead of) calibration
    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: f64,

    /// Ask the backend's tokenizer for a better ratio at startup
    #[serde(default)]
    pub calibrate: bool,
}

fn default_ctx_size() -> usize {
    8192
}
fn default_response_budget() -> usize {
    1024
}
fn default_chars_per_token() -> f64 {
    3.5
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            ctx_size: default_ctx_size(),
            response_budget: default_response_budget(),
            chars_per_token: default_chars_per_token(),
            calibrate: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Max tokens per completion
    #[serde(default = "default_max_response_tokens")]
    pub max_response_tokens: u32,

    /// Completion calls allowed per turn
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Consecutive identical failing calls before the turn is stopped
    #[serde(default = "default_stuck_threshold")]
    pub stuck_threshold: usize,

    /// Run the tool calls of one response concurrently
    #[serde(default = "default_true")]
    pub parallel_tools: bool,

    /// Drop assistant text that accompanies tool calls
    #[serde(default = "default_true")]
    pub strip_narration: bool,

    /// Per-tool deadline in seconds
    #[serde(
        default = "default_tool_timeout_secs",
        skip_serializing_if = "Option::is_none"
    )]
    pub tool_timeout_secs: Option<u64>,
}

fn default_temperature() -> f32 {
    0.7
}
fn default_max_response_tokens() -> u32 {
    4096
}
fn default_max_iterations() -> u32 {
    20
}
fn default_stuck_threshold() -> usize {
    3
}
fn default_tool_timeout_secs() -> Option<u64> {
    Some(120)
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: None,
            temperature: default_temperature(),
            max_response_tokens: default_max_response_tokens(),
            max_iterations: default_max_iterations(),
            stuck_threshold: default_stuck_threshold(),
            parallel_tools: true,
            strip_narration: true,
            tool_timeout_secs: default_tool_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// JSONL file backing the store; absent keeps memory in-process only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    /// Records injected per turn
    #[serde(default = "default_recall_limit")]
    pub recall_limit: usize,

    #[serde(default = "default_vector_weight")]
    pub vector_weight: f32,

    #[serde(default = "default_keyword_weight")]
    pub keyword_weight: f32,
}

fn default_recall_limit() -> usize {
    5
}
fn default_vector_weight() -> f32 {
    0.7
}
fn default_keyword_weight() -> f32 {
    0.3
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
            recall_limit: default_recall_limit(),
            vector_weight: default_vector_weight(),
            keyword_weight: default_keyword_weight(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.tanren/config.toml).
    ///
    /// Environment overrides (highest priority):
    /// - `TANREN_API_KEY`, falling back to `OPENAI_API_KEY`
    /// - `TANREN_BASE_URL`
    /// - `TANREN_MODEL`
    /// - `TANREN_LOG`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from an environment lookup.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup("TANREN_API_KEY").or_else(|| lookup("OPENAI_API_KEY")) {
            self.provider.api_key = Some(key);
        }
        if let Some(url) = lookup("TANREN_BASE_URL") {
            self.provider.base_url = url;
        }
        if let Some(model) = lookup("TANREN_MODEL") {
            self.provider.model = model;
        }
        if let Some(level) = lookup("TANREN_LOG") {
            self.logging.level = level;
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".tanren")
    }

    /// Default location of the memory JSONL file.
    pub fn default_memory_path() -> PathBuf {
        Self::config_dir().join("memory").join("records.jsonl")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.temperature < 0.0 || self.agent.temperature > 2.0 {
            return Err(ConfigError::ValidationError(
                "agent.temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.context.response_budget >= self.context.ctx_size {
            return Err(ConfigError::ValidationError(format!(
                "context.response_budget ({}) must be smaller than context.ctx_size ({})",
                self.context.response_budget, self.context.ctx_size
            )));
        }

        if self.context.chars_per_token.is_nan() || self.context.chars_per_token <= 0.0 {
            return Err(ConfigError::ValidationError(
                "context.chars_per_token must be > 0".into(),
            ));
        }

        if self.agent.stuck_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "agent.stuck_threshold must be at least 1".into(),
            ));
        }

        if self.agent.max_iterations == 0 {
            return Err(ConfigError::ValidationError(
                "agent.max_iterations must be at least 1".into(),
            ));
        }

        if self.memory.vector_weight < 0.0
            || self.memory.keyword_weight < 0.0
            || self.memory.vector_weight + self.memory.keyword_weight <= 0.0
        {
            return Err(ConfigError::ValidationError(
                "memory weights must be non-negative and sum to more than 0".into(),
            ));
        }

        Ok(())
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
