//! Configuration for an agent turn.
//!
//! [`AgentConfig`] bundles the chat and utility model settings with the
//! retry, rate-limit, worker, and history policies. Every field has a
//! default, so a settings file only needs the keys it overrides:
//!
//! ```json
//! {
//!   "model": "anthropic/claude-sonnet-4",
//!   "retry": { "max_retries": 3, "delay": 0.5 },
//!   "history": { "ctx_length": 200000 }
//! }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::api::{RateLimits, RetryConfig};
use crate::error::{Error, Result};
use crate::history::HistoryConfig;
use crate::tasks::{DEFAULT_MAX_WORKERS, DEFAULT_WORKER};
use crate::{ChatMessage, ChatRequest, DEFAULT_MODEL};

/// Model used for history summaries unless configured otherwise.
pub const DEFAULT_UTILITY_MODEL: &str = "openai/gpt-4o-mini";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Model that answers the user.
    pub model: String,
    /// Cheaper model that writes history summaries.
    pub utility_model: String,
    /// Completion cap for chat replies. 0 leaves it to the provider.
    pub max_tokens: u32,
    /// Completion cap for summaries.
    pub utility_max_tokens: u32,
    pub temperature: f32,
    pub retry: RetryConfig,
    pub rate_limits: RateLimits,
    /// Worker that runs background compression.
    pub worker: String,
    pub max_workers: usize,
    pub history: HistoryConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            utility_model: DEFAULT_UTILITY_MODEL.to_string(),
            max_tokens: 4096,
            utility_max_tokens: 1024,
            temperature: 0.7,
            retry: RetryConfig::default(),
            rate_limits: RateLimits::default(),
            worker: DEFAULT_WORKER.to_string(),
            max_workers: DEFAULT_MAX_WORKERS,
            history: HistoryConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn with_utility_model(mut self, model: impl Into<String>) -> Self {
        self.utility_model = model.into();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_rate_limits(mut self, limits: RateLimits) -> Self {
        self.rate_limits = limits;
        self
    }

    pub fn with_worker(mut self, worker: impl Into<String>) -> Self {
        self.worker = worker.into();
        self
    }

    pub fn with_history(mut self, history: HistoryConfig) -> Self {
        self.history = history;
        self
    }

    /// Load a JSON settings file. Missing keys take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Io(format!("failed to read {}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(Error::Config("model must not be empty".into()));
        }
        if self.utility_model.trim().is_empty() {
            return Err(Error::Config("utility_model must not be empty".into()));
        }
        if self.worker.trim().is_empty() {
            return Err(Error::Config("worker must not be empty".into()));
        }
        if self.max_workers == 0 {
            return Err(Error::Config("max_workers must be positive".into()));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(Error::Config(format!(
                "temperature must be within [0, 2], got {}",
                self.temperature
            )));
        }
        self.history.validate()
    }

    /// A chat request for the reply model.
    pub fn chat_request(&self, messages: Vec<ChatMessage>) -> ChatRequest {
        ChatRequest {
            model: Some(self.model.clone()),
            messages,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        }
    }
}
