//! Agent runtime core: tiered conversation memory, background compression,
//! and streaming replies that keep reasoning apart from the answer.
//!
//! `strata` keeps a conversation inside a fixed share of the model's context
//! window. Messages land in the current topic; closed topics are summarized
//! in place; old topics are evicted into bulks that are merged and
//! re-summarized as they pile up. Compression runs on a dedicated worker
//! thread while the user reads the reply, and the next turn waits only if
//! the history is still over budget.
//!
//! # Getting started
//!
//! ```ignore
//! use std::sync::Arc;
//! use strata::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> strata::error::Result<()> {
//!     let api_key = std::env::var("OPENROUTER_KEY").unwrap_or_default();
//!     let config = AgentConfig::default();
//!     let summarizer = UtilitySummarizer::new(OpenRouterClient::new(&api_key)?, &config.utility_model);
//!     let agent = Agent::new(
//!         OpenRouterClient::new(api_key)?,
//!         Arc::new(summarizer),
//!         History::new(config.history.clone()),
//!         config,
//!         Arc::new(TaskPool::default()),
//!     );
//!
//!     let reply = agent.respond("What changed in the last release?", &LoggingHandler).await?;
//!     println!("{}", reply.response);
//!     agent.organizer().wait_idle(None).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Where to find things
//!
//! - **Conversation memory:** [`History`](history::History) and its records
//!   ([`Topic`](history::Topic), [`Bulk`](history::Bulk),
//!   [`Message`](history::Message)). Budget policy lives in
//!   [`HistoryConfig`](history::HistoryConfig); the compression engine in
//!   [`history::compress`].
//! - **Background work:** [`TaskPool`](tasks::TaskPool) and
//!   [`DeferredTask`](tasks::DeferredTask).
//! - **Model I/O:** [`ChatProvider`](api::ChatProvider),
//!   [`ChunkParser`](api::ChunkParser), [`stream_with_retry`](api::stream_with_retry)
//!   and the [`RateLimiterRegistry`](api::RateLimiterRegistry).
//! - **Turns:** [`Agent`](agent::Agent) and
//!   [`HistoryOrganizer`](agent::HistoryOrganizer).
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`history`] | Tiered records, budgets, compression, tagged JSON persistence |
//! | [`tasks`] | Named worker threads and cancellable deferred tasks |
//! | [`api`] | SSE streaming provider, reasoning split, retry, rate limits |
//! | [`agent`] | Turns, organizer, events, configuration, session files |
//! | [`tokens`] | Approximate token counting |

pub mod agent;
pub mod api;
pub mod error;
pub mod history;
pub mod prelude;
pub mod tasks;
pub mod tokens;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::tokens::approximate_tokens;

/// OpenRouter chat completions endpoint.
pub const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Default model for chat replies.
pub const DEFAULT_MODEL: &str = "anthropic/claude-sonnet-4";

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

fn is_zero_f32(v: &f32) -> bool {
    *v == 0.0
}

/// Chat completion request body. Zero-valued generation parameters are
/// omitted so the provider default applies.
#[derive(Serialize, Debug, Default, Clone)]
pub struct ChatRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "is_zero_u32")]
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "is_zero_f32")]
    pub temperature: f32,
}

impl ChatRequest {
    /// Approximate prompt size, used for input-token rate limiting.
    pub fn estimated_input_tokens(&self) -> usize {
        self.messages
            .iter()
            .map(|m| approximate_tokens(m.content.as_deref().unwrap_or_default()))
            .sum()
    }
}

// ── Message types ──────────────────────────────────────────────────

/// Role of a message in the conversation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
        }
    }
}

/// A message as sent to the chat API.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ChatMessage {
    pub role: MessageRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: Some(content.into()),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: Some(content.into()),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: Some(content.into()),
        }
    }
}

/// Token usage statistics reported at the end of a stream.
#[derive(Deserialize, Debug, Clone)]
pub struct UsageInfo {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
}

// ── Client ─────────────────────────────────────────────────────────

/// Async HTTP client for the OpenRouter chat completions API. Implements
/// [`ChatProvider`](api::ChatProvider).
pub struct OpenRouterClient {
    pub(crate) client: reqwest::Client,
    pub(crate) api_key: String,
    pub(crate) referer: String,
    pub(crate) title: String,
}

impl OpenRouterClient {
    /// Create a new client with the given API key and default headers.
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        Self::with_headers(api_key, "https://github.com/strata-rs/strata", "strata")
    }

    /// Create a new client with custom Referer and X-Title headers.
    pub fn with_headers(
        api_key: impl Into<String>,
        referer: impl Into<String>,
        title: impl Into<String>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("strata/0.1")
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            referer: referer.into(),
            title: title.into(),
        })
    }
}

impl std::fmt::Debug for OpenRouterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenRouterClient")
            .field("referer", &self.referer)
            .field("title", &self.title)
            .finish_non_exhaustive()
    }
}
