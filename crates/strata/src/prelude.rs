//! Convenience re-exports for common `strata` types.
//!
//! ```ignore
//! use strata::prelude::*;
//! ```
//!
//! Pulls in the client and message types, the history records, the task
//! coordinator, and the agent turn with its handlers. Lower-level pieces
//! (SSE decoder, compression planning, rate-limiter internals) stay in
//! their modules.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::error::{Error, Result};
pub use crate::{ChatMessage, ChatRequest, MessageRole, OpenRouterClient};

// ── History ─────────────────────────────────────────────────────────
pub use crate::history::{
    Bulk, History, HistoryConfig, Message, MessageContent, SharedHistory, Summarizer, Topic,
};

// ── Model I/O ───────────────────────────────────────────────────────
pub use crate::api::{
    ChatChunk, ChatProvider, ChunkParser, RateLimited, RateLimiterRegistry, RateLimits,
    RetryConfig, stream_with_retry,
};

// ── Background work ─────────────────────────────────────────────────
pub use crate::tasks::{DeferredTask, TaskPool};

// ── Agent runtime ───────────────────────────────────────────────────
pub use crate::agent::{
    Agent, AgentConfig, AgentEvent, CompositeEventHandler, EventHandler, FnEventHandler,
    HistoryOrganizer, LoggingHandler, NoopHandler, SessionFile, UtilitySummarizer,
};

// ── Tokens ──────────────────────────────────────────────────────────
pub use crate::tokens::approximate_tokens;
