//! Progress events emitted while an agent turn runs.
//!
//! The organizer and the streaming helpers report what they are doing
//! through [`AgentEvent`]s. Callers implement [`EventHandler`] to render
//! progress, collect metrics, or log.
//!
//! | Handler | Use case |
//! |---------|----------|
//! | [`NoopHandler`] | Tests or fire-and-forget runs |
//! | [`LoggingHandler`] | Structured logging via `tracing` |
//! | [`FnEventHandler`] | Quick closures for simple callbacks |
//! | [`CompositeEventHandler`] | Compose multiple handlers in order |

use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::api::StreamEvent;
use crate::error::Error;

/// Events emitted during a turn.
#[derive(Debug)]
pub enum AgentEvent<'a> {
    /// The history is over budget and the caller is about to block until
    /// compression brings it back.
    CompressingHistory { tokens: usize, budget: usize },
    /// A compression run finished with a smaller history.
    HistoryCompressed { before: usize, after: usize },
    /// The history is still over budget but compression can make no
    /// further progress.
    CompressionSkipped { tokens: usize, budget: usize },
    /// Incremental response text.
    ResponseDelta(&'a str),
    /// Incremental reasoning text.
    ReasoningDelta(&'a str),
    /// A transient provider failure; another attempt follows after `delay`.
    RetryScheduled {
        attempt: u32,
        delay: Duration,
        error: &'a Error,
    },
    /// The session file was written.
    SessionSaved { path: &'a str },
}

impl AgentEvent<'_> {
    /// Translate a streaming progress event and hand it to `handler`.
    pub fn forward_stream(event: &StreamEvent, handler: &dyn EventHandler) {
        match event {
            StreamEvent::Delta(chunk) => {
                if !chunk.reasoning_delta.is_empty() {
                    handler.on_event(&AgentEvent::ReasoningDelta(&chunk.reasoning_delta));
                }
                if !chunk.response_delta.is_empty() {
                    handler.on_event(&AgentEvent::ResponseDelta(&chunk.response_delta));
                }
            }
            StreamEvent::Retrying {
                attempt,
                delay,
                error,
            } => handler.on_event(&AgentEvent::RetryScheduled {
                attempt: *attempt,
                delay: *delay,
                error,
            }),
        }
    }
}

/// Handler for agent events.
///
/// ```ignore
/// struct Printer;
///
/// impl EventHandler for Printer {
///     fn on_event(&self, event: &AgentEvent<'_>) {
///         if let AgentEvent::ResponseDelta(text) = event {
///             print!("{text}");
///         }
///     }
/// }
/// ```
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &AgentEvent<'_>) {
        let _ = event;
    }
}

/// Ignores every event.
pub struct NoopHandler;
impl EventHandler for NoopHandler {}

/// An event handler backed by a closure.
///
/// ```ignore
/// let handler = FnEventHandler::new(|event| {
///     if let AgentEvent::CompressingHistory { .. } = event {
///         eprintln!("compressing history...");
///     }
/// });
/// ```
pub struct FnEventHandler<F>(F)
where
    F: Fn(&AgentEvent<'_>) + Send + Sync;

impl<F> FnEventHandler<F>
where
    F: Fn(&AgentEvent<'_>) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> EventHandler for FnEventHandler<F>
where
    F: Fn(&AgentEvent<'_>) + Send + Sync,
{
    fn on_event(&self, event: &AgentEvent<'_>) {
        (self.0)(event)
    }
}

/// Dispatches every event to each inner handler, in registration order.
#[derive(Default)]
pub struct CompositeEventHandler {
    handlers: Vec<Box<dyn EventHandler>>,
}

impl CompositeEventHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, handler: impl EventHandler + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    /// Add a handler only when `condition` holds.
    pub fn with_if(self, condition: bool, handler: impl EventHandler + 'static) -> Self {
        if condition { self.with(handler) } else { self }
    }
}

impl EventHandler for CompositeEventHandler {
    fn on_event(&self, event: &AgentEvent<'_>) {
        for handler in &self.handlers {
            handler.on_event(event);
        }
    }
}

/// Logs events through `tracing`.
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn on_event(&self, event: &AgentEvent<'_>) {
        match event {
            AgentEvent::CompressingHistory { tokens, budget } => {
                info!("Compressing history ({tokens} tokens, budget {budget})");
            }
            AgentEvent::HistoryCompressed { before, after } => {
                info!("History compressed: {before} -> {after} tokens");
            }
            AgentEvent::CompressionSkipped { tokens, budget } => {
                warn!("History stays over budget ({tokens} > {budget}), no progress possible");
            }
            AgentEvent::ResponseDelta(text) => trace!("response delta: {} chars", text.len()),
            AgentEvent::ReasoningDelta(text) => trace!("reasoning delta: {} chars", text.len()),
            AgentEvent::RetryScheduled {
                attempt,
                delay,
                error,
            } => {
                warn!("Retry {attempt} in {delay:?} after: {error}");
            }
            AgentEvent::SessionSaved { path } => debug!("Session saved to {path}"),
        }
    }
}
