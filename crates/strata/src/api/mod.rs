//! Model I/O: streaming completions, reasoning/response separation, retry,
//! and rate limiting.
//!
//! - [`chunks`]: [`ChunkParser`], which splits a raw delta stream into
//!   reasoning and response text, handling native reasoning channels and
//!   inline `<think>` tags split across chunks.
//! - [`streaming`]: the [`ChatProvider`] trait and its SSE implementation
//!   for [`OpenRouterClient`](crate::OpenRouterClient).
//! - [`retry`]: [`stream_with_retry`], a bounded fixed-delay retry that never
//!   retries once output has started.
//! - [`limiter`]: sliding-window [`RateLimiter`]s held in a
//!   [`RateLimiterRegistry`].

pub mod chunks;
pub mod limiter;
pub mod retry;
pub mod streaming;

pub use chunks::{ChatChunk, ChunkParser, ThinkingTags};
pub use limiter::{RateLimited, RateLimiter, RateLimiterRegistry, RateLimits};
pub use retry::{RetryConfig, StreamEvent, StreamOutput, stream_with_retry};
pub use streaming::{ChatProvider, ChunkStream, SseDecoder};
