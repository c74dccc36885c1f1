//! Sliding-window rate limiting per provider and model.
//!
//! Limits are expressed per window (60 seconds by default) for requests,
//! input tokens, and output tokens. A zero limit disables that dimension.
//! Limiters live in an explicit [`RateLimiterRegistry`] owned by whoever
//! builds the providers, so tests get isolated state.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use futures::stream;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use super::streaming::{ChatProvider, ChunkStream};
use crate::ChatRequest;
use crate::tokens::approximate_tokens;

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Per-window limits. Zero means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimits {
    pub requests: usize,
    pub input_tokens: usize,
    pub output_tokens: usize,
}

impl RateLimits {
    pub fn is_unlimited(&self) -> bool {
        self.requests == 0 && self.input_tokens == 0 && self.output_tokens == 0
    }
}

#[derive(Debug, Default)]
struct Window {
    requests: VecDeque<Instant>,
    input: VecDeque<(Instant, usize)>,
    output: VecDeque<(Instant, usize)>,
}

impl Window {
    fn prune(&mut self, now: Instant, window: Duration) {
        let expired = |t: &Instant| now.duration_since(*t) >= window;
        while self.requests.front().is_some_and(expired) {
            self.requests.pop_front();
        }
        while self.input.front().is_some_and(|(t, _)| expired(t)) {
            self.input.pop_front();
        }
        while self.output.front().is_some_and(|(t, _)| expired(t)) {
            self.output.pop_front();
        }
    }

    /// Time until the oldest entry that blocks `extra` more units expires.
    fn wait_for(
        entries: &VecDeque<(Instant, usize)>,
        limit: usize,
        extra: usize,
        now: Instant,
        window: Duration,
    ) -> Option<Duration> {
        if limit == 0 || entries.is_empty() {
            return None;
        }
        let used: usize = entries.iter().map(|(_, n)| n).sum();
        if used + extra <= limit {
            return None;
        }
        let mut freed = 0;
        for (t, n) in entries {
            freed += n;
            if used - freed + extra <= limit {
                return Some(window.saturating_sub(now.duration_since(*t)));
            }
        }
        // Even an empty window would not fit `extra`; wait for all of it.
        entries
            .back()
            .map(|(t, _)| window.saturating_sub(now.duration_since(*t)))
    }
}

/// Sliding-window limiter for one provider/model pair.
#[derive(Debug)]
pub struct RateLimiter {
    limits: RateLimits,
    window: Duration,
    state: Mutex<Window>,
}

impl RateLimiter {
    pub fn new(limits: RateLimits) -> Self {
        Self::with_window(limits, DEFAULT_WINDOW)
    }

    pub fn with_window(limits: RateLimits, window: Duration) -> Self {
        Self {
            limits,
            window,
            state: Mutex::new(Window::default()),
        }
    }

    pub fn limits(&self) -> RateLimits {
        self.limits
    }

    /// Wait until one more request with `input_tokens` fits the window,
    /// then record it. A request larger than a whole window is let through
    /// once the window is empty.
    pub async fn acquire(&self, input_tokens: usize) {
        if self.limits.is_unlimited() {
            return;
        }
        loop {
            let wait = {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                let now = Instant::now();
                state.prune(now, self.window);
                let requests = if self.limits.requests > 0
                    && state.requests.len() >= self.limits.requests
                {
                    state
                        .requests
                        .front()
                        .map(|t| self.window.saturating_sub(now.duration_since(*t)))
                } else {
                    None
                };
                let wait = [
                    requests,
                    Window::wait_for(&state.input, self.limits.input_tokens, input_tokens, now, self.window),
                    Window::wait_for(&state.output, self.limits.output_tokens, 0, now, self.window),
                ]
                .into_iter()
                .flatten()
                .max();
                if wait.is_none() {
                    state.requests.push_back(now);
                    state.input.push_back((now, input_tokens));
                    return;
                }
                wait
            };
            if let Some(wait) = wait {
                debug!("Rate limit reached, waiting {wait:?}");
                tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
            }
        }
    }

    /// Record output tokens produced by a request.
    pub fn record_output(&self, tokens: usize) {
        if tokens == 0 || self.limits.output_tokens == 0 {
            return;
        }
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.output.push_back((Instant::now(), tokens));
    }
}

/// Process-wide set of limiters keyed by `provider\model`.
#[derive(Debug, Default)]
pub struct RateLimiterRegistry {
    limiters: Mutex<HashMap<String, Arc<RateLimiter>>>,
}

impl RateLimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the limiter for a provider/model pair, creating it with `limits`
    /// on first use. Later calls return the existing limiter unchanged.
    pub fn get(&self, provider: &str, model: &str, limits: RateLimits) -> Arc<RateLimiter> {
        let key = format!("{provider}\\{model}");
        let mut map = self.limiters.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(key)
            .or_insert_with(|| Arc::new(RateLimiter::new(limits)))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.limiters.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every limiter.
    pub fn reset(&self) {
        self.limiters.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

/// A [`ChatProvider`] that waits on a [`RateLimiter`] before each request
/// and records the output it streams.
pub struct RateLimited<P> {
    inner: P,
    limiter: Arc<RateLimiter>,
}

impl<P: ChatProvider> RateLimited<P> {
    pub fn new(inner: P, limiter: Arc<RateLimiter>) -> Self {
        Self { inner, limiter }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }
}

impl<P: ChatProvider> ChatProvider for RateLimited<P> {
    fn stream(&self, request: ChatRequest) -> ChunkStream<'_> {
        let input = request.estimated_input_tokens();
        let limiter = self.limiter.clone();
        let inner = &self.inner;
        let chunks = stream::once(async move {
            limiter.acquire(input).await;
            inner.stream(request)
        })
        .flatten();
        let limiter = self.limiter.clone();
        Box::pin(chunks.inspect(move |item| {
            if let Ok(chunk) = item {
                limiter.record_output(
                    approximate_tokens(&chunk.response_delta)
                        + approximate_tokens(&chunk.reasoning_delta),
                );
            }
        }))
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}
