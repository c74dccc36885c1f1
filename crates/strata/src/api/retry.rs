//! Bounded retry of streaming completions.
//!
//! A transient failure (timeout, connection error, 408, 429, 5xx) is retried
//! with a fixed delay, but only while the stream has produced nothing: once
//! any chunk has been delivered the failure is surfaced, since a partial
//! stream cannot be resumed safely.

use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::chunks::{ChatChunk, ChunkParser, ThinkingTags, default_thinking_tags};
use super::streaming::ChatProvider;
use crate::ChatRequest;
use crate::error::{Error, Result};

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retries (0 = fail on the first error).
    pub max_retries: u32,
    /// Fixed delay before each retry.
    #[serde(with = "secs_f64")]
    pub delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            delay: Duration::from_millis(1500),
        }
    }
}

impl RetryConfig {
    pub fn with_retries(retries: u32) -> Self {
        Self {
            max_retries: retries,
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

mod secs_f64 {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// Progress reported while streaming.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Displayable text from one chunk, already split by the [`ChunkParser`].
    Delta(ChatChunk),
    /// A transient failure before any output; another attempt follows.
    Retrying {
        attempt: u32,
        delay: Duration,
        error: Error,
    },
}

/// Final text of a completed stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamOutput {
    pub response: String,
    pub reasoning: String,
}

/// Stream a completion, splitting reasoning from response and retrying
/// transient failures that happen before the first chunk.
pub async fn stream_with_retry<P, F>(
    provider: &P,
    request: &ChatRequest,
    config: &RetryConfig,
    on_event: F,
) -> Result<StreamOutput>
where
    P: ChatProvider + ?Sized,
    F: FnMut(&StreamEvent),
{
    stream_with_retry_tags(provider, request, config, default_thinking_tags(), on_event).await
}

/// [`stream_with_retry`] with custom inline thinking tags.
pub async fn stream_with_retry_tags<P, F>(
    provider: &P,
    request: &ChatRequest,
    config: &RetryConfig,
    tags: Vec<ThinkingTags>,
    mut on_event: F,
) -> Result<StreamOutput>
where
    P: ChatProvider + ?Sized,
    F: FnMut(&StreamEvent),
{
    let mut attempt = 0;
    loop {
        let mut parser = ChunkParser::with_tags(tags.clone());
        let mut got_any = false;
        let mut failure = None;

        let mut stream = provider.stream(request.clone());
        while let Some(item) = stream.next().await {
            match item {
                Ok(chunk) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    got_any = true;
                    let shown = parser.add_chunk(&chunk);
                    if !shown.is_empty() {
                        on_event(&StreamEvent::Delta(shown));
                    }
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        drop(stream);

        let Some(error) = failure else {
            let out = parser.output();
            return Ok(StreamOutput {
                response: out.response_delta,
                reasoning: out.reasoning_delta,
            });
        };
        if got_any || !error.is_transient() || attempt >= config.max_retries {
            return Err(error);
        }
        attempt += 1;
        warn!(
            "Transient provider error (attempt {attempt}/{}), retrying in {:?}: {error}",
            config.max_retries, config.delay
        );
        on_event(&StreamEvent::Retrying {
            attempt,
            delay: config.delay,
            error,
        });
        tokio::time::sleep(config.delay).await;
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedProvider;
    use super::*;

    fn fast() -> RetryConfig {
        RetryConfig::default().with_delay(Duration::from_millis(1))
    }

    #[test]
    fn default_config() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.delay, Duration::from_millis(1500));
    }

    #[test]
    fn config_from_json_seconds() {
        let config: RetryConfig = serde_json::from_str(r#"{"delay": 0.25}"#).unwrap();
        assert_eq!(config.delay, Duration::from_millis(250));
        assert_eq!(config.max_retries, 2);
    }

    #[tokio::test]
    async fn splits_inline_reasoning() {
        let provider = ScriptedProvider::replying(&["<thi", "nk>plan</think>", "answer"], 1);
        let mut shown = Vec::new();
        let out = stream_with_retry(&provider, &ChatRequest::default(), &fast(), |ev| {
            shown.push(ev.clone())
        })
        .await
        .unwrap();
        assert_eq!(out.reasoning, "plan");
        assert_eq!(out.response, "answer");
        assert!(shown.iter().all(|ev| matches!(ev, StreamEvent::Delta(_))));
    }

    #[tokio::test]
    async fn transient_error_before_output_is_retried() {
        let provider = ScriptedProvider::new(vec![
            vec![Err(Error::provider("overloaded", Some(503)))],
            vec![Err(Error::network("connection reset"))],
            vec![Ok(ChatChunk::response("ok"))],
        ]);
        let mut retries = 0;
        let out = stream_with_retry(&provider, &ChatRequest::default(), &fast(), |ev| {
            if matches!(ev, StreamEvent::Retrying { .. }) {
                retries += 1;
            }
        })
        .await
        .unwrap();
        assert_eq!(out.response, "ok");
        assert_eq!(retries, 2);
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let provider = ScriptedProvider::new(vec![
            vec![Err(Error::provider("rate limited", Some(429)))];
            5
        ]);
        let err = stream_with_retry(&provider, &ChatRequest::default(), &fast(), |_| {})
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn permanent_error_is_not_retried() {
        let provider = ScriptedProvider::new(vec![
            vec![Err(Error::provider("bad request", Some(400)))],
            vec![Ok(ChatChunk::response("never"))],
        ]);
        let err = stream_with_retry(&provider, &ChatRequest::default(), &fast(), |_| {})
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn failure_after_output_is_surfaced() {
        let provider = ScriptedProvider::new(vec![
            vec![
                Ok(ChatChunk::response("partial")),
                Err(Error::network("connection reset")),
            ],
            vec![Ok(ChatChunk::response("full"))],
        ]);
        let mut seen = String::new();
        let err = stream_with_retry(&provider, &ChatRequest::default(), &fast(), |ev| {
            if let StreamEvent::Delta(c) = ev {
                seen.push_str(&c.response_delta);
            }
        })
        .await
        .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(seen, "partial");
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn native_reasoning_passes_through() {
        let provider = ScriptedProvider::new(vec![vec![
            Ok(ChatChunk::reasoning("thinking")),
            Ok(ChatChunk::response("<think>literal</think>")),
        ]]);
        let out = stream_with_retry(&provider, &ChatRequest::default(), &fast(), |_| {})
            .await
            .unwrap();
        assert_eq!(out.reasoning, "thinking");
        assert_eq!(out.response, "<think>literal</think>");
    }
}
