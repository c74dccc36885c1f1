//! Server-Sent Events (SSE) streaming for the OpenRouter chat completions API.
//!
//! [`ChatProvider`] is the seam between the agent and a model backend: it
//! turns a [`ChatRequest`] into a stream of [`ChatChunk`]s.
//! [`OpenRouterClient`] implements it by reading the response body
//! incrementally and decoding `data:` lines with [`SseDecoder`].

use std::collections::VecDeque;
use std::pin::Pin;

use futures::Stream;
use futures::stream;
use serde::Deserialize;
use tracing::{debug, trace, warn};

use super::chunks::ChatChunk;
use crate::error::{Error, Result};
use crate::{ChatRequest, OPENROUTER_URL, OpenRouterClient, UsageInfo};

/// Stream of chunks produced by a [`ChatProvider`].
pub type ChunkStream<'a> = Pin<Box<dyn Stream<Item = Result<ChatChunk>> + Send + 'a>>;

/// A streaming chat completion backend.
///
/// Errors before or during the stream are yielded as `Err` items; the
/// stream ends after the first error.
pub trait ChatProvider: Send + Sync {
    fn stream(&self, request: ChatRequest) -> ChunkStream<'_>;

    /// Provider name used to key rate limiters.
    fn name(&self) -> &str {
        "openrouter"
    }
}

/// Raw SSE data chunk from the OpenRouter API.
#[derive(Deserialize, Debug)]
struct StreamChunk {
    choices: Option<Vec<StreamChoice>>,
    usage: Option<UsageInfo>,
    error: Option<StreamError>,
}

#[derive(Deserialize, Debug)]
struct StreamChoice {
    delta: Option<StreamDelta>,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct StreamDelta {
    content: Option<String>,
    reasoning: Option<String>,
    reasoning_content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct StreamError {
    message: String,
    code: Option<u16>,
}

/// Incremental decoder for an SSE byte stream.
///
/// Bytes are buffered until a full line is available, so multi-byte
/// characters and `data:` lines split across network reads decode intact.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    pending: VecDeque<Result<ChatChunk>>,
    done: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `data: [DONE]` (or a stream error) has been seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Consume raw bytes from the wire.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
        while !self.done {
            let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') else {
                break;
            };
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.decode_line(&String::from_utf8_lossy(&line));
        }
    }

    /// Flush a trailing line that was not newline-terminated.
    pub fn finish(&mut self) {
        if !self.done && !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            self.decode_line(&String::from_utf8_lossy(&line));
        }
        self.done = true;
    }

    /// Next decoded chunk or error, if any.
    pub fn next_item(&mut self) -> Option<Result<ChatChunk>> {
        self.pending.pop_front()
    }

    fn decode_line(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() || line.starts_with(':') {
            return;
        }
        let Some(data) = line.strip_prefix("data:").map(str::trim_start) else {
            return;
        };
        if data == "[DONE]" {
            self.done = true;
            return;
        }
        match serde_json::from_str::<StreamChunk>(data) {
            Ok(chunk) => self.push_chunk(chunk),
            Err(e) => warn!("Failed to parse SSE chunk: {e} (data: {data})"),
        }
    }

    fn push_chunk(&mut self, chunk: StreamChunk) {
        if let Some(err) = chunk.error {
            self.pending
                .push_back(Err(Error::provider(err.message, err.code)));
            self.done = true;
            return;
        }
        if let Some(usage) = chunk.usage {
            trace!("Stream usage: {usage:?}");
        }
        for choice in chunk.choices.into_iter().flatten() {
            if let Some(delta) = choice.delta {
                let reasoning = delta
                    .reasoning
                    .filter(|r| !r.is_empty())
                    .or(delta.reasoning_content)
                    .unwrap_or_default();
                let out = ChatChunk {
                    response_delta: delta.content.unwrap_or_default(),
                    reasoning_delta: reasoning,
                };
                if !out.is_empty() {
                    self.pending.push_back(Ok(out));
                }
            }
            if let Some(reason) = choice.finish_reason {
                trace!("Stream finish_reason: {reason}");
            }
        }
    }
}

enum SseState {
    Start(ChatRequest),
    Reading {
        resp: reqwest::Response,
        decoder: SseDecoder,
    },
    Finished,
}

impl OpenRouterClient {
    async fn open_stream(&self, request: &ChatRequest) -> Result<reqwest::Response> {
        let mut body = serde_json::to_value(request)
            .map_err(|e| Error::provider(format!("failed to serialize request: {e}"), None))?;
        body["stream"] = serde_json::Value::Bool(true);

        debug!(
            "Sending streaming chat request: model={}, messages={}",
            request.model.as_deref().unwrap_or("(none)"),
            request.messages.len()
        );

        let resp = self
            .client
            .post(OPENROUTER_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("HTTP-Referer", &self.referer)
            .header("X-Title", &self.title)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::network(format!("streaming request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::provider(
                format!("OpenRouter API HTTP {status}: {text}"),
                Some(status.as_u16()),
            ));
        }
        Ok(resp)
    }

    async fn advance(&self, mut state: SseState) -> Option<(Result<ChatChunk>, SseState)> {
        loop {
            state = match state {
                SseState::Finished => return None,
                SseState::Start(request) => match self.open_stream(&request).await {
                    Ok(resp) => SseState::Reading {
                        resp,
                        decoder: SseDecoder::new(),
                    },
                    Err(e) => return Some((Err(e), SseState::Finished)),
                },
                SseState::Reading {
                    mut resp,
                    mut decoder,
                } => {
                    if let Some(item) = decoder.next_item() {
                        let next = if item.is_err() {
                            SseState::Finished
                        } else {
                            SseState::Reading { resp, decoder }
                        };
                        return Some((item, next));
                    }
                    if decoder.is_done() {
                        debug!("Stream completed");
                        return None;
                    }
                    match resp.chunk().await {
                        Ok(Some(bytes)) => decoder.feed(&bytes),
                        Ok(None) => decoder.finish(),
                        Err(e) => {
                            let err = Error::network(format!("failed to read streaming chunk: {e}"));
                            return Some((Err(err), SseState::Finished));
                        }
                    }
                    SseState::Reading { resp, decoder }
                }
            };
        }
    }
}

impl ChatProvider for OpenRouterClient {
    fn stream(&self, request: ChatRequest) -> ChunkStream<'_> {
        Box::pin(stream::unfold(SseState::Start(request), move |state| {
            self.advance(state)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(decoder: &mut SseDecoder) -> Vec<Result<ChatChunk>> {
        std::iter::from_fn(|| decoder.next_item()).collect()
    }

    #[test]
    fn decodes_content_and_reasoning() {
        let mut d = SseDecoder::new();
        d.feed(b"data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\n");
        d.feed(b"data: {\"choices\":[{\"delta\":{\"reasoning\":\"hmm\"}}]}\n");
        let items = drain(&mut d);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), &ChatChunk::response("Hello"));
        assert_eq!(items[1].as_ref().unwrap(), &ChatChunk::reasoning("hmm"));
    }

    #[test]
    fn reasoning_content_field_is_honoured() {
        let mut d = SseDecoder::new();
        d.feed(b"data: {\"choices\":[{\"delta\":{\"reasoning_content\":\"step 1\"}}]}\n");
        let items = drain(&mut d);
        assert_eq!(items[0].as_ref().unwrap().reasoning_delta, "step 1");
    }

    #[test]
    fn line_split_across_reads() {
        let mut d = SseDecoder::new();
        d.feed(b"data: {\"choices\":[{\"delta\":{\"con");
        assert!(drain(&mut d).is_empty());
        d.feed(b"tent\":\"ok\"}}]}\n");
        assert_eq!(drain(&mut d)[0].as_ref().unwrap().response_delta, "ok");
    }

    #[test]
    fn multibyte_char_split_across_reads() {
        let line = "data: {\"choices\":[{\"delta\":{\"content\":\"caf\u{e9}\"}}]}\n";
        let bytes = line.as_bytes();
        let split = line.find('\u{e9}').unwrap() + 1;
        let mut d = SseDecoder::new();
        d.feed(&bytes[..split]);
        d.feed(&bytes[split..]);
        assert_eq!(drain(&mut d)[0].as_ref().unwrap().response_delta, "caf\u{e9}");
    }

    #[test]
    fn done_marker_stops_decoding() {
        let mut d = SseDecoder::new();
        d.feed(b": keep-alive\ndata: [DONE]\ndata: {\"choices\":[{\"delta\":{\"content\":\"late\"}}]}\n");
        assert!(d.is_done());
        assert!(drain(&mut d).is_empty());
    }

    #[test]
    fn mid_stream_error_is_surfaced() {
        let mut d = SseDecoder::new();
        d.feed(b"data: {\"error\":{\"message\":\"overloaded\",\"code\":503}}\n");
        let items = drain(&mut d);
        let err = items[0].as_ref().unwrap_err();
        assert!(err.is_transient());
        assert!(d.is_done());
    }

    #[test]
    fn finish_flushes_unterminated_line() {
        let mut d = SseDecoder::new();
        d.feed(b"data: {\"choices\":[{\"delta\":{\"content\":\"tail\"}}]}");
        assert!(drain(&mut d).is_empty());
        d.finish();
        assert_eq!(drain(&mut d)[0].as_ref().unwrap().response_delta, "tail");
    }

    #[test]
    fn malformed_data_is_skipped() {
        let mut d = SseDecoder::new();
        d.feed(b"data: not json\n");
        assert!(drain(&mut d).is_empty());
        assert!(!d.is_done());
    }
}
