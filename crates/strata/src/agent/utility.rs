//! History summaries written by a utility model.

use tracing::debug;

use crate::api::{ChatProvider, RetryConfig, stream_with_retry};
use crate::error::{Error, Result};
use crate::history::Summarizer;
use crate::history::summarizer::SummaryFuture;
use crate::{ChatMessage, ChatRequest};

/// A [`Summarizer`] that asks a chat model for the summary.
///
/// Only the response channel is kept; reasoning the model emits is
/// discarded. Provider failures surface as [`Error::Summarization`] so the
/// compressor leaves the targeted records intact.
pub struct UtilitySummarizer<P> {
    provider: P,
    model: String,
    max_tokens: u32,
    retry: RetryConfig,
}

impl<P: ChatProvider> UtilitySummarizer<P> {
    pub fn new(provider: P, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            max_tokens: 0,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn request_summary(&self, request: ChatRequest) -> Result<String> {
        let out = stream_with_retry(&self.provider, &request, &self.retry, |_| {})
            .await
            .map_err(|e| Error::Summarization(e.to_string()))?;
        debug!(
            "Utility model {} returned {} chars",
            self.model,
            out.response.len()
        );
        Ok(out.response)
    }
}

impl<P: ChatProvider> Summarizer for UtilitySummarizer<P> {
    fn summarize(&self, system: &str, content: &str) -> SummaryFuture<'_> {
        let request = ChatRequest {
            model: Some(self.model.clone()),
            messages: vec![ChatMessage::system(system), ChatMessage::user(content)],
            max_tokens: self.max_tokens,
            temperature: 0.0,
        };
        Box::pin(self.request_summary(request))
    }
}
