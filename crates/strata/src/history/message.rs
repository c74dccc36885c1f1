use serde_json::{Map, Value, json};

use super::content::{
    MessageContent, OutputMessage, output_text, truncate_content, truncate_text,
};
use crate::error::{Error, Result};
use crate::tokens::approximate_tokens;

/// Summary assigned to an oversized raw message. Raw payloads cannot be
/// partially truncated without becoming invalid, so they are replaced whole.
pub const RAW_REPLACED_SUMMARY: &str = "Message content replaced to save space in context window";

/// Content given to a persisted message that lost its `content` field.
pub const CONTENT_LOST: &str = "Content lost";

/// A single turn from the user or the model.
///
/// `tokens` always reflects whichever of content/summary is shown in
/// [`output`](Self::output): once a summary is set it wins.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    is_ai: bool,
    content: MessageContent,
    summary: String,
    tokens: usize,
}

impl Message {
    pub fn new(is_ai: bool, content: impl Into<MessageContent>) -> Self {
        Self::with_tokens(is_ai, content, 0)
    }

    /// Create a message with a caller-supplied token count. Zero means
    /// "estimate it".
    pub fn with_tokens(is_ai: bool, content: impl Into<MessageContent>, tokens: usize) -> Self {
        let mut msg = Self {
            is_ai,
            content: content.into(),
            summary: String::new(),
            tokens,
        };
        if msg.tokens == 0 {
            msg.tokens = msg.calculate_tokens();
        }
        msg
    }

    pub fn is_ai(&self) -> bool {
        self.is_ai
    }

    pub fn content(&self) -> &MessageContent {
        &self.content
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    pub fn is_summarized(&self) -> bool {
        !self.summary.is_empty()
    }

    pub fn tokens(&self) -> usize {
        self.tokens
    }

    pub fn set_summary(&mut self, summary: impl Into<String>) {
        self.summary = summary.into();
        self.tokens = self.calculate_tokens();
    }

    pub fn output(&self) -> Vec<OutputMessage> {
        let content = if self.summary.is_empty() {
            self.content.clone()
        } else {
            MessageContent::Text(self.summary.clone())
        };
        vec![OutputMessage {
            is_ai: self.is_ai,
            content,
        }]
    }

    pub fn output_text(&self, human_label: &str, ai_label: &str) -> String {
        output_text(&self.output(), human_label, ai_label)
    }

    fn calculate_tokens(&self) -> usize {
        approximate_tokens(&self.output_text("user", "ai"))
    }

    /// Replace this message's visible content with a shortened version so it
    /// fits in `max_tokens`. Raw content gets [`RAW_REPLACED_SUMMARY`];
    /// anything else is truncated to within `tolerance` of the target length.
    /// The result always renders shorter than the original content.
    pub(crate) fn compact(&mut self, max_tokens: f64, tolerance: f64) {
        if self.content.is_raw() {
            self.set_summary(RAW_REPLACED_SUMMARY);
            return;
        }
        let rendered = self.output_text("user", "ai").chars().count();
        let target = rendered as f64 * (max_tokens / self.tokens.max(1) as f64);
        // Keys, quotes and labels are not truncatable text.
        let overhead = rendered.saturating_sub(self.content.text_chars()) as f64;
        let truncated = truncate_content(
            &self.content,
            target * (1.0 + tolerance) - overhead,
            target * (1.0 - tolerance) - overhead,
        );

        let original = self.content.to_text();
        let original_len = original.chars().count();
        let mut summary = truncated.to_text();
        if summary.chars().count() >= original_len {
            let keep = ((target * (1.0 - tolerance)).max(0.0) as usize)
                .min(original_len.saturating_sub(1));
            summary = truncate_text(&original, keep);
        }
        self.set_summary(summary);
    }

    pub(crate) fn to_value(&self) -> Value {
        json!({
            "_cls": "Message",
            "ai": self.is_ai,
            "content": self.content,
            "summary": self.summary,
            "tokens": self.tokens,
        })
    }

    pub(crate) fn from_map(data: &Map<String, Value>) -> Result<Self> {
        let is_ai = data
            .get("ai")
            .and_then(Value::as_bool)
            .ok_or_else(|| Error::Deserialize("message is missing boolean field `ai`".into()))?;
        let content = match data.get("content") {
            Some(value) => serde_json::from_value(value.clone())?,
            None => MessageContent::Text(CONTENT_LOST.into()),
        };
        let summary = data
            .get("summary")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let tokens = data.get("tokens").and_then(Value::as_u64).unwrap_or(0) as usize;

        let mut msg = Self {
            is_ai,
            content,
            summary,
            tokens,
        };
        if msg.tokens == 0 {
            msg.tokens = msg.calculate_tokens();
        }
        Ok(msg)
    }
}
