use serde_json::{Map, Value, json};
use tracing::debug;

use super::config::HistoryConfig;
use super::content::{MessageContent, OutputMessage, output_text};
use super::message::Message;
use super::record::{expect_cls, list_field};
use super::summarizer::{Summarizer, TOPIC_SUMMARY_PROMPT, render_for_summary};
use crate::error::{Error, Result};
use crate::tokens::approximate_tokens;

/// Key of the mapping that carries an attention summary.
pub const MESSAGES_SUMMARY_KEY: &str = "messages_summary";

/// One coherent sub-conversation: an ordered run of messages, optionally
/// replaced by a summary once closed.
#[derive(Debug, Clone, PartialEq)]
pub struct Topic {
    pub(crate) id: u64,
    summary: String,
    messages: Vec<Message>,
}

impl Default for Topic {
    fn default() -> Self {
        Self::new()
    }
}

impl Topic {
    pub fn new() -> Self {
        Self::with_id(0)
    }

    pub(crate) fn with_id(id: u64) -> Self {
        Self {
            id,
            summary: String::new(),
            messages: Vec::new(),
        }
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    pub fn is_summarized(&self) -> bool {
        !self.summary.is_empty()
    }

    pub fn set_summary(&mut self, summary: impl Into<String>) {
        self.summary = summary.into();
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn add_message(&mut self, message: Message) -> &Message {
        self.messages.push(message);
        &self.messages[self.messages.len() - 1]
    }

    /// Summary tokens once summarized, otherwise the sum over messages.
    pub fn tokens(&self) -> usize {
        if self.is_summarized() {
            approximate_tokens(&self.summary)
        } else {
            self.messages.iter().map(Message::tokens).sum()
        }
    }

    pub fn output(&self) -> Vec<OutputMessage> {
        if self.is_summarized() {
            vec![OutputMessage::new(false, self.summary.clone())]
        } else {
            self.messages.iter().flat_map(Message::output).collect()
        }
    }

    pub fn output_text(&self, human_label: &str, ai_label: &str) -> String {
        output_text(&self.output(), human_label, ai_label)
    }

    /// Summarization payload for the whole topic.
    pub(crate) fn summary_input(&self) -> String {
        summary_input(&self.messages)
    }

    /// Truncate the single largest unsummarized message above the
    /// large-message limit. Returns whether one was compacted.
    pub fn compress_large_messages(&mut self, config: &HistoryConfig) -> bool {
        let limit = config.large_message_limit();
        let mut largest: Option<(usize, usize)> = None;
        for (idx, msg) in self.messages.iter().enumerate() {
            if msg.is_summarized() || (msg.tokens() as f64) <= limit {
                continue;
            }
            if largest.is_none_or(|(_, tokens)| msg.tokens() > tokens) {
                largest = Some((idx, msg.tokens()));
            }
        }
        let Some((idx, tokens)) = largest else {
            return false;
        };
        let msg = &mut self.messages[idx];
        msg.compact(limit, config.large_message_tolerance);
        debug!(
            "Compacted large message #{idx}: {tokens} -> {} tokens",
            msg.tokens()
        );
        true
    }

    /// Number of messages after the anchor that an attention pass folds
    /// into one summary, or `None` if two or fewer messages remain.
    pub(crate) fn attention_span(&self, config: &HistoryConfig) -> Option<usize> {
        let n = self.messages.len();
        if n <= 2 {
            return None;
        }
        let count = ((n - 2) as f64 * config.topic_compress_ratio).ceil() as usize;
        Some(count.clamp(1, n - 1))
    }

    pub(crate) fn attention_input(&self, count: usize) -> String {
        summary_input(&self.messages[1..1 + count])
    }

    /// Token sum of the attention slice, used to detect concurrent edits.
    pub(crate) fn span_tokens(&self, count: usize) -> Option<usize> {
        self.messages
            .get(1..1 + count)
            .map(|span| span.iter().map(Message::tokens).sum())
    }

    /// Replace messages `1..=count` with one synthetic summary message.
    pub(crate) fn apply_attention(&mut self, count: usize, summary: String) {
        let mut content = indexmap::IndexMap::new();
        content.insert(MESSAGES_SUMMARY_KEY.to_string(), MessageContent::Text(summary));
        let summary_msg = Message::new(false, MessageContent::Map(content));
        self.messages.splice(1..1 + count, [summary_msg]);
    }

    /// Large-message compaction first, then attention compaction.
    pub async fn compress<S>(&mut self, config: &HistoryConfig, summarizer: &S) -> Result<bool>
    where
        S: Summarizer + ?Sized,
    {
        if self.compress_large_messages(config) {
            return Ok(true);
        }
        let Some(count) = self.attention_span(config) else {
            return Ok(false);
        };
        let summary = summarize_checked(summarizer, &self.attention_input(count)).await?;
        self.apply_attention(count, summary);
        Ok(true)
    }

    pub async fn summarize<S>(&mut self, summarizer: &S) -> Result<String>
    where
        S: Summarizer + ?Sized,
    {
        let summary = summarize_checked(summarizer, &self.summary_input()).await?;
        self.summary = summary.clone();
        Ok(summary)
    }

    pub(crate) fn to_value(&self) -> Value {
        json!({
            "_cls": "Topic",
            "summary": self.summary,
            "messages": self.messages.iter().map(Message::to_value).collect::<Vec<_>>(),
        })
    }

    pub(crate) fn from_map(data: &Map<String, Value>) -> Result<Self> {
        let mut messages = Vec::new();
        for item in list_field(data, "messages")? {
            let obj = expect_cls(item, "Message")?;
            messages.push(Message::from_map(obj)?);
        }
        Ok(Self {
            id: 0,
            summary: data
                .get("summary")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            messages,
        })
    }
}

fn summary_input(messages: &[Message]) -> String {
    let lines: Vec<String> = messages.iter().map(|m| m.output_text("user", "ai")).collect();
    render_for_summary(&lines)
}

/// Call the summarizer and reject blank replies.
pub(crate) async fn summarize_checked<S>(summarizer: &S, content: &str) -> Result<String>
where
    S: Summarizer + ?Sized,
{
    let summary = summarizer.summarize(TOPIC_SUMMARY_PROMPT, content).await?;
    let summary = summary.trim();
    if summary.is_empty() {
        return Err(Error::Summarization("summarizer returned an empty summary".into()));
    }
    Ok(summary.to_string())
}
