//! Token-budgeted conversation memory.
//!
//! A [`History`] keeps three tiers of records, newest and most detailed
//! first:
//!
//! | Tier | Holds | Default share of the budget |
//! |------|-------|-----------------------------|
//! | current topic | verbatim messages of the ongoing sub-conversation | 50% |
//! | topics | closed topics, summarized in place when over budget | 30% |
//! | bulks | evicted topics and merged bulks, represented by summaries | 20% |
//!
//! The budget itself is `ctx_length × ctx_history` from [`HistoryConfig`].
//! [`History::compress`] (or [`compress_with`] over a [`SharedHistory`])
//! repeatedly attacks the tier that is furthest over its relative share
//! until every tier fits or no further progress is possible.

pub mod bulk;
pub mod compress;
pub mod config;
pub mod content;
pub mod message;
pub mod record;
pub mod summarizer;
pub mod topic;

pub use bulk::Bulk;
pub use compress::{HistoryAccess, SharedHistory, Tier, TierUsage, compress_with};
pub use config::HistoryConfig;
pub use content::{MessageContent, OutputMessage, RawContent};
pub use message::Message;
pub use record::Record;
pub use summarizer::Summarizer;
pub use topic::Topic;

use serde_json::{Map, Value, json};

use self::content::{group_outputs_abab, output_text};
use self::record::{expect_cls, list_field};
use crate::ChatMessage;
use crate::error::Result;

/// The aggregate root of conversation memory.
#[derive(Debug, Clone, PartialEq)]
pub struct History {
    bulks: Vec<Bulk>,
    topics: Vec<Topic>,
    current: Topic,
    counter: u64,
    config: HistoryConfig,
    /// Identity source for topics and bulks, used to detect concurrent
    /// edits between planning and applying a compression step.
    next_id: u64,
}

impl Default for History {
    fn default() -> Self {
        Self::new(HistoryConfig::default())
    }
}

impl History {
    pub fn new(config: HistoryConfig) -> Self {
        Self {
            bulks: Vec::new(),
            topics: Vec::new(),
            current: Topic::with_id(1),
            counter: 0,
            config,
            next_id: 2,
        }
    }

    pub fn config(&self) -> &HistoryConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: HistoryConfig) {
        self.config = config;
    }

    /// Number of messages ever added. Informational only.
    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn bulks(&self) -> &[Bulk] {
        &self.bulks
    }

    pub fn topics(&self) -> &[Topic] {
        &self.topics
    }

    pub fn current(&self) -> &Topic {
        &self.current
    }

    pub(crate) fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Append a message to the current topic.
    pub fn add_message(&mut self, is_ai: bool, content: impl Into<MessageContent>) -> &Message {
        self.add_message_with_tokens(is_ai, content, 0)
    }

    /// Append a message with a pre-computed token count (zero estimates it).
    pub fn add_message_with_tokens(
        &mut self,
        is_ai: bool,
        content: impl Into<MessageContent>,
        tokens: usize,
    ) -> &Message {
        self.counter += 1;
        self.current
            .add_message(Message::with_tokens(is_ai, content, tokens))
    }

    /// Close the current topic and open a fresh one. Does nothing while the
    /// current topic is empty.
    pub fn new_topic(&mut self) {
        if self.current.is_empty() {
            return;
        }
        let id = self.alloc_id();
        let closed = std::mem::replace(&mut self.current, Topic::with_id(id));
        self.topics.push(closed);
    }

    pub fn tokens(&self) -> usize {
        self.bulks_tokens() + self.topics_tokens() + self.current_topic_tokens()
    }

    pub fn bulks_tokens(&self) -> usize {
        self.bulks.iter().map(Bulk::tokens).sum()
    }

    pub fn topics_tokens(&self) -> usize {
        self.topics.iter().map(Topic::tokens).sum()
    }

    pub fn current_topic_tokens(&self) -> usize {
        self.current.tokens()
    }

    /// Whether the whole history exceeds its share of the context window.
    pub fn is_over_limit(&self) -> bool {
        self.tokens() as f64 > self.config.history_budget()
    }

    /// Bulks, then closed topics, then the current topic.
    pub fn output(&self) -> Vec<OutputMessage> {
        let mut out: Vec<OutputMessage> = self.bulks.iter().flat_map(Bulk::output).collect();
        out.extend(self.topics.iter().flat_map(Topic::output));
        out.extend(self.current.output());
        out
    }

    pub fn output_text(&self, human_label: &str, ai_label: &str) -> String {
        output_text(&self.output(), human_label, ai_label)
    }

    /// Alternating user/assistant messages ready for a chat request.
    pub fn to_chat_messages(&self) -> Vec<ChatMessage> {
        group_outputs_abab(self.output())
            .into_iter()
            .map(|out| {
                let text = out.content.to_text();
                if out.is_ai {
                    ChatMessage::assistant(text)
                } else {
                    ChatMessage::user(text)
                }
            })
            .collect()
    }

    /// Compress until every tier fits its share or no progress is possible.
    /// Returns whether the total token count went down.
    pub async fn compress<S>(&mut self, summarizer: &S) -> Result<bool>
    where
        S: Summarizer + ?Sized,
    {
        compress_with(self, summarizer).await
    }

    pub fn to_value(&self) -> Value {
        json!({
            "_cls": "History",
            "counter": self.counter,
            "bulks": self.bulks.iter().map(Bulk::to_value).collect::<Vec<_>>(),
            "topics": self.topics.iter().map(Topic::to_value).collect::<Vec<_>>(),
            "current": self.current.to_value(),
        })
    }

    pub fn serialize(&self) -> String {
        self.to_value().to_string()
    }

    /// Restore a history from [`serialize`](Self::serialize) output. Blank
    /// input yields an empty history.
    pub fn deserialize(json: &str, config: HistoryConfig) -> Result<Self> {
        if json.trim().is_empty() {
            return Ok(Self::new(config));
        }
        let value: Value = serde_json::from_str(json)?;
        Self::from_value(&value, config)
    }

    pub fn from_value(value: &Value, config: HistoryConfig) -> Result<Self> {
        Self::from_map(expect_cls(value, "History")?, config)
    }

    pub(crate) fn from_map(data: &Map<String, Value>, config: HistoryConfig) -> Result<Self> {
        let mut history = Self::new(config);
        history.counter = data.get("counter").and_then(Value::as_u64).unwrap_or(0);
        for item in list_field(data, "bulks")? {
            let mut bulk = Bulk::from_map(expect_cls(item, "Bulk")?)?;
            bulk.id = history.alloc_id();
            history.bulks.push(bulk);
        }
        for item in list_field(data, "topics")? {
            let mut topic = Topic::from_map(expect_cls(item, "Topic")?)?;
            topic.id = history.alloc_id();
            history.topics.push(topic);
        }
        if let Some(current) = data.get("current") {
            history.current = Topic::from_map(expect_cls(current, "Topic")?)?;
            history.current.id = history.alloc_id();
        }
        Ok(history)
    }
}
