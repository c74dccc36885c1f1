//! The closed set of history record kinds and their tagged persistence.
//!
//! Every record serializes to a JSON object discriminated by a `_cls` tag.
//! Decoding matches on that tag explicitly; an unknown tag, or a known tag
//! in a slot that expects a different kind, is a structural error. Missing
//! optional fields (summaries, lists, token counts) fall back to defaults.

use serde_json::{Map, Value};

use super::History;
use super::bulk::Bulk;
use super::config::HistoryConfig;
use super::content::{OutputMessage, output_text};
use super::message::Message;
use super::summarizer::{Summarizer, TOPIC_SUMMARY_PROMPT, render_for_summary};
use super::topic::Topic;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Message(Message),
    Topic(Topic),
    Bulk(Bulk),
    History(Box<History>),
}

impl Record {
    pub fn tokens(&self) -> usize {
        match self {
            Self::Message(m) => m.tokens(),
            Self::Topic(t) => t.tokens(),
            Self::Bulk(b) => b.tokens(),
            Self::History(h) => h.tokens(),
        }
    }

    pub fn output(&self) -> Vec<OutputMessage> {
        match self {
            Self::Message(m) => m.output(),
            Self::Topic(t) => t.output(),
            Self::Bulk(b) => b.output(),
            Self::History(h) => h.output(),
        }
    }

    pub fn output_text(&self, human_label: &str, ai_label: &str) -> String {
        output_text(&self.output(), human_label, ai_label)
    }

    /// Compress this record in place. Messages and bulks have no
    /// record-level compaction and report `false`.
    pub async fn compress<S>(&mut self, config: &HistoryConfig, summarizer: &S) -> Result<bool>
    where
        S: Summarizer + ?Sized,
    {
        match self {
            Self::Message(_) | Self::Bulk(_) => Ok(false),
            Self::Topic(t) => t.compress(config, summarizer).await,
            Self::History(h) => h.compress(summarizer).await,
        }
    }

    /// Summarize this record. Topics and bulks keep the summary; messages
    /// and whole histories only return it.
    pub async fn summarize<S>(&mut self, summarizer: &S) -> Result<String>
    where
        S: Summarizer + ?Sized,
    {
        match self {
            Self::Topic(t) => t.summarize(summarizer).await,
            Self::Bulk(b) => b.summarize(summarizer).await,
            Self::Message(_) | Self::History(_) => {
                let lines: Vec<String> = self
                    .output()
                    .iter()
                    .map(|o| output_text(std::slice::from_ref(o), "user", "ai"))
                    .collect();
                summarizer
                    .summarize(TOPIC_SUMMARY_PROMPT, &render_for_summary(&lines))
                    .await
            }
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Message(m) => m.to_value(),
            Self::Topic(t) => t.to_value(),
            Self::Bulk(b) => b.to_value(),
            Self::History(h) => h.to_value(),
        }
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        let (cls, data) = tagged(value)?;
        match cls {
            "Message" => Ok(Self::Message(Message::from_map(data)?)),
            "Topic" => Ok(Self::Topic(Topic::from_map(data)?)),
            "Bulk" => Ok(Self::Bulk(Bulk::from_map(data)?)),
            "History" => Ok(Self::History(Box::new(History::from_map(
                data,
                HistoryConfig::default(),
            )?))),
            other => Err(Error::Deserialize(format!("unknown record tag `{other}`"))),
        }
    }
}

fn tagged(value: &Value) -> Result<(&str, &Map<String, Value>)> {
    let data = value
        .as_object()
        .ok_or_else(|| Error::Deserialize("record is not an object".into()))?;
    let cls = data
        .get("_cls")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Deserialize("record is missing its `_cls` tag".into()))?;
    Ok((cls, data))
}

/// Decode `value` as an object tagged `cls`.
pub(crate) fn expect_cls<'a>(value: &'a Value, cls: &str) -> Result<&'a Map<String, Value>> {
    let (found, data) = tagged(value)?;
    if found != cls {
        return Err(Error::Deserialize(format!(
            "expected a `{cls}` record, found `{found}`"
        )));
    }
    Ok(data)
}

/// A list field that defaults to empty when absent.
pub(crate) fn list_field<'a>(data: &'a Map<String, Value>, key: &str) -> Result<&'a [Value]> {
    match data.get(key) {
        None | Some(Value::Null) => Ok(&[]),
        Some(Value::Array(items)) => Ok(items),
        Some(_) => Err(Error::Deserialize(format!("`{key}` must be a list"))),
    }
}
