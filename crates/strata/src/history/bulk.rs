use serde_json::{Map, Value, json};

use super::content::{OutputMessage, output_text};
use super::record::{Record, list_field};
use super::summarizer::{Summarizer, render_for_summary};
use super::topic::{Topic, summarize_checked};
use crate::error::Result;
use crate::tokens::approximate_tokens;

/// The oldest, most compacted tier: evicted topics and previously merged
/// bulks, represented to the model by their summary.
#[derive(Debug, Clone, PartialEq)]
pub struct Bulk {
    pub(crate) id: u64,
    summary: String,
    records: Vec<Record>,
}

impl Default for Bulk {
    fn default() -> Self {
        Self::new()
    }
}

impl Bulk {
    pub fn new() -> Self {
        Self::with_id(0)
    }

    pub(crate) fn with_id(id: u64) -> Self {
        Self {
            id,
            summary: String::new(),
            records: Vec::new(),
        }
    }

    /// Wrap a closed topic, reusing its summary when it has one.
    pub(crate) fn from_topic(id: u64, topic: Topic) -> Self {
        let summary = topic.summary().to_string();
        Self {
            id,
            summary,
            records: vec![Record::Topic(topic)],
        }
    }

    pub(crate) fn merged(id: u64, group: Vec<Bulk>, summary: String) -> Self {
        Self {
            id,
            summary,
            records: group.into_iter().map(Record::Bulk).collect(),
        }
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    pub fn set_summary(&mut self, summary: impl Into<String>) {
        self.summary = summary.into();
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn push(&mut self, record: Record) {
        self.records.push(record);
    }

    pub fn tokens(&self) -> usize {
        if self.summary.is_empty() {
            self.records.iter().map(Record::tokens).sum()
        } else {
            approximate_tokens(&self.summary)
        }
    }

    pub fn output(&self) -> Vec<OutputMessage> {
        if self.summary.is_empty() {
            self.records.iter().flat_map(Record::output).collect()
        } else {
            vec![OutputMessage::new(false, self.summary.clone())]
        }
    }

    pub fn output_text(&self, human_label: &str, ai_label: &str) -> String {
        output_text(&self.output(), human_label, ai_label)
    }

    pub(crate) fn summary_input(&self) -> String {
        bulk_summary_input(std::slice::from_ref(self))
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
            "_cls": "Bulk",
            "summary": self.summary,
            "records": self.records.iter().map(Record::to_value).collect::<Vec<_>>(),
        })
    }

    pub(crate) fn from_map(data: &Map<String, Value>) -> Result<Self> {
        let records = list_field(data, "records")?
            .iter()
            .map(Record::from_value)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            id: 0,
            summary: data
                .get("summary")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            records,
        })
    }
}

/// Summarization payload for a group of bulks about to be merged.
pub(crate) fn bulk_summary_input(group: &[Bulk]) -> String {
    let lines: Vec<String> = group
        .iter()
        .flat_map(Bulk::output)
        .map(|out| output_text(std::slice::from_ref(&out), "user", "ai"))
        .collect();
    render_for_summary(&lines)
}
