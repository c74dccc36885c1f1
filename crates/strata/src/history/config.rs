//! Budget ratios and compression knobs for a [`History`](super::History).

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Token budget policy for conversation history.
///
/// The history budget is `ctx_length × ctx_history`. Each tier (current
/// topic, closed topics, bulks) may use its ratio of that budget before the
/// compressor attacks it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Context window of the chat model, in tokens.
    pub ctx_length: usize,
    /// Fraction of the context window reserved for history.
    pub ctx_history: f64,
    pub current_topic_ratio: f64,
    pub history_topic_ratio: f64,
    pub history_bulk_ratio: f64,
    /// Fraction of a topic's middle messages folded into one summary per
    /// attention pass.
    pub topic_compress_ratio: f64,
    /// A message larger than this fraction of the current-topic budget is
    /// truncated before attention compaction is tried.
    pub large_message_ratio: f64,
    /// Band around the truncation target inside which no further cut is made.
    pub large_message_tolerance: f64,
    /// How many bulks are folded into one during a merge.
    pub bulk_merge_count: usize,
    /// Upper bound on compression passes within one `compress` call.
    pub max_compression_passes: usize,
    /// Consecutive passes without a token decrease before giving up.
    pub max_stalled_passes: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            ctx_length: 100_000,
            ctx_history: 0.7,
            current_topic_ratio: 0.5,
            history_topic_ratio: 0.3,
            history_bulk_ratio: 0.2,
            topic_compress_ratio: 0.65,
            large_message_ratio: 0.25,
            large_message_tolerance: 0.15,
            bulk_merge_count: 3,
            max_compression_passes: 64,
            max_stalled_passes: 4,
        }
    }
}

impl HistoryConfig {
    pub fn new(ctx_length: usize, ctx_history: f64) -> Self {
        Self {
            ctx_length,
            ctx_history,
            ..Self::default()
        }
    }

    pub fn with_tier_ratios(mut self, current: f64, topics: f64, bulks: f64) -> Self {
        self.current_topic_ratio = current;
        self.history_topic_ratio = topics;
        self.history_bulk_ratio = bulks;
        self
    }

    pub fn with_topic_compress_ratio(mut self, ratio: f64) -> Self {
        self.topic_compress_ratio = ratio;
        self
    }

    pub fn with_large_message_ratio(mut self, ratio: f64) -> Self {
        self.large_message_ratio = ratio;
        self
    }

    pub fn with_bulk_merge_count(mut self, count: usize) -> Self {
        self.bulk_merge_count = count;
        self
    }

    pub fn with_max_compression_passes(mut self, passes: usize) -> Self {
        self.max_compression_passes = passes;
        self
    }

    /// Total tokens history may occupy.
    pub fn history_budget(&self) -> f64 {
        self.ctx_length as f64 * self.ctx_history
    }

    /// Token size above which a current-topic message counts as large.
    pub fn large_message_limit(&self) -> f64 {
        self.history_budget() * self.current_topic_ratio * self.large_message_ratio
    }

    pub fn validate(&self) -> Result<()> {
        if self.ctx_length == 0 {
            return Err(Error::Config("ctx_length must be positive".into()));
        }
        let fractions = [
            ("ctx_history", self.ctx_history),
            ("current_topic_ratio", self.current_topic_ratio),
            ("history_topic_ratio", self.history_topic_ratio),
            ("history_bulk_ratio", self.history_bulk_ratio),
            ("topic_compress_ratio", self.topic_compress_ratio),
            ("large_message_ratio", self.large_message_ratio),
        ];
        for (name, value) in fractions {
            if !(value > 0.0 && value <= 1.0) {
                return Err(Error::Config(format!("{name} must be in (0, 1], got {value}")));
            }
        }
        if !(0.0..1.0).contains(&self.large_message_tolerance) {
            return Err(Error::Config(format!(
                "large_message_tolerance must be in [0, 1), got {}",
                self.large_message_tolerance
            )));
        }
        if self.bulk_merge_count < 2 {
            return Err(Error::Config(format!(
                "bulk_merge_count must be at least 2, got {}",
                self.bulk_merge_count
            )));
        }
        if self.max_compression_passes == 0 || self.max_stalled_passes == 0 {
            return Err(Error::Config("compression pass limits must be positive".into()));
        }
        Ok(())
    }
}
