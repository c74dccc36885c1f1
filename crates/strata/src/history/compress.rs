//! The tier-balancing compression driver.
//!
//! Each pass picks the tier furthest over its relative allowance and plans
//! one step against it. Purely local steps (truncating a large message,
//! evicting a summarized topic into a bulk) are applied immediately. Steps
//! that need the summarizer run in three phases:
//!
//! 1. plan under the history lock, capturing record identities;
//! 2. summarize with the lock released, so the agent can keep appending;
//! 3. apply under the lock after re-validating those identities. A step
//!    whose records changed in between is dropped and re-planned.
//!
//! Every mutation happens inside one lock scope, so a cancelled compression
//! leaves each record either untouched or fully replaced.

use std::sync::{Arc, Mutex};

use futures::future::try_join_all;
use tracing::{debug, info, warn};

use super::History;
use super::bulk::{Bulk, bulk_summary_input};
use super::summarizer::Summarizer;
use super::topic::summarize_checked;
use crate::error::Result;
use crate::tokens::approximate_tokens;

/// A history shared between the agent turn and background compression.
pub type SharedHistory = Arc<Mutex<History>>;

/// Scoped mutable access to a history, either owned directly or behind a
/// lock shared with other tasks.
pub trait HistoryAccess {
    fn with_history<R>(&mut self, f: impl FnOnce(&mut History) -> R) -> R;
}

impl HistoryAccess for &mut History {
    fn with_history<R>(&mut self, f: impl FnOnce(&mut History) -> R) -> R {
        f(&mut **self)
    }
}

impl HistoryAccess for SharedHistory {
    fn with_history<R>(&mut self, f: impl FnOnce(&mut History) -> R) -> R {
        let mut guard = self.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    CurrentTopic,
    Topics,
    Bulks,
}

/// Token usage of one tier against its allowance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TierUsage {
    pub tier: Tier,
    pub tokens: usize,
    /// `ratio × history budget`.
    pub allowance: f64,
    pub ratio: f64,
}

impl TierUsage {
    pub fn is_over(&self) -> bool {
        self.tokens as f64 > self.allowance
    }

    /// Share of the whole budget used, relative to the tier's own ratio.
    pub fn pressure(&self, budget: f64) -> f64 {
        if budget <= 0.0 || self.ratio <= 0.0 {
            return 0.0;
        }
        (self.tokens as f64 / budget) / self.ratio
    }
}

enum Plan {
    Idle,
    Applied(Progress),
    Pending(Job),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
    /// Tokens were removed or replaced by a summary.
    Shrunk,
    /// A record moved between tiers without changing the total.
    Moved,
}

enum Job {
    Attention {
        topic_id: u64,
        count: usize,
        span_tokens: usize,
        input: String,
    },
    SummarizeTopic {
        topic_id: u64,
        input: String,
    },
    MergeBulks {
        bulk_ids: Vec<u64>,
        inputs: Vec<String>,
    },
}

impl Job {
    async fn run<S>(&self, summarizer: &S) -> Result<Vec<String>>
    where
        S: Summarizer + ?Sized,
    {
        match self {
            Job::Attention { input, .. } | Job::SummarizeTopic { input, .. } => {
                Ok(vec![summarize_checked(summarizer, input).await?])
            }
            Job::MergeBulks { inputs, .. } => {
                try_join_all(inputs.iter().map(|input| summarize_checked(summarizer, input))).await
            }
        }
    }
}

impl History {
    /// Tiers ordered by pressure, highest first.
    pub fn ranked_tiers(&self) -> [TierUsage; 3] {
        let budget = self.config.history_budget();
        let usage = |tier, tokens, ratio: f64| TierUsage {
            tier,
            tokens,
            allowance: ratio * budget,
            ratio,
        };
        let mut tiers = [
            usage(
                Tier::CurrentTopic,
                self.current_topic_tokens(),
                self.config.current_topic_ratio,
            ),
            usage(Tier::Topics, self.topics_tokens(), self.config.history_topic_ratio),
            usage(Tier::Bulks, self.bulks_tokens(), self.config.history_bulk_ratio),
        ];
        tiers.sort_by(|a, b| b.pressure(budget).total_cmp(&a.pressure(budget)));
        tiers
    }

    fn plan_step(&mut self) -> Plan {
        for usage in self.ranked_tiers() {
            if !usage.is_over() {
                continue;
            }
            let plan = match usage.tier {
                Tier::CurrentTopic => self.plan_current_topic(),
                Tier::Topics => self.plan_topics(),
                Tier::Bulks => self.plan_bulks(),
            };
            if !matches!(plan, Plan::Idle) {
                debug!(
                    "Compressing {:?}: {} tokens over allowance {:.0}",
                    usage.tier, usage.tokens, usage.allowance
                );
                return plan;
            }
        }
        Plan::Idle
    }

    fn plan_current_topic(&mut self) -> Plan {
        if self.current.compress_large_messages(&self.config) {
            return Plan::Applied(Progress::Shrunk);
        }
        let Some(count) = self.current.attention_span(&self.config) else {
            return Plan::Idle;
        };
        Plan::Pending(Job::Attention {
            topic_id: self.current.id,
            count,
            span_tokens: self.current.span_tokens(count).unwrap_or_default(),
            input: self.current.attention_input(count),
        })
    }

    /// Summarize the oldest unsummarized closed topic; once all are
    /// summarized, evict the oldest into a bulk.
    fn plan_topics(&mut self) -> Plan {
        if let Some(topic) = self.topics.iter().find(|t| !t.is_summarized()) {
            return Plan::Pending(Job::SummarizeTopic {
                topic_id: topic.id,
                input: topic.summary_input(),
            });
        }
        if self.topics.is_empty() {
            return Plan::Idle;
        }
        let topic = self.topics.remove(0);
        let id = self.alloc_id();
        debug!("Evicting topic {} into bulk {id}", topic.id);
        self.bulks.push(Bulk::from_topic(id, topic));
        Plan::Applied(Progress::Moved)
    }

    fn plan_bulks(&mut self) -> Plan {
        if self.bulks.is_empty() {
            return Plan::Idle;
        }
        let n = self.config.bulk_merge_count;
        Plan::Pending(Job::MergeBulks {
            bulk_ids: self.bulks.iter().map(|b| b.id).collect(),
            inputs: self.bulks.chunks(n).map(bulk_summary_input).collect(),
        })
    }

    /// Apply a finished job. `None` means the records it was planned
    /// against have changed and the summaries were discarded.
    fn apply(&mut self, job: Job, summaries: Vec<String>) -> Option<Progress> {
        let mut summaries = summaries.into_iter();
        match job {
            Job::Attention {
                topic_id,
                count,
                span_tokens,
                ..
            } => {
                if self.current.id != topic_id
                    || self.current.span_tokens(count) != Some(span_tokens)
                {
                    warn!("Current topic changed during attention compaction, discarding summary");
                    return None;
                }
                self.current.apply_attention(count, summaries.next()?);
                Some(Progress::Shrunk)
            }
            Job::SummarizeTopic { topic_id, .. } => {
                let Some(topic) = self
                    .topics
                    .iter_mut()
                    .find(|t| t.id == topic_id && !t.is_summarized())
                else {
                    warn!("Topic {topic_id} changed during summarization, discarding summary");
                    return None;
                };
                topic.set_summary(summaries.next()?);
                Some(Progress::Shrunk)
            }
            Job::MergeBulks { bulk_ids, .. } => {
                if !self.bulks.iter().map(|b| b.id).eq(bulk_ids.iter().copied()) {
                    warn!("Bulks changed during merge, discarding summaries");
                    return None;
                }
                let summaries: Vec<String> = summaries.collect();
                let before = self.bulks_tokens();
                let after: usize = summaries.iter().map(|s| approximate_tokens(s)).sum();
                if after >= before {
                    let dropped = self.bulks.remove(0);
                    debug!(
                        "Merging bulks would not shrink them ({before} -> {after} tokens), dropped oldest bulk ({} tokens)",
                        dropped.tokens()
                    );
                    return Some(Progress::Shrunk);
                }
                let n = self.config.bulk_merge_count;
                let mut old = std::mem::take(&mut self.bulks).into_iter();
                let mut merged = Vec::with_capacity(summaries.len());
                for summary in summaries {
                    let group: Vec<Bulk> = old.by_ref().take(n).collect();
                    let id = self.alloc_id();
                    merged.push(Bulk::merged(id, group, summary));
                }
                debug!(
                    "Merged {} bulks into {} ({before} -> {after} tokens)",
                    bulk_ids.len(),
                    merged.len()
                );
                self.bulks = merged;
                Some(Progress::Shrunk)
            }
        }
    }
}

/// Compress a history until every tier fits, no step applies, or progress
/// stalls.
///
/// Returns whether the applied steps lowered the history's tokens.
/// Messages appended concurrently are not counted against a step.
/// Summarizer failures propagate; the records they targeted are left as
/// they were.
pub async fn compress_with<A, S>(mut access: A, summarizer: &S) -> Result<bool>
where
    A: HistoryAccess,
    S: Summarizer + ?Sized,
{
    let (start, max_passes, max_stalled) = access.with_history(|h| {
        h.config
            .validate()
            .map(|()| (h.tokens(), h.config.max_compression_passes, h.config.max_stalled_passes))
    })?;

    let mut saved: i64 = 0;
    let mut stalled = 0;
    let mut passes = 0;
    loop {
        if passes == max_passes {
            warn!("History compression stopped after {max_passes} passes");
            break;
        }
        passes += 1;

        let step = match access.with_history(|h| measured(h, History::plan_step)) {
            (Plan::Idle, _) => break,
            (Plan::Applied(progress), delta) => Some((progress, delta)),
            (Plan::Pending(job), _) => {
                let summaries = job.run(summarizer).await?;
                let (progress, delta) =
                    access.with_history(|h| measured(h, |h| h.apply(job, summaries)));
                progress.map(|p| (p, delta))
            }
        };

        match step {
            Some((Progress::Moved, delta)) => {
                saved += delta;
                continue;
            }
            Some((Progress::Shrunk, delta)) if delta > 0 => {
                saved += delta;
                stalled = 0;
                continue;
            }
            Some((_, delta)) => saved += delta,
            None => {}
        }
        stalled += 1;
        if stalled >= max_stalled {
            let tokens = access.with_history(|h| h.tokens());
            warn!("History compression stalled at {tokens} tokens after {passes} passes");
            break;
        }
    }

    if saved > 0 {
        info!("History compressed: {start} tokens, {saved} saved in {passes} passes");
    }
    Ok(saved > 0)
}

/// Run one step and return its token saving. Both readings are taken in the
/// same access scope.
fn measured<R>(history: &mut History, step: impl FnOnce(&mut History) -> R) -> (R, i64) {
    let before = history.tokens() as i64;
    let out = step(history);
    (out, before - history.tokens() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::history::summarizer::SummaryFuture;
    use crate::history::summarizer::testing::{FailingSummarizer, FixedSummarizer};
    use crate::history::{HistoryConfig, Message, Topic};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn scenario_config() -> HistoryConfig {
        HistoryConfig::new(1000, 0.5)
    }

    fn fifty_token_message() -> String {
        "x".repeat(169)
    }

    fn summarized_topic(summary: &str) -> Topic {
        let mut t = Topic::new();
        t.add_message(Message::new(false, "placeholder"));
        t.set_summary(summary);
        t
    }

    #[test]
    fn tiers_ranked_by_relative_pressure() {
        let mut h = History::new(scenario_config());
        // 100 tokens in topics (ratio 0.3) outranks 150 in current (0.5).
        h.add_message(false, "x".repeat(344));
        h.new_topic();
        h.add_message(false, "x".repeat(519));
        let ranked = h.ranked_tiers();
        assert_eq!(h.topics_tokens(), 100);
        assert_eq!(h.current_topic_tokens(), 150);
        assert_eq!(ranked[0].tier, Tier::Topics);
        assert_eq!(ranked[1].tier, Tier::CurrentTopic);
        assert_eq!(ranked[2].tier, Tier::Bulks);
    }

    #[tokio::test]
    async fn within_budget_is_noop() {
        let mut h = History::new(scenario_config());
        h.add_message(false, "hello");
        let summarizer = FixedSummarizer::new("unused");
        assert!(!h.compress(&summarizer).await.unwrap());
        assert_eq!(summarizer.calls(), 0);
    }

    #[tokio::test]
    async fn over_budget_current_topic_is_compacted_in_one_call() {
        let mut h = History::new(scenario_config());
        for i in 0..8 {
            h.add_message(i % 2 == 1, fifty_token_message());
        }
        assert_eq!(h.current_topic_tokens(), 400);

        let summarizer = FixedSummarizer::new("summary");
        assert!(h.compress(&summarizer).await.unwrap());
        assert!(h.current_topic_tokens() < 250);
        assert_eq!(summarizer.calls(), 1);
        assert_eq!(h.current().messages().len(), 5);
        // The anchor message is preserved verbatim.
        assert_eq!(h.current().messages()[0].tokens(), 50);
    }

    #[tokio::test]
    async fn closed_topics_are_summarized_before_eviction() {
        let mut h = History::new(scenario_config());
        for _ in 0..2 {
            for _ in 0..4 {
                h.add_message(false, fifty_token_message());
            }
            h.new_topic();
        }
        // 400 tokens in topics against an allowance of 150.
        let summarizer = FixedSummarizer::new("short");
        assert!(h.compress(&summarizer).await.unwrap());
        assert!(h.topics().iter().all(Topic::is_summarized));
        assert!(h.bulks().is_empty());
        assert_eq!(summarizer.calls(), 2);
    }

    #[tokio::test]
    async fn summarized_topics_are_evicted_into_bulks() {
        let mut h = History::new(HistoryConfig::new(100, 0.5));
        // budget 50: topics allowance 15, bulks allowance 10.
        let long = "s".repeat(40);
        h.topics.push(summarized_topic(&long));
        h.topics.push(summarized_topic(&long));
        assert_eq!(h.topics_tokens(), 24);

        let summarizer = FixedSummarizer::new("tiny");
        h.compress(&summarizer).await.unwrap();
        assert!(h.topics_tokens() as f64 <= 15.0);
        assert!(h.bulks_tokens() as f64 <= 10.0);
        assert!(!h.bulks().is_empty() || h.topics().len() < 2);
    }

    #[tokio::test]
    async fn bulk_merge_groups_in_order() {
        let mut h = History::new(HistoryConfig::new(100, 0.5));
        for i in 0..4 {
            let id = h.alloc_id();
            let mut bulk = Bulk::from_topic(id, summarized_topic(&format!("{i}{}", "b".repeat(30))));
            bulk.set_summary(format!("{i}{}", "b".repeat(30)));
            h.bulks.push(bulk);
        }
        assert!(h.bulks_tokens() > 10);

        let summarizer = FixedSummarizer::new("m");
        assert!(h.compress(&summarizer).await.unwrap());
        // 4 bulks in groups of 3 -> 2 merged bulks.
        assert_eq!(h.bulks().len(), 2);
        assert_eq!(summarizer.calls(), 2);
        let first = &h.bulks()[0];
        assert_eq!(first.records().len(), 3);
    }

    #[tokio::test]
    async fn non_shrinking_merge_drops_oldest_bulk() {
        let mut h = History::new(HistoryConfig::new(100, 0.5));
        let id = h.alloc_id();
        let mut bulk = Bulk::from_topic(id, summarized_topic("x"));
        bulk.set_summary("z".repeat(70));
        h.bulks.push(bulk);

        // The summarizer echoes something longer than the bulk itself.
        let summarizer = FixedSummarizer::new("w".repeat(200));
        assert!(h.compress(&summarizer).await.unwrap());
        assert!(h.bulks().is_empty());
    }

    #[tokio::test]
    async fn non_shrinking_attention_stalls_instead_of_spinning() {
        let cfg = scenario_config().with_large_message_ratio(1.0);
        let mut h = History::new(cfg.clone());
        for _ in 0..3 {
            // 100 tokens each, below the 250-token large-message limit.
            h.add_message(false, "x".repeat(344));
        }
        // Each attention pass swaps one message for a 125-token summary.
        let summarizer = FixedSummarizer::new("v".repeat(400));
        let reduced = h.compress(&summarizer).await.unwrap();
        assert!(!reduced);
        assert_eq!(summarizer.calls(), cfg.max_stalled_passes);
        assert_eq!(h.current().messages().len(), 3);
    }

    #[tokio::test]
    async fn summarizer_failure_propagates_without_data_loss() {
        let mut h = History::new(scenario_config());
        for _ in 0..8 {
            h.add_message(false, fifty_token_message());
        }
        let before = h.clone();
        let err = h.compress(&FailingSummarizer).await.unwrap_err();
        assert!(matches!(err, Error::Summarization(_)));
        assert_eq!(h, before);
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let mut h = History::new(scenario_config().with_bulk_merge_count(1));
        let err = h.compress(&FixedSummarizer::new("x")).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    /// Appends a message to the shared history while the first summary is
    /// being produced, simulating the agent turn running concurrently.
    struct InterleavingSummarizer {
        history: SharedHistory,
        new_topic: bool,
        fired: AtomicBool,
    }

    impl InterleavingSummarizer {
        fn new(history: SharedHistory, new_topic: bool) -> Self {
            Self {
                history,
                new_topic,
                fired: AtomicBool::new(false),
            }
        }
    }

    impl Summarizer for InterleavingSummarizer {
        fn summarize(&self, _system: &str, _content: &str) -> SummaryFuture<'_> {
            Box::pin(async move {
                if !self.fired.swap(true, Ordering::SeqCst) {
                    let mut h = self.history.lock().unwrap();
                    if self.new_topic {
                        h.new_topic();
                    }
                    h.add_message(true, "late reply");
                }
                Ok("folded".to_string())
            })
        }
    }

    #[tokio::test]
    async fn appends_during_summarization_are_kept() {
        let shared: SharedHistory = Arc::new(Mutex::new(History::new(scenario_config())));
        {
            let mut h = shared.lock().unwrap();
            for _ in 0..8 {
                h.add_message(false, fifty_token_message());
            }
        }
        let summarizer = InterleavingSummarizer::new(shared.clone(), false);
        compress_with(shared.clone(), &summarizer).await.unwrap();
        let h = shared.lock().unwrap();
        let last = h.current().messages().last().unwrap();
        assert_eq!(last.output_text("user", "ai"), "ai: late reply");
        assert!(h.current().messages().len() < 9);
    }

    /// Appends a reply larger than the saving of each summary while the
    /// summary is being produced.
    struct GrowingSummarizer {
        history: SharedHistory,
        calls: std::sync::atomic::AtomicUsize,
    }

    impl Summarizer for GrowingSummarizer {
        fn summarize(&self, _system: &str, _content: &str) -> SummaryFuture<'_> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                // "ai: " + 1044 chars = 300 tokens.
                self.history.lock().unwrap().add_message(true, "r".repeat(1044));
                Ok("short".to_string())
            })
        }
    }

    #[tokio::test]
    async fn concurrent_growth_does_not_count_as_a_stall() {
        // Budget 5000: current topic 4500, closed topics 250.
        let config = HistoryConfig::new(10_000, 0.5)
            .with_tier_ratios(0.9, 0.05, 0.05)
            .with_large_message_ratio(1.0);
        let shared: SharedHistory = Arc::new(Mutex::new(History::new(config)));
        {
            let mut h = shared.lock().unwrap();
            for _ in 0..6 {
                for _ in 0..4 {
                    h.add_message(false, fifty_token_message());
                }
                h.new_topic();
            }
            assert_eq!(h.topics_tokens(), 1200);
        }
        let summarizer = GrowingSummarizer {
            history: shared.clone(),
            calls: std::sync::atomic::AtomicUsize::new(0),
        };

        let reduced = compress_with(shared.clone(), &summarizer).await.unwrap();
        assert!(reduced);
        // More summaries than the stall limit allows in a row.
        assert_eq!(summarizer.calls.load(Ordering::SeqCst), 6);

        let h = shared.lock().unwrap();
        assert!(h.topics().iter().all(Topic::is_summarized));
        assert_eq!(h.current().messages().len(), 6);
        assert!(h.tokens() > 1200);
    }

    #[tokio::test]
    async fn stale_attention_step_is_discarded() {
        let shared: SharedHistory = Arc::new(Mutex::new(History::new(scenario_config())));
        {
            let mut h = shared.lock().unwrap();
            for _ in 0..8 {
                h.add_message(false, fifty_token_message());
            }
        }
        let summarizer = InterleavingSummarizer::new(shared.clone(), true);
        compress_with(shared.clone(), &summarizer).await.unwrap();
        let h = shared.lock().unwrap();
        // The topic being compacted was closed mid-flight, so the attention
        // summary was discarded and the closed topic summarized instead.
        assert_eq!(h.topics().len(), 1);
        assert!(h.topics()[0].is_summarized());
        assert_eq!(h.topics()[0].messages().len(), 8);
        assert_eq!(h.current().messages().len(), 1);
    }
}
