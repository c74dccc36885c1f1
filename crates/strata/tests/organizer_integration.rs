//! Integration tests for background compression around agent turns.
//!
//! The summarizer and chat provider are in-process fakes; compression runs
//! on real worker threads.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream;
use strata::ChatRequest;
use strata::agent::{Agent, AgentConfig, AgentEvent, FnEventHandler, HistoryOrganizer, NoopHandler};
use strata::api::{ChatChunk, ChatProvider, ChunkStream};
use strata::error::Result;
use strata::history::summarizer::SummaryFuture;
use strata::history::{History, HistoryConfig, SharedHistory, Summarizer};
use strata::tasks::TaskPool;
use tokio::sync::Semaphore;

/// Holds every summary until the test opens the gate.
struct GatedSummarizer {
    gate: Semaphore,
    calls: AtomicUsize,
}

impl GatedSummarizer {
    fn new() -> Self {
        Self {
            gate: Semaphore::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    fn open(&self) {
        self.gate.add_permits(10_000);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Summarizer for GatedSummarizer {
    fn summarize(&self, _system: &str, _content: &str) -> SummaryFuture<'_> {
        Box::pin(async move {
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| strata::error::Error::Summarization(e.to_string()))?;
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok("short".to_string())
        })
    }
}

/// Replies with fixed text.
struct EchoProvider {
    reply: String,
}

impl ChatProvider for EchoProvider {
    fn stream(&self, _request: ChatRequest) -> ChunkStream<'_> {
        let chunks: Vec<Result<ChatChunk>> = self
            .reply
            .split_inclusive(' ')
            .map(|part| Ok(ChatChunk::response(part)))
            .collect();
        Box::pin(stream::iter(chunks))
    }
}

/// Budget 300 tokens; eight 50-token messages.
fn over_budget() -> SharedHistory {
    let config = HistoryConfig::new(1000, 0.3).with_large_message_ratio(1.0);
    let mut history = History::new(config);
    for i in 0..8 {
        history.add_message(i % 2 == 1, "x".repeat(169));
    }
    assert!(history.is_over_limit());
    Arc::new(Mutex::new(history))
}

fn organizer(history: SharedHistory, summarizer: Arc<GatedSummarizer>) -> HistoryOrganizer {
    HistoryOrganizer::new(history, summarizer, Arc::new(TaskPool::default()), "compress")
}

#[tokio::test]
async fn second_trigger_while_running_is_skipped() {
    let summarizer = Arc::new(GatedSummarizer::new());
    let org = organizer(over_budget(), summarizer.clone());

    assert!(org.organize().unwrap());
    assert!(org.is_busy());
    assert!(!org.organize().unwrap());

    summarizer.open();
    let reduced = org.wait_idle(Some(Duration::from_secs(10))).await.unwrap();
    assert_eq!(reduced, Some(true));
    assert!(!org.is_busy());
    assert!(!org.history().lock().unwrap().is_over_limit());
}

#[tokio::test]
async fn wait_times_out_without_cancelling() {
    let summarizer = Arc::new(GatedSummarizer::new());
    let org = organizer(over_budget(), summarizer.clone());
    org.organize().unwrap();

    let err = org
        .wait_idle(Some(Duration::from_millis(20)))
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert!(org.is_busy());

    summarizer.open();
    assert_eq!(org.wait_idle(None).await.unwrap(), Some(true));
}

#[tokio::test]
async fn budget_wait_joins_the_running_task() {
    let summarizer = Arc::new(GatedSummarizer::new());
    let org = organizer(over_budget(), summarizer.clone());
    org.organize().unwrap();

    let compressing = AtomicUsize::new(0);
    let handler = FnEventHandler::new(|event| {
        if matches!(event, AgentEvent::CompressingHistory { .. }) {
            compressing.fetch_add(1, Ordering::SeqCst);
        }
    });
    let release = async {
        tokio::time::sleep(Duration::from_millis(30)).await;
        // Still blocked on the first run's first summary.
        assert_eq!(summarizer.calls(), 0);
        summarizer.open();
    };
    let (waited, ()) = tokio::join!(org.wait_within_budget(&handler), release);
    waited.unwrap();

    assert!(compressing.load(Ordering::SeqCst) >= 1);
    assert!(!org.history().lock().unwrap().is_over_limit());
}

#[tokio::test]
async fn messages_added_during_compression_survive() {
    let summarizer = Arc::new(GatedSummarizer::new());
    let history = over_budget();
    let org = organizer(history.clone(), summarizer.clone());
    org.organize().unwrap();

    org.with_history(|h| {
        h.add_message(false, "written while compressing");
    });
    summarizer.open();
    org.wait_idle(None).await.unwrap();

    let h = history.lock().unwrap();
    let last = h.current().messages().last().unwrap();
    assert_eq!(last.content().to_text(), "written while compressing");
    assert_eq!(h.counter(), 9);
}

#[tokio::test]
async fn turns_keep_history_within_budget() {
    let summarizer = Arc::new(GatedSummarizer::new());
    summarizer.open();
    let config = AgentConfig::default().with_history(
        HistoryConfig::new(1000, 0.3).with_large_message_ratio(1.0),
    );
    let agent = Agent::new(
        EchoProvider {
            reply: "y".repeat(160),
        },
        summarizer,
        History::new(config.history.clone()),
        config,
        Arc::new(TaskPool::default()),
    );

    for turn in 0..10 {
        let question = format!("question {turn} {}", "q".repeat(150));
        let out = agent.respond(&question, &NoopHandler).await.unwrap();
        assert_eq!(out.response, "y".repeat(160));
        if turn % 3 == 2 {
            agent.new_topic();
        }
    }
    agent.organizer().wait_idle(None).await.unwrap();
    agent.organizer().wait_within_budget(&NoopHandler).await.unwrap();

    let history = agent.snapshot();
    assert_eq!(history.counter(), 20);
    assert!(!history.is_over_limit());
}
