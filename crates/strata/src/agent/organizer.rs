//! Background history compression around agent turns.
//!
//! The usual turn looks like this:
//!
//! 1. Before building the prompt, [`HistoryOrganizer::wait_within_budget`]
//!    blocks until the history fits its budget, reporting
//!    [`AgentEvent::CompressingHistory`] whenever it has to wait.
//! 2. The reply is streamed and appended to the shared history.
//! 3. [`HistoryOrganizer::organize`] starts compression on a background
//!    worker and returns immediately, so the user can read the reply while
//!    the history is tidied up.
//!
//! At most one compression task is in flight per organizer.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use super::events::{AgentEvent, EventHandler};
use crate::error::{Error, Result};
use crate::history::{History, SharedHistory, Summarizer, compress_with};
use crate::tasks::{DeferredTask, TaskPool};

/// Runs single-flight compression of a [`SharedHistory`] on a named worker.
pub struct HistoryOrganizer {
    history: SharedHistory,
    summarizer: Arc<dyn Summarizer>,
    pool: Arc<TaskPool>,
    worker: String,
    task: Mutex<Option<Arc<DeferredTask<bool>>>>,
}

impl HistoryOrganizer {
    pub fn new(
        history: SharedHistory,
        summarizer: Arc<dyn Summarizer>,
        pool: Arc<TaskPool>,
        worker: impl Into<String>,
    ) -> Self {
        Self {
            history,
            summarizer,
            pool,
            worker: worker.into(),
            task: Mutex::new(None),
        }
    }

    pub fn history(&self) -> &SharedHistory {
        &self.history
    }

    /// Run `f` with the history locked.
    pub fn with_history<R>(&self, f: impl FnOnce(&mut History) -> R) -> R {
        let mut guard = self.history.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    /// Whether a compression task is currently running.
    pub fn is_busy(&self) -> bool {
        self.running().is_some()
    }

    fn running(&self) -> Option<Arc<DeferredTask<bool>>> {
        let slot = self.task.lock().unwrap_or_else(|e| e.into_inner());
        slot.as_ref().filter(|t| t.is_alive()).cloned()
    }

    /// Start background compression unless a run is already in flight.
    ///
    /// Returns whether a new run was started.
    pub fn organize(&self) -> Result<bool> {
        let mut slot = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().is_some_and(|t| t.is_alive()) {
            debug!("Compression already in flight, not starting another");
            return Ok(false);
        }
        let worker = self.pool.worker(&self.worker)?;
        let history = self.history.clone();
        let summarizer = self.summarizer.clone();
        let task = DeferredTask::spawn(worker, async move {
            compress_with(history, summarizer.as_ref()).await
        });
        *slot = Some(Arc::new(task));
        debug!("Started background compression on worker '{}'", self.worker);
        Ok(true)
    }

    /// Wait for the latest run to finish.
    ///
    /// Returns `None` when no run was ever started, otherwise whether the
    /// latest run reduced the history.
    pub async fn wait_idle(&self, timeout: Option<Duration>) -> Result<Option<bool>> {
        match self.latest() {
            Some(task) => task.result(timeout).await.map(Some),
            None => Ok(None),
        }
    }

    /// Block until the history is within budget.
    ///
    /// Joins the in-flight run if there is one, otherwise starts a run and
    /// waits for it. Returns once the history fits, or once a run of its own
    /// could not shrink the history any further. Compression errors are
    /// returned to the caller.
    pub async fn wait_within_budget(&self, handler: &dyn EventHandler) -> Result<()> {
        loop {
            let (tokens, budget, over) = self.with_history(|h| {
                (
                    h.tokens(),
                    h.config().history_budget() as usize,
                    h.is_over_limit(),
                )
            });
            if !over {
                return Ok(());
            }
            handler.on_event(&AgentEvent::CompressingHistory { tokens, budget });

            let (task, joined) = match self.running() {
                Some(task) => (task, true),
                None => {
                    self.organize()?;
                    let task = self.latest();
                    (task.ok_or(Error::Cancelled)?, false)
                }
            };
            task.result(None).await?;

            let after = self.with_history(|h| h.tokens());
            if after < tokens {
                handler.on_event(&AgentEvent::HistoryCompressed {
                    before: tokens,
                    after,
                });
                continue;
            }
            if joined {
                // The joined run may have started before the latest
                // additions; one fresh run decides.
                continue;
            }
            warn!("History still over budget at {after} tokens, compression made no progress");
            handler.on_event(&AgentEvent::CompressionSkipped {
                tokens: after,
                budget,
            });
            return Ok(());
        }
    }

    /// The last task, even if it already finished.
    fn latest(&self) -> Option<Arc<DeferredTask<bool>>> {
        self.task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .cloned()
    }
}

impl std::fmt::Debug for HistoryOrganizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryOrganizer")
            .field("worker", &self.worker)
            .field("busy", &self.is_busy())
            .finish()
    }
}
