//! A handle to work running on a [`Worker`](super::Worker).
//!
//! A [`DeferredTask`] starts a future on a worker's runtime and lets any
//! number of callers wait for its outcome, from async code or from plain
//! threads. The result is published through a `watch` channel, so it stays
//! readable after completion and every waiter sees the same value.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::debug;

use super::pool::Worker;
use crate::error::{Error, Result};

/// Anything that can be cancelled as a child of a [`DeferredTask`].
pub trait Killable {
    /// Cancel the work. With `terminate_thread`, also tear down the worker
    /// it runs on.
    fn kill(&mut self, terminate_thread: bool);
}

struct ChildTask {
    task: Box<dyn Killable + Send>,
    terminate_thread: bool,
}

type Outcome<T> = Option<Result<T>>;

/// A cancellable unit of background work with a shareable result.
pub struct DeferredTask<T> {
    worker: Arc<Worker>,
    abort: Option<AbortHandle>,
    result: watch::Receiver<Outcome<T>>,
    children: Vec<ChildTask>,
}

impl<T> std::fmt::Debug for DeferredTask<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredTask")
            .field("worker", &self.worker.name())
            .field("started", &self.abort.is_some())
            .field("ready", &self.result.borrow().is_some())
            .field("children", &self.children.len())
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> DeferredTask<T> {
    /// An idle task bound to `worker`. Waiting on it before [`start`]
    /// yields [`Error::Cancelled`].
    ///
    /// [`start`]: DeferredTask::start
    pub fn new(worker: Arc<Worker>) -> Self {
        let (_, result) = watch::channel(None);
        Self {
            worker,
            abort: None,
            result,
            children: Vec::new(),
        }
    }

    /// Create a task on `worker` and start `future` right away.
    pub fn spawn<F>(worker: Arc<Worker>, future: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let mut task = Self::new(worker);
        task.start(future);
        task
    }

    /// Run `future` on the worker, killing any previous run of this task.
    pub fn start<F>(&mut self, future: F)
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        self.kill(false);
        let (tx, rx) = watch::channel(None);
        let handle = self.worker.handle();
        let inner = handle.spawn(future);
        self.abort = Some(inner.abort_handle());
        // A separate watcher turns a panic or an abort into an error result.
        handle.spawn(async move {
            let outcome = match inner.await {
                Ok(result) => result,
                Err(e) => Err(Error::from(e)),
            };
            let _ = tx.send(Some(outcome));
        });
        self.result = rx;
        debug!("Started task on worker '{}'", self.worker.name());
    }

    pub fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }

    /// Whether the task has been started at least once.
    pub fn is_started(&self) -> bool {
        self.abort.is_some()
    }

    /// Whether an outcome (success or failure) is available.
    pub fn is_ready(&self) -> bool {
        self.result.borrow().is_some()
    }

    /// Whether the task is started, unfinished, and its worker still runs.
    pub fn is_alive(&self) -> bool {
        self.is_started() && !self.is_ready() && !self.worker.is_terminated()
    }

    /// The outcome if the task has finished.
    pub fn try_result(&self) -> Option<Result<T>> {
        self.result.borrow().clone()
    }

    /// Wait for the outcome. A `timeout` expiry returns [`Error::Timeout`]
    /// and leaves the task running.
    pub async fn result(&self, timeout: Option<Duration>) -> Result<T> {
        let wait = wait_for(self.result.clone());
        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| Error::Timeout(limit))?,
            None => wait.await,
        }
    }

    /// Blocking [`result`](DeferredTask::result) for synchronous callers.
    ///
    /// Must not be called from inside an async runtime.
    pub fn result_sync(&self, timeout: Option<Duration>) -> Result<T> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(Error::Config(
                "result_sync called from async context; use result().await".into(),
            ));
        }
        if self.worker.is_terminated() {
            return self.try_result().unwrap_or(Err(Error::Cancelled));
        }
        self.worker.handle().block_on(self.result(timeout))
    }

    /// Register a child cancelled whenever this task is killed.
    pub fn add_child_task(&mut self, child: impl Killable + Send + 'static, terminate_thread: bool) {
        self.children.push(ChildTask {
            task: Box::new(child),
            terminate_thread,
        });
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    /// Kill every registered child and forget them.
    pub fn kill_children(&mut self) {
        for mut child in self.children.drain(..) {
            child.task.kill(child.terminate_thread);
        }
    }

    /// Run an async closure on this task's worker and wait for its output.
    pub async fn execute_inside<F, Fut, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: Send + 'static,
    {
        Ok(self.worker.handle().spawn(async move { f().await }).await?)
    }

    /// Run a synchronous closure on this task's worker and wait for its
    /// output.
    pub async fn execute_inside_sync<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        Ok(self.worker.handle().spawn(async move { f() }).await?)
    }
}

impl<T> DeferredTask<T> {
    fn abort_all(&mut self) {
        if let Some(abort) = self.abort.take() {
            abort.abort();
        }
        for mut child in self.children.drain(..) {
            child.task.kill(child.terminate_thread);
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Killable for DeferredTask<T> {
    /// Cancel the run and its children. Waiters receive
    /// [`Error::Cancelled`] unless the task had already finished.
    fn kill(&mut self, terminate_thread: bool) {
        let was_running = self.is_alive();
        self.abort_all();
        if terminate_thread {
            self.worker.terminate();
        }
        if was_running {
            debug!("Killed task on worker '{}'", self.worker.name());
        }
    }
}

impl<T> Drop for DeferredTask<T> {
    fn drop(&mut self) {
        self.abort_all();
    }
}

async fn wait_for<T: Clone>(mut rx: watch::Receiver<Outcome<T>>) -> Result<T> {
    loop {
        let current = rx.borrow_and_update().clone();
        if let Some(outcome) = current {
            return outcome;
        }
        if rx.changed().await.is_err() {
            // Sender gone: the worker runtime was torn down mid-run.
            let last = rx.borrow().clone();
            return last.unwrap_or(Err(Error::Cancelled));
        }
    }
}
