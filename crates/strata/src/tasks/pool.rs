//! Named background workers.
//!
//! Each [`Worker`] owns one OS thread running a single-threaded Tokio
//! runtime. Work spawned on it never competes with the caller's runtime, so
//! long jobs such as history compression cannot stall token streaming.
//! Workers are created lazily by name, shared between callers, and replaced
//! transparently after they have been terminated.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Name of the worker used when callers don't pick one.
pub const DEFAULT_WORKER: &str = "background";

/// Default bound on the number of named workers in a pool.
pub const DEFAULT_MAX_WORKERS: usize = 8;

/// A dedicated thread hosting a current-thread Tokio runtime.
pub struct Worker {
    name: String,
    handle: Handle,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    terminated: AtomicBool,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

impl Worker {
    /// Start a worker thread and wait until its runtime is up.
    pub fn spawn(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let (handle_tx, handle_rx) = std::sync::mpsc::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let thread = std::thread::Builder::new()
            .name(format!("strata-{name}"))
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = handle_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                let _ = handle_tx.send(Ok(rt.handle().clone()));
                // Drives every task spawned through the handle until shutdown.
                rt.block_on(async {
                    let _ = shutdown_rx.await;
                });
                // Dropping the runtime cancels whatever is still running.
            })?;

        let handle = handle_rx
            .recv()
            .map_err(|_| Error::Io(format!("worker '{name}' exited during startup")))?
            .map_err(Error::Io)?;
        debug!("Started worker '{name}'");

        Ok(Self {
            name,
            handle,
            shutdown: Mutex::new(Some(shutdown_tx)),
            thread: Mutex::new(Some(thread)),
            terminated: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handle to the worker's runtime.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn is_terminated(&self) -> bool {
        if self.terminated.load(Ordering::SeqCst) {
            return true;
        }
        let thread = self.thread.lock().unwrap_or_else(|e| e.into_inner());
        thread.as_ref().is_none_or(|t| t.is_finished())
    }

    /// Stop the runtime, cancelling every task on it. Idempotent.
    pub fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        let tx = self
            .shutdown
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
        info!("Terminated worker '{}'", self.name);
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.terminate();
        let thread = self
            .thread
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        // A worker dropped from its own thread cannot join itself.
        if let Some(thread) = thread
            && thread.thread().id() != std::thread::current().id()
        {
            let _ = thread.join();
        }
    }
}

/// A bounded set of named [`Worker`]s.
#[derive(Debug)]
pub struct TaskPool {
    workers: Mutex<HashMap<String, Arc<Worker>>>,
    max_workers: usize,
}

impl Default for TaskPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_WORKERS)
    }
}

impl TaskPool {
    pub fn new(max_workers: usize) -> Self {
        Self {
            workers: Mutex::new(HashMap::new()),
            max_workers,
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// The live worker called `name`, starting one if needed. A terminated
    /// worker is replaced by a fresh one.
    pub fn worker(&self, name: &str) -> Result<Arc<Worker>> {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(worker) = workers.get(name)
            && !worker.is_terminated()
        {
            return Ok(worker.clone());
        }
        workers.retain(|_, w| !w.is_terminated());
        if workers.len() >= self.max_workers {
            return Err(Error::PoolExhausted {
                max_workers: self.max_workers,
            });
        }
        let worker = Arc::new(Worker::spawn(name)?);
        workers.insert(name.to_string(), worker.clone());
        Ok(worker)
    }

    /// Terminate the worker called `name`. Returns whether one was running.
    pub fn terminate(&self, name: &str) -> bool {
        let removed = self
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
        match removed {
            Some(worker) => {
                worker.terminate();
                true
            }
            None => false,
        }
    }

    /// Number of live workers.
    pub fn len(&self) -> usize {
        let workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        workers.values().filter(|w| !w.is_terminated()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Terminate every worker.
    pub fn shutdown(&self) {
        let drained: Vec<Arc<Worker>> = self
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, w)| w)
            .collect();
        for worker in drained {
            worker.terminate();
        }
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
