//! Background task coordination.
//!
//! [`TaskPool`] hands out named [`Worker`]s, each a dedicated thread with its
//! own runtime. [`DeferredTask`] runs a future on one of them and exposes a
//! result that can be awaited, polled, or waited on synchronously, with
//! timeouts and cooperative cancellation that cascades to child tasks.

pub mod deferred;
pub mod pool;

pub use deferred::{DeferredTask, Killable};
pub use pool::{DEFAULT_MAX_WORKERS, DEFAULT_WORKER, TaskPool, Worker};
