//! Agent runtime: conversational turns over a compressing history.
//!
//! - [`turn::Agent`] runs one turn: append the user message, wait for the
//!   history budget, stream the reply, append it, compress in the
//!   background. Start here.
//! - [`organizer::HistoryOrganizer`] owns the single-flight background
//!   compression task and the backpressure wait.
//! - [`utility::UtilitySummarizer`] writes history summaries with a cheap
//!   utility model.
//! - [`config::AgentConfig`] holds models, retry, rate limits, and the
//!   history policy; loadable from a JSON settings file.
//! - [`session::SessionFile`] persists the history atomically.
//! - [`events`] defines [`AgentEvent`] and its handlers.

pub mod config;
pub mod events;
pub mod organizer;
pub mod session;
pub mod turn;
pub mod utility;

pub use config::{AgentConfig, DEFAULT_UTILITY_MODEL};
pub use events::{
    AgentEvent, CompositeEventHandler, EventHandler, FnEventHandler, LoggingHandler, NoopHandler,
};
pub use organizer::HistoryOrganizer;
pub use session::SessionFile;
pub use turn::Agent;
pub use utility::UtilitySummarizer;
