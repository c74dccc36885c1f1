//! One conversational turn against a shared history.

use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use super::config::AgentConfig;
use super::events::{AgentEvent, EventHandler};
use super::organizer::HistoryOrganizer;
use crate::ChatMessage;
use crate::api::{ChatProvider, StreamOutput, stream_with_retry};
use crate::error::Result;
use crate::history::{History, Summarizer};
use crate::tasks::TaskPool;

/// Ties a chat provider to a history and its organizer.
pub struct Agent<P> {
    provider: P,
    config: AgentConfig,
    organizer: HistoryOrganizer,
    system_prompt: Option<String>,
}

impl<P: ChatProvider> Agent<P> {
    pub fn new(
        provider: P,
        summarizer: Arc<dyn Summarizer>,
        history: History,
        config: AgentConfig,
        pool: Arc<TaskPool>,
    ) -> Self {
        let organizer = HistoryOrganizer::new(
            Arc::new(Mutex::new(history)),
            summarizer,
            pool,
            config.worker.clone(),
        );
        Self {
            provider,
            config,
            organizer,
            system_prompt: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn organizer(&self) -> &HistoryOrganizer {
        &self.organizer
    }

    /// A copy of the current history.
    pub fn snapshot(&self) -> History {
        self.organizer.with_history(|h| h.clone())
    }

    /// Close the current topic so the next message starts a new one.
    pub fn new_topic(&self) {
        self.organizer.with_history(History::new_topic);
    }

    /// Messages sent to the chat model: the optional system prompt followed
    /// by the history, alternating between user and assistant.
    pub fn prompt_messages(&self) -> Vec<ChatMessage> {
        let mut messages: Vec<ChatMessage> = self
            .system_prompt
            .iter()
            .map(|p| ChatMessage::system(p.as_str()))
            .collect();
        messages.extend(self.organizer.with_history(|h| h.to_chat_messages()));
        messages
    }

    /// Append `user_text`, wait until the history fits, stream the reply,
    /// append it, and start background compression.
    ///
    /// A failed reply leaves the user message in the history.
    pub async fn respond(&self, user_text: &str, handler: &dyn EventHandler) -> Result<StreamOutput> {
        self.organizer.with_history(|h| {
            h.add_message(false, user_text);
        });
        self.organizer.wait_within_budget(handler).await?;

        let request = self.config.chat_request(self.prompt_messages());
        debug!("Requesting reply with {} messages", request.messages.len());
        let out = stream_with_retry(&self.provider, &request, &self.config.retry, |event| {
            AgentEvent::forward_stream(event, handler)
        })
        .await?;

        let tokens = self.organizer.with_history(|h| {
            h.add_message(true, out.response.as_str());
            h.tokens()
        });
        info!("Reply appended, history at {tokens} tokens");
        self.organizer.organize()?;
        Ok(out)
    }
}
