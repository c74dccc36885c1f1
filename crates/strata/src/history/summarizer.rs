//! Summarization capability used by topic and bulk compaction.

use std::future::Future;
use std::pin::Pin;

use crate::error::Result;

/// System prompt for every history summarization call.
pub const TOPIC_SUMMARY_PROMPT: &str = "\
You summarize a span of an ongoing conversation between a user and an AI agent.

Rules:
- Only include facts explicitly stated in the messages. Do not infer or extrapolate.
- Keep names, file paths, numbers, decisions and unresolved questions verbatim.
- Drop greetings, repetition and intermediate reasoning that led nowhere.
- Write plain text, no headings, no preamble.
- The summary replaces the messages entirely, so it must stand on its own.";

/// Future returned by [`Summarizer::summarize`].
pub type SummaryFuture<'a> = Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>>;

/// Produces a condensed text from a system prompt and a rendered span of
/// history.
///
/// Implementations usually call a cheap utility model (see
/// [`UtilitySummarizer`](crate::agent::UtilitySummarizer)). A failure
/// propagates out of compression and leaves the affected records untouched.
pub trait Summarizer: Send + Sync {
    fn summarize(&self, system: &str, content: &str) -> SummaryFuture<'_>;
}

/// Render already-labelled message lines into the summarization payload.
pub fn render_for_summary(lines: &[String]) -> String {
    let mut out = String::from("# Messages to summarize\n");
    for line in lines {
        out.push('\n');
        out.push_str(line);
        out.push('\n');
    }
    out
}
