//! Incremental separation of reasoning and response text in a model stream.
//!
//! Providers expose "thinking" output in one of two ways:
//!
//! - a **native reasoning channel**: the stream carries a separate reasoning
//!   delta next to the response delta;
//! - **inline thinking tags**: everything arrives as response text, with the
//!   reasoning wrapped in a tag pair such as `<think>...</think>`.
//!
//! [`ChunkParser`] handles both. The first non-empty reasoning delta locks the
//! parser into native mode for the rest of the stream. Until then, response
//! deltas are scanned for tag pairs, buffering any tail that could still turn
//! out to be part of a tag once the next chunk arrives.
//!
//! The parser never fails: malformed or unterminated tag sequences degrade to
//! plain text.

/// One `(response_delta, reasoning_delta)` pair from a model stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatChunk {
    pub response_delta: String,
    pub reasoning_delta: String,
}

impl ChatChunk {
    pub fn response(text: impl Into<String>) -> Self {
        Self {
            response_delta: text.into(),
            reasoning_delta: String::new(),
        }
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        Self {
            response_delta: String::new(),
            reasoning_delta: text.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.response_delta.is_empty() && self.reasoning_delta.is_empty()
    }
}

/// Opening/closing tag pair marking inline reasoning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThinkingTags {
    pub open: String,
    pub close: String,
}

impl ThinkingTags {
    pub fn new(open: impl Into<String>, close: impl Into<String>) -> Self {
        Self {
            open: open.into(),
            close: close.into(),
        }
    }
}

/// Tag pairs recognised by default.
pub fn default_thinking_tags() -> Vec<ThinkingTags> {
    vec![
        ThinkingTags::new("<think>", "</think>"),
        ThinkingTags::new("<reasoning>", "</reasoning>"),
    ]
}

/// Stateful per-stream parser. Feed it chunks with [`add_chunk`](Self::add_chunk)
/// and read the accumulated result with [`output`](Self::output).
#[derive(Debug, Clone)]
pub struct ChunkParser {
    reasoning: String,
    response: String,
    thinking: bool,
    /// Closing tag of the block we are inside, empty outside a block.
    thinking_tag: String,
    /// Tail held back because it may be the start of a tag.
    unprocessed: String,
    native_reasoning: bool,
    tags: Vec<ThinkingTags>,
}

impl Default for ChunkParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkParser {
    pub fn new() -> Self {
        Self::with_tags(default_thinking_tags())
    }

    /// Create a parser recognising a custom set of tag pairs.
    pub fn with_tags(tags: Vec<ThinkingTags>) -> Self {
        Self {
            reasoning: String::new(),
            response: String::new(),
            thinking: false,
            thinking_tag: String::new(),
            unprocessed: String::new(),
            native_reasoning: false,
            tags,
        }
    }

    /// Whether the stream has been detected as using a native reasoning channel.
    pub fn is_native(&self) -> bool {
        self.native_reasoning
    }

    /// Whether the parser is currently inside an inline thinking block.
    pub fn is_thinking(&self) -> bool {
        self.thinking
    }

    /// Process one raw chunk and return the part of it that can be displayed
    /// now, split into response and reasoning.
    pub fn add_chunk(&mut self, chunk: &ChatChunk) -> ChatChunk {
        if !chunk.reasoning_delta.is_empty() {
            self.native_reasoning = true;
        }

        let processed = if self.native_reasoning {
            chunk.clone()
        } else {
            let mut text = std::mem::take(&mut self.unprocessed);
            text.push_str(&chunk.response_delta);
            self.process_tags(text, chunk.reasoning_delta.clone())
        };

        self.reasoning.push_str(&processed.reasoning_delta);
        self.response.push_str(&processed.response_delta);
        processed
    }

    fn process_tags(&mut self, response: String, reasoning: String) -> ChatChunk {
        if self.thinking {
            return self.scan_for_close(response, reasoning);
        }

        let mut response = response;
        for idx in 0..self.tags.len() {
            let open = &self.tags[idx].open;
            if let Some(rest) = response.strip_prefix(open.as_str()) {
                let rest = rest.to_string();
                self.thinking = true;
                self.thinking_tag = self.tags[idx].close.clone();
                return self.scan_for_close(rest, reasoning);
            }
            if is_partial_opening_tag(&response, open) {
                self.unprocessed = std::mem::take(&mut response);
                break;
            }
        }

        ChatChunk {
            response_delta: response,
            reasoning_delta: reasoning,
        }
    }

    /// Inside a thinking block: split `text` at the closing tag if present,
    /// otherwise emit it as reasoning or hold it back as a possible partial tag.
    fn scan_for_close(&mut self, text: String, mut reasoning: String) -> ChatChunk {
        if let Some(pos) = text.find(self.thinking_tag.as_str()) {
            let (before, after) = text.split_at(pos);
            reasoning.push_str(before);
            let response = after
                .strip_prefix(self.thinking_tag.as_str())
                .unwrap_or(after)
                .to_string();
            self.thinking = false;
            self.thinking_tag.clear();
            return ChatChunk {
                response_delta: response,
                reasoning_delta: reasoning,
            };
        }

        if self.is_partial_closing_tag(&text) {
            self.unprocessed = text;
        } else {
            reasoning.push_str(&text);
        }
        ChatChunk {
            response_delta: String::new(),
            reasoning_delta: reasoning,
        }
    }

    /// Whether `text` ends with a proper prefix of the active closing tag.
    fn is_partial_closing_tag(&self, text: &str) -> bool {
        if self.thinking_tag.is_empty() || text.is_empty() {
            return false;
        }
        let tag = self.thinking_tag.as_str();
        (1..tag.len())
            .filter_map(|i| tag.get(..i))
            .any(|prefix| prefix.len() <= text.len() && text.ends_with(prefix))
    }

    /// Final reasoning and response. A tail still held back as a possible
    /// tag is flushed: into reasoning when the stream produced only reasoning
    /// (it was almost certainly a truncated closing tag), otherwise into the
    /// response.
    pub fn output(&self) -> ChatChunk {
        let mut reasoning = self.reasoning.clone();
        let mut response = self.response.clone();
        if !self.unprocessed.is_empty() {
            if !reasoning.is_empty() && response.is_empty() {
                reasoning.push_str(&self.unprocessed);
            } else {
                response.push_str(&self.unprocessed);
            }
        }
        ChatChunk {
            response_delta: response,
            reasoning_delta: reasoning,
        }
    }
}

/// Whether `text` is a proper, non-empty prefix of `tag`.
fn is_partial_opening_tag(text: &str, tag: &str) -> bool {
    !text.is_empty() && text.len() < tag.len() && tag.starts_with(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(parser: &mut ChunkParser, parts: &[&str]) {
        for part in parts {
            parser.add_chunk(&ChatChunk::response(*part));
        }
    }

    #[test]
    fn plain_text_passes_through() {
        let mut p = ChunkParser::new();
        let out = p.add_chunk(&ChatChunk::response("Hello world"));
        assert_eq!(out, ChatChunk::response("Hello world"));
        assert_eq!(p.output(), ChatChunk::response("Hello world"));
    }

    #[test]
    fn whole_think_block_in_one_chunk() {
        let mut p = ChunkParser::new();
        let out = p.add_chunk(&ChatChunk::response("<think>plan</think>answer"));
        assert_eq!(out.reasoning_delta, "plan");
        assert_eq!(out.response_delta, "answer");
        assert!(!p.is_thinking());
    }

    #[test]
    fn opening_tag_split_across_chunks() {
        let mut p = ChunkParser::new();
        let first = p.add_chunk(&ChatChunk::response("<thi"));
        assert!(first.is_empty(), "partial tag must be held back");
        feed(&mut p, &["nk>text</think>rest"]);
        let out = p.output();
        assert_eq!(out.reasoning_delta, "text");
        assert_eq!(out.response_delta, "rest");
    }

    #[test]
    fn closing_tag_split_across_chunks() {
        let mut p = ChunkParser::new();
        feed(&mut p, &["<think>AB", "C</thi", "nk>DEF"]);
        let out = p.output();
        assert_eq!(out.reasoning_delta, "ABC");
        assert_eq!(out.response_delta, "DEF");
    }

    #[test]
    fn reasoning_tag_pair_recognised() {
        let mut p = ChunkParser::new();
        feed(&mut p, &["<reason", "ing>why</reasoning>", "what"]);
        let out = p.output();
        assert_eq!(out.reasoning_delta, "why");
        assert_eq!(out.response_delta, "what");
    }

    #[test]
    fn every_single_split_point() {
        let text = "<think>ABC</think>DEF";
        for i in 0..=text.len() {
            let (a, b) = text.split_at(i);
            let mut p = ChunkParser::new();
            feed(&mut p, &[a, b]);
            let out = p.output();
            assert_eq!(out.reasoning_delta, "ABC", "split at {i}");
            assert_eq!(out.response_delta, "DEF", "split at {i}");
        }
    }

    #[test]
    fn every_pair_of_split_points() {
        let text = "<think>ABC</think>DEF";
        for i in 0..=text.len() {
            for j in i..=text.len() {
                let (head, tail) = text.split_at(j);
                let (a, b) = head.split_at(i);
                let mut p = ChunkParser::new();
                feed(&mut p, &[a, b, tail]);
                let out = p.output();
                assert_eq!(out.reasoning_delta, "ABC", "splits at {i},{j}");
                assert_eq!(out.response_delta, "DEF", "splits at {i},{j}");
            }
        }
    }

    #[test]
    fn one_character_per_chunk() {
        let text = "<think>ABC</think>DEF";
        let mut p = ChunkParser::new();
        for c in text.chars() {
            p.add_chunk(&ChatChunk::response(c.to_string()));
        }
        let out = p.output();
        assert_eq!(out.reasoning_delta, "ABC");
        assert_eq!(out.response_delta, "DEF");
    }

    #[test]
    fn native_reasoning_locks_in() {
        let mut p = ChunkParser::new();
        p.add_chunk(&ChatChunk::reasoning("thinking natively"));
        assert!(p.is_native());
        let out = p.add_chunk(&ChatChunk::response("<think>not a tag</think>"));
        assert_eq!(out.response_delta, "<think>not a tag</think>");
        assert!(out.reasoning_delta.is_empty());
        let total = p.output();
        assert_eq!(total.reasoning_delta, "thinking natively");
        assert_eq!(total.response_delta, "<think>not a tag</think>");
    }

    #[test]
    fn native_chunk_passes_both_deltas_unchanged() {
        let mut p = ChunkParser::new();
        let chunk = ChatChunk {
            response_delta: "<thi".into(),
            reasoning_delta: "r".into(),
        };
        assert_eq!(p.add_chunk(&chunk), chunk);
    }

    #[test]
    fn unterminated_block_flushes_tail_into_reasoning() {
        let mut p = ChunkParser::new();
        feed(&mut p, &["<think>still going", "</th"]);
        let out = p.output();
        assert_eq!(out.reasoning_delta, "still going</th");
        assert!(out.response_delta.is_empty());
    }

    #[test]
    fn lone_angle_bracket_is_eventually_response() {
        let mut p = ChunkParser::new();
        feed(&mut p, &["<", "p>html"]);
        assert_eq!(p.output().response_delta, "<p>html");

        let mut p = ChunkParser::new();
        feed(&mut p, &["<"]);
        assert_eq!(p.output().response_delta, "<");
    }

    #[test]
    fn tag_not_at_start_is_plain_text() {
        let mut p = ChunkParser::new();
        feed(&mut p, &["Answer: <think>x</think>"]);
        assert_eq!(p.output().response_delta, "Answer: <think>x</think>");
    }

    #[test]
    fn custom_tags() {
        let mut p = ChunkParser::with_tags(vec![ThinkingTags::new("[[", "]]")]);
        feed(&mut p, &["[", "[inner]", "]outer"]);
        let out = p.output();
        assert_eq!(out.reasoning_delta, "inner");
        assert_eq!(out.response_delta, "outer");
    }
}
