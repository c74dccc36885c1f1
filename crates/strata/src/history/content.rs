//! Message content and the flattened output projection of history records.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize, Serializer};

/// Placeholder shown instead of a raw payload that has no preview.
pub const RAW_PLACEHOLDER: &str = "<raw message content>";

/// Content of a single history message.
///
/// A recursive union of text, lists, and string-keyed maps, plus a raw
/// variant for non-text payloads (images, provider-native parts). Raw
/// content is never rendered as text: its `preview` stands in for it.
/// Map keys keep the order they were written in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Checked first so any map carrying `raw_content` is treated as raw.
    Raw(RawContent),
    Text(String),
    List(Vec<MessageContent>),
    Map(IndexMap<String, MessageContent>),
    /// Numbers, booleans and null. Checked last, after every container.
    Scalar(serde_json::Value),
}

/// A non-text payload with an optional human-readable preview.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawContent {
    pub raw_content: serde_json::Value,
    #[serde(default)]
    pub preview: Option<String>,
}

impl RawContent {
    fn display(&self) -> &str {
        match self.preview.as_deref() {
            Some(p) if !p.is_empty() => p,
            _ => RAW_PLACEHOLDER,
        }
    }
}

impl MessageContent {
    pub fn raw(payload: serde_json::Value, preview: impl Into<String>) -> Self {
        Self::Raw(RawContent {
            raw_content: payload,
            preview: Some(preview.into()),
        })
    }

    pub fn is_raw(&self) -> bool {
        matches!(self, Self::Raw(_))
    }

    /// Text rendering used for token counting and summarization input.
    ///
    /// Strings render as-is, raw payloads as their preview (or
    /// [`RAW_PLACEHOLDER`]), everything else as compact JSON with nested raw
    /// payloads replaced the same way.
    pub fn to_text(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Raw(raw) => raw.display().to_string(),
            other => serde_json::to_string(&Rendered(other)).unwrap_or_default(),
        }
    }

    /// Total characters across all string leaves (raw payloads and scalars
    /// excluded).
    pub(crate) fn text_chars(&self) -> usize {
        match self {
            Self::Text(s) => s.chars().count(),
            Self::Raw(_) | Self::Scalar(_) => 0,
            Self::List(items) => items.iter().map(Self::text_chars).sum(),
            Self::Map(map) => map.values().map(Self::text_chars).sum(),
        }
    }

    fn leaf_lengths(&self, out: &mut Vec<usize>) {
        match self {
            Self::Text(s) => out.push(s.chars().count()),
            Self::Raw(_) | Self::Scalar(_) => {}
            Self::List(items) => items.iter().for_each(|i| i.leaf_lengths(out)),
            Self::Map(map) => map.values().for_each(|v| v.leaf_lengths(out)),
        }
    }

    fn cap_strings(&self, cap: usize) -> Self {
        match self {
            Self::Text(s) => Self::Text(truncate_text(s, cap)),
            Self::Raw(_) | Self::Scalar(_) => self.clone(),
            Self::List(items) => Self::List(items.iter().map(|i| i.cap_strings(cap)).collect()),
            Self::Map(map) => Self::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.cap_strings(cap)))
                    .collect(),
            ),
        }
    }
}

/// Serializes content the way it is shown to a model: raw payloads become
/// their preview.
struct Rendered<'a>(&'a MessageContent);

impl Serialize for Rendered<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.0 {
            MessageContent::Text(s) => serializer.serialize_str(s),
            MessageContent::Raw(raw) => serializer.serialize_str(raw.display()),
            MessageContent::Scalar(value) => value.serialize(serializer),
            MessageContent::List(items) => serializer.collect_seq(items.iter().map(Rendered)),
            MessageContent::Map(map) => {
                serializer.collect_map(map.iter().map(|(k, v)| (k, Rendered(v))))
            }
        }
    }
}

impl From<&str> for MessageContent {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for MessageContent {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

/// Flattened, LLM-consumable projection of any history record.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputMessage {
    pub is_ai: bool,
    pub content: MessageContent,
}

impl OutputMessage {
    pub fn new(is_ai: bool, content: impl Into<MessageContent>) -> Self {
        Self {
            is_ai,
            content: content.into(),
        }
    }
}

/// Render outputs as `label: text` lines.
pub fn output_text(outputs: &[OutputMessage], human_label: &str, ai_label: &str) -> String {
    outputs
        .iter()
        .map(|o| {
            let label = if o.is_ai { ai_label } else { human_label };
            format!("{label}: {}", o.content.to_text())
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Merge consecutive outputs from the same sender so roles alternate.
pub fn group_outputs_abab(outputs: Vec<OutputMessage>) -> Vec<OutputMessage> {
    let mut result: Vec<OutputMessage> = Vec::with_capacity(outputs.len());
    for out in outputs {
        match result.last_mut() {
            Some(last) if last.is_ai == out.is_ai => {
                let prev = std::mem::replace(&mut last.content, MessageContent::List(Vec::new()));
                last.content = merge_outputs(prev, out.content);
            }
            _ => result.push(out),
        }
    }
    result
}

/// Concatenate two contents: strings join with a newline, anything else
/// becomes a list of parts.
pub fn merge_outputs(a: MessageContent, b: MessageContent) -> MessageContent {
    if let (MessageContent::Text(a), MessageContent::Text(b)) = (&a, &b) {
        return MessageContent::Text(format!("{a}\n{b}"));
    }
    let mut parts = into_parts(a);
    parts.extend(into_parts(b));
    MessageContent::List(parts)
}

fn into_parts(content: MessageContent) -> Vec<MessageContent> {
    match content {
        MessageContent::List(items) => items,
        MessageContent::Text(text) => {
            let mut part = IndexMap::new();
            part.insert("type".to_string(), MessageContent::Text("text".into()));
            part.insert("text".to_string(), MessageContent::Text(text));
            vec![MessageContent::Map(part)]
        }
        other => vec![other],
    }
}

/// Shrink `content` to at most `target_chars` characters of text when it
/// is longer than `threshold_chars`; otherwise return it unchanged.
///
/// Short string leaves are kept whole and the longest ones are cut to a
/// common length, keeping head and tail. Raw payloads and scalars are left
/// alone. A truncated result always has fewer text characters than the
/// input.
pub fn truncate_content(
    content: &MessageContent,
    threshold_chars: f64,
    target_chars: f64,
) -> MessageContent {
    let total = content.text_chars();
    if total == 0 || total as f64 <= threshold_chars {
        return content.clone();
    }
    let target = (target_chars.max(0.0).floor() as usize).min(total - 1);
    let mut lengths = Vec::new();
    content.leaf_lengths(&mut lengths);
    content.cap_strings(leaf_cap(lengths, target))
}

/// Largest per-leaf length such that capping every leaf at it keeps the
/// total within `target`.
fn leaf_cap(mut lengths: Vec<usize>, target: usize) -> usize {
    lengths.sort_unstable();
    let count = lengths.len();
    let mut remaining = target;
    for (i, len) in lengths.into_iter().enumerate() {
        let left = count - i;
        if len * left > remaining {
            return remaining / left;
        }
        remaining -= len;
    }
    usize::MAX
}

/// Keep the first and last parts of `text` so the result is at most `keep`
/// characters, marking the cut. When the marker itself does not fit, the
/// text is cut to its first `keep` characters.
pub fn truncate_text(text: &str, keep: usize) -> String {
    let len = text.chars().count();
    if len <= keep {
        return text.to_string();
    }
    let removed = len - keep;
    let marker = format!("\n... [{removed} characters removed] ...\n");
    let marker_len = marker.chars().count();
    if marker_len >= keep {
        return text.chars().take(keep).collect();
    }
    let budget = keep - marker_len;
    let head_len = budget.div_ceil(2);
    let tail_len = budget - head_len;
    let head: String = text.chars().take(head_len).collect();
    let tail: String = text.chars().skip(len - tail_len).collect();
    format!("{head}{marker}{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn raw_content_deserializes_before_map() {
        let c: MessageContent =
            serde_json::from_value(json!({"raw_content": [{"type": "image_url"}], "preview": "img"}))
                .unwrap();
        assert!(c.is_raw());
        assert_eq!(c.to_text(), "img");
    }

    #[test]
    fn nested_content_roundtrips() {
        let v = json!({"tool_name": "search", "tool_args": ["a", {"q": "b"}]});
        let c: MessageContent = serde_json::from_value(v.clone()).unwrap();
        assert!(matches!(c, MessageContent::Map(_)));
        assert_eq!(serde_json::to_value(&c).unwrap(), v);
    }

    #[test]
    fn raw_without_preview_never_dumps_payload() {
        let c = MessageContent::Raw(RawContent {
            raw_content: json!("data:image/png;base64,AAAA"),
            preview: None,
        });
        assert_eq!(c.to_text(), RAW_PLACEHOLDER);
    }

    #[test]
    fn output_text_labels_senders() {
        let outs = vec![OutputMessage::new(false, "hi"), OutputMessage::new(true, "hello")];
        assert_eq!(output_text(&outs, "user", "ai"), "user: hi\nai: hello");
    }

    #[test]
    fn group_merges_consecutive_same_sender() {
        let outs = vec![
            OutputMessage::new(false, "a"),
            OutputMessage::new(false, "b"),
            OutputMessage::new(true, "c"),
            OutputMessage::new(false, "d"),
        ];
        let grouped = group_outputs_abab(outs);
        assert_eq!(grouped.len(), 3);
        assert_eq!(grouped[0].content, MessageContent::Text("a\nb".into()));
        assert!(grouped[1].is_ai);
    }

    #[test]
    fn merge_mixed_content_builds_part_list() {
        let raw = MessageContent::raw(json!({"image": "x"}), "an image");
        let merged = merge_outputs(MessageContent::Text("look".into()), raw.clone());
        let MessageContent::List(parts) = merged else {
            panic!("expected list");
        };
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1], raw);
        assert_eq!(parts[0].to_text(), r#"{"type":"text","text":"look"}"#);
    }

    #[test]
    fn nested_raw_renders_as_preview() {
        let list = MessageContent::List(vec![
            MessageContent::Text("caption".into()),
            MessageContent::raw(json!({"b64": "AAAA"}), "a cat"),
        ]);
        let text = list.to_text();
        assert_eq!(text, r#"["caption","a cat"]"#);
        assert!(!text.contains("AAAA"));
    }

    #[test]
    fn truncate_text_keeps_head_and_tail() {
        let text = format!("{}{}", "a".repeat(500), "z".repeat(500));
        let out = truncate_text(&text, 200);
        assert!(out.starts_with('a'));
        assert!(out.ends_with('z'));
        assert!(out.contains("characters removed"));
        assert!(out.chars().count() <= 200);
    }

    #[test]
    fn truncate_within_threshold_is_unchanged() {
        let c = MessageContent::Text("short".into());
        assert_eq!(truncate_content(&c, 10.0, 4.0), c);
    }

    #[test]
    fn truncate_cuts_longest_leaves_first() {
        let mut map = IndexMap::new();
        map.insert("a".to_string(), MessageContent::Text("x".repeat(1000)));
        map.insert("b".to_string(), MessageContent::Text("y".repeat(1000)));
        map.insert("c".to_string(), MessageContent::Text("keep".into()));
        let c = MessageContent::Map(map);
        let out = truncate_content(&c, 600.0, 400.0);
        assert!(out.text_chars() <= 400);
        let MessageContent::Map(out) = out else {
            panic!("expected map");
        };
        assert_eq!(out["c"], MessageContent::Text("keep".into()));
        for key in ["a", "b"] {
            assert!(out[key].to_text().chars().count() <= 198);
        }
    }

    #[test]
    fn truncate_many_short_leaves_never_grows() {
        let map: IndexMap<String, MessageContent> = (0..200)
            .map(|i| (format!("k{i:03}"), MessageContent::Text("x".repeat(20))))
            .collect();
        let c = MessageContent::Map(map);
        let before = c.text_chars();
        let out = truncate_content(&c, 500.0, 300.0);
        assert!(out.text_chars() <= 300);
        assert!(out.to_text().chars().count() < c.to_text().chars().count());
        assert!(!out.to_text().contains("characters removed"));
        assert!(out.text_chars() < before);
    }

    #[test]
    fn truncate_text_never_exceeds_keep() {
        for keep in [0, 5, 20, 40, 80] {
            let out = truncate_text(&"q".repeat(100), keep);
            assert!(out.chars().count() <= keep, "keep {keep} gave {out:?}");
        }
    }

    #[test]
    fn scalar_leaves_roundtrip_and_render_as_json() {
        let doc = r#"{"tool_name":"code_execution","tool_args":{"timeout":30,"reset":false,"cwd":null}}"#;
        let c: MessageContent = serde_json::from_str(doc).unwrap();
        assert_eq!(serde_json::to_string(&c).unwrap(), doc);
        assert_eq!(
            c.to_text(),
            r#"{"tool_name":"code_execution","tool_args":{"timeout":30,"reset":false,"cwd":null}}"#
        );
        assert_eq!(c.text_chars(), "code_execution".len());
    }

    #[test]
    fn truncate_leaves_scalars_alone() {
        let c: MessageContent =
            serde_json::from_value(json!({"n": 12345, "log": "z".repeat(900)})).unwrap();
        let out = truncate_content(&c, 200.0, 100.0);
        let MessageContent::Map(out) = out else {
            panic!("expected map");
        };
        assert_eq!(out["n"], MessageContent::Scalar(json!(12345)));
        assert!(out["log"].to_text().chars().count() <= 100);
    }

    #[test]
    fn map_keys_keep_written_order() {
        let c: MessageContent =
            serde_json::from_str(r#"{"zeta": "1", "alpha": "2", "mid": "3"}"#).unwrap();
        assert_eq!(c.to_text(), r#"{"zeta":"1","alpha":"2","mid":"3"}"#);
        assert_eq!(
            serde_json::to_string(&c).unwrap(),
            r#"{"zeta":"1","alpha":"2","mid":"3"}"#
        );
    }
}
