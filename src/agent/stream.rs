//! Line-oriented parsing of the agent binary's streaming output.
//!
//! Every stdout line is attempted as a JSON event. Recognized events carry
//! text deltas, tool uses, or cumulative token usage; anything else is kept
//! verbatim so the raw artifact loses nothing.

use serde_json::Value;

/// One parsed stdout line.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    TextDelta(String),
    ToolUse(String),
    Usage(u64),
    /// Valid JSON that carries none of the fields we track.
    Other,
    /// Not JSON; retained as raw text.
    Raw,
}

/// Classify a single line by its most significant payload. A line can carry
/// several payloads at once (an assistant message with both text and usage);
/// [`StreamCollector::ingest`] extracts each independently.
pub fn parse_line(line: &str) -> StreamEvent {
    let Ok(value) = serde_json::from_str::<Value>(line) else {
        return StreamEvent::Raw;
    };

    if let Some(text) = extract_text(&value) {
        return StreamEvent::TextDelta(text);
    }
    if let Some(tool) = extract_tool_use(&value) {
        return StreamEvent::ToolUse(tool);
    }
    if let Some(usage) = extract_usage(&value) {
        return StreamEvent::Usage(usage);
    }
    StreamEvent::Other
}

fn extract_text(value: &Value) -> Option<String> {
    // Delta events: {"type":"content_block_delta","delta":{"text":"..."}}
    if value.get("type").and_then(Value::as_str) == Some("content_block_delta") {
        if let Some(text) = value
            .pointer("/delta/text")
            .and_then(Value::as_str)
        {
            return Some(text.to_string());
        }
    }
    // Assistant message events carry full content blocks.
    if value.get("type").and_then(Value::as_str) == Some("assistant") {
        if let Some(blocks) = value.pointer("/message/content").and_then(Value::as_array) {
            let text: String = blocks
                .iter()
                .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect();
            if !text.is_empty() {
                return Some(text);
            }
        }
    }
    None
}

fn extract_tool_use(value: &Value) -> Option<String> {
    if value.get("type").and_then(Value::as_str) == Some("tool_use") {
        return value
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string);
    }
    if let Some(blocks) = value.pointer("/message/content").and_then(Value::as_array) {
        for block in blocks {
            if block.get("type").and_then(Value::as_str) == Some("tool_use") {
                return block
                    .get("name")
                    .and_then(Value::as_str)
                    .map(str::to_string);
            }
        }
    }
    None
}

fn extract_usage(value: &Value) -> Option<u64> {
    // Direct cumulative field.
    if let Some(total) = value.get("token_usage").and_then(Value::as_u64) {
        return Some(total);
    }
    // Usage objects, either top level or nested under a result/message event.
    for pointer in ["/usage", "/message/usage", "/result/usage"] {
        if let Some(usage) = value.pointer(pointer) {
            let input = usage.get("input_tokens").and_then(Value::as_u64);
            let output = usage.get("output_tokens").and_then(Value::as_u64);
            if input.is_some() || output.is_some() {
                return Some(input.unwrap_or(0) + output.unwrap_or(0));
            }
        }
    }
    None
}

/// Accumulates a run's stdout: full raw transcript plus the extracted
/// response text, tool uses, and latest cumulative token count.
#[derive(Debug, Default)]
pub struct StreamCollector {
    pub raw_stdout: String,
    pub response_text: String,
    pub tool_uses: Vec<String>,
    pub token_usage: Option<u64>,
}

impl StreamCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ingest(&mut self, line: &str) {
        self.raw_stdout.push_str(line);
        self.raw_stdout.push('\n');
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            return;
        };
        if let Some(text) = extract_text(&value) {
            self.response_text.push_str(&text);
        }
        if let Some(tool) = extract_tool_use(&value) {
            self.tool_uses.push(tool);
        }
        if let Some(total) = extract_usage(&value) {
            self.token_usage = Some(total);
        }
    }
}

/// Re-scan a raw stdout transcript for text deltas; used when composing a
/// summary from a persisted artifact.
pub fn extract_response_text(raw_stdout: &str) -> String {
    let mut collector = StreamCollector::new();
    for line in raw_stdout.lines() {
        collector.ingest(line);
    }
    collector.response_text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_events_concatenate() {
        let mut collector = StreamCollector::new();
        collector.ingest(r#"{"type":"content_block_delta","delta":{"text":"Twilight falls"}}"#);
        collector.ingest(r#"{"type":"content_block_delta","delta":{"text":" softly"}}"#);
        assert_eq!(collector.response_text, "Twilight falls softly");
    }

    #[test]
    fn assistant_message_text_extracted() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"done"},{"type":"tool_use","name":"Write","input":{}}]}}"#;
        let mut collector = StreamCollector::new();
        collector.ingest(line);
        assert_eq!(collector.response_text, "done");
    }

    #[test]
    fn tool_use_recorded() {
        let mut collector = StreamCollector::new();
        collector.ingest(r#"{"type":"tool_use","name":"Write","input":{"path":"haiku.md"}}"#);
        assert_eq!(collector.tool_uses, vec!["Write".to_string()]);
    }

    #[test]
    fn usage_is_cumulative_latest_wins() {
        let mut collector = StreamCollector::new();
        collector.ingest(r#"{"usage":{"input_tokens":100,"output_tokens":20}}"#);
        collector.ingest(r#"{"type":"result","usage":{"input_tokens":400,"output_tokens":65}}"#);
        assert_eq!(collector.token_usage, Some(465));
    }

    #[test]
    fn direct_token_usage_field() {
        assert_eq!(
            parse_line(r#"{"token_usage":465}"#),
            StreamEvent::Usage(465)
        );
    }

    #[test]
    fn non_json_lines_retained_raw() {
        let mut collector = StreamCollector::new();
        collector.ingest("plain progress text");
        assert_eq!(collector.raw_stdout, "plain progress text\n");
        assert!(collector.response_text.is_empty());
        assert_eq!(parse_line("plain progress text"), StreamEvent::Raw);
    }

    #[test]
    fn transcript_rescan_matches_live_collection() {
        let transcript = concat!(
            r#"{"type":"content_block_delta","delta":{"text":"Dusk settles in"}}"#,
            "\n",
            "noise line\n",
            r#"{"type":"content_block_delta","delta":{"text":", quiet"}}"#,
            "\n",
        );
        assert_eq!(extract_response_text(transcript), "Dusk settles in, quiet");
    }
}
