//! Step Output Interpretation
//!
//! Commands may or may not print JSON. Parsing is best effort: when the
//! caller expects JSON and gets something else, the redacted text is kept
//! and a warning is logged instead of failing the step.

use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;

/// Interpreted stdout of a finished step.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepOutput {
    /// Nothing was printed
    Empty,
    /// Valid JSON document
    Json { value: Value },
    /// Gateway tool envelope, with its text payload re-parsed when possible
    Tool {
        text: Option<String>,
        parsed: Option<Value>,
    },
    /// Non-JSON (or unexpected) output
    Text { text: String },
}

impl StepOutput {
    /// One-line description used in trace summaries.
    pub fn describe(&self) -> String {
        match self {
            Self::Empty => "no output".to_string(),
            Self::Json { value } => match value {
                Value::Object(map) => format!("json object ({} keys)", map.len()),
                Value::Array(items) => format!("json array ({} items)", items.len()),
                _ => "json value".to_string(),
            },
            Self::Tool { parsed: Some(_), .. } => "tool result (json)".to_string(),
            Self::Tool { text: Some(_), .. } => "tool result (text)".to_string(),
            Self::Tool { .. } => "tool result (empty)".to_string(),
            Self::Text { text } => format!("{} bytes of text", text.len()),
        }
    }
}

/// Parses already-redacted stdout.
///
/// When `expect_json` is false any text is accepted as-is; JSON is still
/// recognised so structured results stay structured in the trace.
pub fn parse_output(stdout: &str, expect_json: bool) -> StepOutput {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return StepOutput::Empty;
    }

    match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => StepOutput::Json { value },
        Err(e) => {
            if expect_json {
                let err = EngineError::MalformedOutput(e.to_string());
                warn!("{}; keeping raw output", err);
            }
            StepOutput::Text {
                text: trimmed.to_string(),
            }
        }
    }
}

/// Unpacks a gateway tool response (`{"result":{"content":[{"type":"text","text":..}]}}`).
pub fn parse_tool_output(stdout: &str) -> StepOutput {
    let value = match parse_output(stdout, true) {
        StepOutput::Json { value } => value,
        other => return other,
    };

    let text = value
        .pointer("/result/content")
        .and_then(Value::as_array)
        .and_then(|items| {
            items.iter().find(|item| {
                item.get("type").and_then(Value::as_str) == Some("text")
            })
        })
        .and_then(|item| item.get("text"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let Some(text) = text else {
        return StepOutput::Json { value };
    };

    let parsed = serde_json::from_str::<Value>(text.trim()).ok();
    StepOutput::Tool {
        text: Some(text),
        parsed,
    }
}

/// Cuts `text` to at most `max_bytes`, respecting UTF-8 boundaries.
///
/// Returns the kept prefix and whether anything was dropped.
pub fn truncate_utf8(text: &str, max_bytes: usize) -> (&str, bool) {
    if text.len() <= max_bytes {
        return (text, false);
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    (&text[..end], true)
}
