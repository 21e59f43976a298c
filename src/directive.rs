//! Directive extraction from free-form model replies.
//!
//! A reply carries at most one structured directive: a ```` ```json ```` fenced
//! block wins, otherwise the first brace-balanced `{...}` span is used. The
//! candidate is parsed as JSON and matched against the tool-call and
//! final-answer shapes.

use serde_json::Value;
use thiserror::Error;

const FENCE: &str = "```";

/// Structured instruction extracted from one model reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    ToolCall { tool: String, input: String },
    FinalAnswer { text: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractionReason {
    #[error("reply is empty")]
    Empty,
    #[error("no JSON object found in reply")]
    NoPayload,
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("JSON is neither a tool call nor a final answer")]
    UnrecognizedShape,
}

/// Raised when a reply holds no usable directive. Keeps the raw text for
/// diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct ExtractionFailure {
    pub raw: String,
    pub reason: ExtractionReason,
}

/// Recognized JSON payload shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadShape {
    ToolCall,
    FinalAnswer,
    /// `{"tool": .., "result": ..}` or `{"error": ..}` written back by the agent.
    Observation,
    Unknown,
}

/// Extracts the directive carried by `raw`.
pub fn extract(raw: &str) -> Result<Directive, ExtractionFailure> {
    let fail = |reason| ExtractionFailure {
        raw: raw.to_string(),
        reason,
    };

    if raw.trim().is_empty() {
        return Err(fail(ExtractionReason::Empty));
    }

    let payload = candidate_payload(raw).ok_or_else(|| fail(ExtractionReason::NoPayload))?;
    let value: Value = serde_json::from_str(payload)
        .map_err(|error| fail(ExtractionReason::InvalidJson(error.to_string())))?;

    directive_from_value(&value).ok_or_else(|| fail(ExtractionReason::UnrecognizedShape))
}

/// Returns the text that should be parsed as the structured payload.
pub fn candidate_payload(raw: &str) -> Option<&str> {
    fenced_json_block(raw).or_else(|| first_balanced_object(raw))
}

/// Classifies a parsed payload without building a directive.
pub fn classify(value: &Value) -> PayloadShape {
    let Some(object) = value.as_object() else {
        return PayloadShape::Unknown;
    };

    if object.contains_key("final") {
        return PayloadShape::FinalAnswer;
    }
    if object.contains_key("result") && object.contains_key("tool") {
        return PayloadShape::Observation;
    }
    if object.contains_key("error") && !object.contains_key("tool") {
        return PayloadShape::Observation;
    }

    let named_tool = object
        .get("tool")
        .and_then(Value::as_str)
        .is_some_and(|tool| !tool.trim().is_empty());
    let has_input = ["input", "args"]
        .iter()
        .any(|key| object.get(*key).is_some_and(|value| !value.is_null()));
    if named_tool && has_input {
        return PayloadShape::ToolCall;
    }

    PayloadShape::Unknown
}

fn directive_from_value(value: &Value) -> Option<Directive> {
    match classify(value) {
        PayloadShape::FinalAnswer => Some(Directive::FinalAnswer {
            text: value_text(&value["final"]),
        }),
        PayloadShape::ToolCall => {
            let tool = value["tool"].as_str()?.trim().to_string();
            let input = ["input", "args"]
                .iter()
                .filter_map(|key| value.get(*key))
                .find(|input| !input.is_null())?;
            Some(Directive::ToolCall {
                tool,
                input: value_text(input),
            })
        }
        PayloadShape::Observation | PayloadShape::Unknown => None,
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Finds the interior of the first ```` ```json ```` fence. Fences with other
/// tags are skipped whole; an unterminated json fence yields nothing.
fn fenced_json_block(raw: &str) -> Option<&str> {
    let mut search_from = 0;

    while let Some(offset) = raw[search_from..].find(FENCE) {
        let info_start = search_from + offset + FENCE.len();
        let info_end = info_start + raw[info_start..].find('\n')?;
        let body_start = info_end + 1;
        let close = raw[body_start..].find(FENCE).map(|close| body_start + close);

        if raw[info_start..info_end].trim().eq_ignore_ascii_case("json") {
            return close.map(|close| raw[body_start..close].trim());
        }

        search_from = close? + FENCE.len();
    }

    None
}

/// Returns the first `{...}` span whose braces balance, honoring JSON string
/// quoting inside the span.
fn first_balanced_object(raw: &str) -> Option<&str> {
    let mut search_from = 0;

    while let Some(offset) = raw[search_from..].find('{') {
        let start = search_from + offset;
        if let Some(len) = balanced_span_len(&raw[start..]) {
            return Some(&raw[start..start + len]);
        }
        search_from = start + 1;
    }

    None
}

fn balanced_span_len(span: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (index, ch) in span.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(index + ch.len_utf8());
                }
            }
            _ => {}
        }
    }

    None
}
