use serde_json::Value;

use crate::error::{in_band_error, ChatApiError};
use crate::events::ChatStreamEvent;

const DONE_SENTINEL: &str = "[DONE]";

/// Incremental parser for chat completion SSE streams.
///
/// Bytes are buffered until a full frame (terminated by a blank line) is
/// available, so UTF-8 sequences split across network chunks decode intact.
#[derive(Debug, Default)]
pub struct SseStreamParser {
    buffer: Vec<u8>,
}

impl SseStreamParser {
    /// Feed arbitrary bytes into the parser and drain complete events.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<ChatStreamEvent>, ChatApiError> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some((end, separator_len)) = find_frame_boundary(&self.buffer) {
            let frame: Vec<u8> = self.buffer.drain(..end + separator_len).take(end).collect();
            let frame = String::from_utf8_lossy(&frame);

            if let Some(payload) = extract_data_payload(&frame) {
                events.extend(parse_payload(&payload)?);
            }
        }

        Ok(events)
    }

    /// Flushes a trailing frame that was not followed by a blank line.
    pub fn finish(&mut self) -> Result<Vec<ChatStreamEvent>, ChatApiError> {
        let rest = std::mem::take(&mut self.buffer);
        let frame = String::from_utf8_lossy(&rest);
        match extract_data_payload(&frame) {
            Some(payload) => parse_payload(&payload),
            None => Ok(Vec::new()),
        }
    }

    /// Parse a complete SSE payload string in one shot.
    pub fn parse_frames(input: &str) -> Result<Vec<ChatStreamEvent>, ChatApiError> {
        let mut parser = Self::default();
        let mut events = parser.feed(input.as_bytes())?;
        events.extend(parser.finish()?);
        Ok(events)
    }

    pub fn is_empty_buffer(&self) -> bool {
        self.buffer.iter().all(u8::is_ascii_whitespace)
    }
}

fn find_frame_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|window| window == b"\n\n");
    let crlf = buffer.windows(4).position(|window| window == b"\r\n\r\n");

    match (lf, crlf) {
        (Some(lf), Some(crlf)) if crlf < lf => Some((crlf, 4)),
        (Some(lf), _) => Some((lf, 2)),
        (None, Some(crlf)) => Some((crlf, 4)),
        (None, None) => None,
    }
}

fn extract_data_payload(frame: &str) -> Option<String> {
    let data_lines: Vec<&str> = frame
        .lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.starts_with(':'))
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|value| value.strip_prefix(' ').unwrap_or(value))
        .collect();

    if data_lines.is_empty() {
        return None;
    }

    let payload = data_lines.join("\n");
    if payload.trim().is_empty() {
        None
    } else {
        Some(payload.trim().to_string())
    }
}

fn parse_payload(payload: &str) -> Result<Vec<ChatStreamEvent>, ChatApiError> {
    if payload == DONE_SENTINEL {
        return Ok(vec![ChatStreamEvent::Done]);
    }

    let value: Value = serde_json::from_str(payload).map_err(|error| {
        ChatApiError::MalformedSse(format!("{error}; data: {}", truncate_for_error(payload)))
    })?;

    if let Some((code, message)) = in_band_error(&value) {
        return Ok(vec![ChatStreamEvent::Error { code, message }]);
    }

    Ok(map_chunk(&value))
}

fn map_chunk(value: &Value) -> Vec<ChatStreamEvent> {
    let Some(choice) = value
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
    else {
        // Keepalive and usage-only chunks carry no choices.
        return Vec::new();
    };

    let mut events = Vec::new();
    let delta = choice
        .get("delta")
        .and_then(|delta| delta.get("content"))
        .and_then(Value::as_str)
        .or_else(|| choice.get("text").and_then(Value::as_str));
    if let Some(delta) = delta.filter(|delta| !delta.is_empty()) {
        events.push(ChatStreamEvent::ContentDelta {
            delta: delta.to_owned(),
        });
    }

    if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
        events.push(ChatStreamEvent::Finished {
            reason: reason.to_owned(),
        });
    }

    events
}

fn truncate_for_error(payload: &str) -> String {
    const LIMIT: usize = 200;
    if payload.len() <= LIMIT {
        return payload.to_string();
    }
    let mut cutoff = LIMIT;
    while !payload.is_char_boundary(cutoff) {
        cutoff -= 1;
    }
    format!("{}...", &payload[..cutoff])
}
