use serde::{Deserialize, Serialize};

/// Stream event emitted by the SSE parser after normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatStreamEvent {
    /// Incremental assistant text.
    ContentDelta { delta: String },
    /// `finish_reason` reported on a choice.
    Finished { reason: String },
    /// The `[DONE]` sentinel.
    Done,
    /// Error object sent in-band by the server.
    Error {
        code: Option<String>,
        message: Option<String>,
    },
}

impl ChatStreamEvent {
    /// Returns true when the event marks the end of the completion.
    pub fn is_termination(&self) -> bool {
        matches!(self, Self::Finished { .. } | Self::Done)
    }
}
