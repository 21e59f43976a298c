//! Minimal provider-agnostic contract for streaming one chat completion.
//!
//! This crate defines only the conversation types and the completion lifecycle
//! shared between the agent loop and concrete providers. It excludes transport
//! details, wire payloads, and any multi-step orchestration.

use std::fmt;
use std::sync::{atomic::AtomicBool, Arc};

use serde::{Deserialize, Serialize};

/// Shared cancellation flag for a completion request.
pub type CancelSignal = Arc<AtomicBool>;

/// Error returned while constructing/configuring a provider before any request starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderInitError {
    message: String,
}

impl ProviderInitError {
    /// Creates a new provider initialization error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Returns the underlying error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for ProviderInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ProviderInitError {}

impl From<String> for ProviderInitError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for ProviderInitError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Unrecoverable failure talking to the completion endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    /// HTTP-like status when the endpoint answered at all.
    pub status: Option<u16>,
    pub message: String,
}

impl TransportError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn with_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "HTTP {status}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for TransportError {}

/// Author of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One entry of model-facing conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Input required to start one streamed completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
}

/// Provider-emitted lifecycle event for one completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Started,
    Chunk { text: String },
    Finished,
    Failed { error: TransportError },
    Cancelled,
}

impl StreamEvent {
    /// Returns true when this event terminates the completion lifecycle.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Finished | Self::Failed { .. } | Self::Cancelled
        )
    }
}

/// Immutable metadata describing a completion provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderProfile {
    pub provider_id: String,
    pub model_id: String,
}

/// Provider interface for streaming one completion request.
pub trait CompletionProvider: Send + Sync + 'static {
    /// Returns provider/model identity metadata.
    fn profile(&self) -> ProviderProfile;

    /// Streams a completion and emits lifecycle events in provider order.
    ///
    /// Implementations emit `Started`, any number of `Chunk`s, then exactly one
    /// terminal event. Observing `cancel` must end the stream with `Cancelled`.
    /// An `Err` return is reported to the caller as a transport failure.
    fn stream(
        &self,
        req: CompletionRequest,
        cancel: CancelSignal,
        emit: &mut dyn FnMut(StreamEvent),
    ) -> Result<(), String>;
}

#[cfg(test)]
mod tests {
    use super::{
        CancelSignal, ChatMessage, CompletionProvider, CompletionRequest, ProviderInitError,
        ProviderProfile, Role, StreamEvent, TransportError,
    };

    struct MinimalProvider;

    impl CompletionProvider for MinimalProvider {
        fn profile(&self) -> ProviderProfile {
            ProviderProfile {
                provider_id: "minimal".to_string(),
                model_id: "minimal-model".to_string(),
            }
        }

        fn stream(
            &self,
            _req: CompletionRequest,
            _cancel: CancelSignal,
            emit: &mut dyn FnMut(StreamEvent),
        ) -> Result<(), String> {
            emit(StreamEvent::Started);
            emit(StreamEvent::Finished);
            Ok(())
        }
    }

    #[test]
    fn stream_event_terminal_detection_matches_lifecycle() {
        assert!(!StreamEvent::Started.is_terminal());
        assert!(!StreamEvent::Chunk {
            text: "hello".to_string(),
        }
        .is_terminal());
        assert!(StreamEvent::Finished.is_terminal());
        assert!(StreamEvent::Failed {
            error: TransportError::new("boom"),
        }
        .is_terminal());
        assert!(StreamEvent::Cancelled.is_terminal());
    }

    #[test]
    fn provider_init_error_preserves_message() {
        let error = ProviderInitError::new("missing base url");
        assert_eq!(error.message(), "missing base url");
        assert_eq!(error.to_string(), "missing base url");
    }

    #[test]
    fn transport_error_display_includes_status_when_known() {
        assert_eq!(
            TransportError::with_status(401, "invalid api key").to_string(),
            "HTTP 401: invalid api key"
        );
        assert_eq!(
            TransportError::new("connection refused").to_string(),
            "connection refused"
        );
    }

    #[test]
    fn chat_message_roles_serialize_lowercase() {
        let message = ChatMessage::assistant("hi");
        let value = serde_json::to_value(&message).expect("serialize message");

        assert_eq!(value["role"], "assistant");
        assert_eq!(value["content"], "hi");
        assert_eq!(Role::System.as_str(), "system");
    }

    #[test]
    fn minimal_provider_emits_started_then_terminal() {
        let provider = MinimalProvider;
        let mut events = Vec::new();
        provider
            .stream(
                CompletionRequest {
                    model: "minimal-model".to_string(),
                    messages: vec![ChatMessage::user("hello")],
                },
                CancelSignal::default(),
                &mut |event| events.push(event),
            )
            .expect("minimal provider should not fail");

        assert_eq!(events, vec![StreamEvent::Started, StreamEvent::Finished]);
        assert_eq!(provider.profile().provider_id, "minimal");
    }
}
