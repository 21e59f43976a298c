//! OpenAI-compatible implementation of the shared `agent_provider` contract.
//!
//! This adapter drives `chat_api` streaming on a private current-thread
//! runtime and forwards content deltas as `Chunk` events while they arrive.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use agent_provider::{
    CancelSignal, CompletionProvider, CompletionRequest, ProviderInitError, ProviderProfile,
    StreamEvent, TransportError,
};
use chat_api::{
    ChatApiClient, ChatApiConfig, ChatApiError, ChatCompletionMessage, ChatCompletionRequest,
    ChatStreamEvent,
};

/// Stable provider identifier reported in [`ProviderProfile`].
pub const OPENAI_PROVIDER_ID: &str = "openai-compatible";

/// Runtime configuration for the OpenAI-compatible provider.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenAiProviderConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    /// Model reported by `profile`; each request still names its own model.
    pub model: String,
    pub timeout: Option<Duration>,
    pub temperature: Option<f64>,
    pub user_agent: Option<String>,
}

impl OpenAiProviderConfig {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            model: String::new(),
            timeout: None,
            temperature: None,
            user_agent: None,
        }
    }

    #[must_use]
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    fn into_chat_api_config(self) -> ChatApiConfig {
        let mut config = ChatApiConfig::new(self.base_url);

        if let Some(api_key) = self.api_key {
            config = config.with_api_key(api_key);
        }

        if let Some(timeout) = self.timeout {
            config = config.with_timeout(timeout);
        }

        if let Some(temperature) = self.temperature {
            config = config.with_temperature(temperature);
        }

        if let Some(user_agent) = self.user_agent {
            config = config.with_user_agent(user_agent);
        }

        config
    }
}

trait StreamClient: Send + Sync {
    fn stream(
        &self,
        request: &ChatCompletionRequest,
        cancel: &CancelSignal,
        on_event: &mut dyn FnMut(ChatStreamEvent),
    ) -> Result<Option<String>, ChatApiError>;

    fn list_models(&self) -> Result<Vec<String>, ChatApiError>;
}

#[derive(Debug)]
struct DefaultStreamClient {
    client: ChatApiClient,
}

impl DefaultStreamClient {
    fn runtime() -> Result<tokio::runtime::Runtime, ChatApiError> {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|error| {
                ChatApiError::Unknown(format!("failed to initialize tokio runtime: {error}"))
            })
    }
}

impl StreamClient for DefaultStreamClient {
    fn stream(
        &self,
        request: &ChatCompletionRequest,
        cancel: &CancelSignal,
        on_event: &mut dyn FnMut(ChatStreamEvent),
    ) -> Result<Option<String>, ChatApiError> {
        Self::runtime()?.block_on(
            self.client
                .stream_with_handler(request, Some(cancel), |event| on_event(event)),
        )
    }

    fn list_models(&self) -> Result<Vec<String>, ChatApiError> {
        Self::runtime()?.block_on(self.client.list_models(None))
    }
}

/// `CompletionProvider` adapter backed by `chat_api` transport primitives.
pub struct OpenAiProvider {
    model: String,
    endpoint: String,
    stream_client: Arc<dyn StreamClient>,
}

impl OpenAiProvider {
    /// Creates a provider using real HTTP transport.
    pub fn new(config: OpenAiProviderConfig) -> Result<Self, ProviderInitError> {
        let model = config.model.trim().to_string();
        let client = ChatApiClient::new(config.into_chat_api_config()).map_err(map_init_error)?;
        let endpoint = client.endpoint();

        Ok(Self {
            model,
            endpoint,
            stream_client: Arc::new(DefaultStreamClient { client }),
        })
    }

    /// Returns the resolved chat completions URL.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Lists the models the server advertises.
    pub fn list_models(&self) -> Result<Vec<String>, TransportError> {
        self.stream_client
            .list_models()
            .map_err(|error| map_transport_error(&error))
    }

    #[cfg(test)]
    fn with_stream_client_for_tests(model: &str, stream_client: Arc<dyn StreamClient>) -> Self {
        Self {
            model: model.to_string(),
            endpoint: String::new(),
            stream_client,
        }
    }
}

impl CompletionProvider for OpenAiProvider {
    fn profile(&self) -> ProviderProfile {
        ProviderProfile {
            provider_id: OPENAI_PROVIDER_ID.to_string(),
            model_id: self.model.clone(),
        }
    }

    fn stream(
        &self,
        req: CompletionRequest,
        cancel: CancelSignal,
        emit: &mut dyn FnMut(StreamEvent),
    ) -> Result<(), String> {
        emit(StreamEvent::Started);

        if cancel.load(Ordering::Acquire) {
            emit(StreamEvent::Cancelled);
            return Ok(());
        }

        let request = ChatCompletionRequest::new(
            req.model,
            req.messages
                .into_iter()
                .map(|message| ChatCompletionMessage::new(message.role.as_str(), message.content))
                .collect(),
        );

        let outcome = self.stream_client.stream(&request, &cancel, &mut |event| {
            if let ChatStreamEvent::ContentDelta { delta } = event {
                if !delta.is_empty() {
                    emit(StreamEvent::Chunk { text: delta });
                }
            }
        });

        match outcome {
            Ok(finish_reason) => {
                tracing::debug!(?finish_reason, "completion stream finished");
                emit(StreamEvent::Finished);
            }
            Err(ChatApiError::Cancelled) => emit(StreamEvent::Cancelled),
            Err(error) => {
                tracing::debug!(%error, "completion stream failed");
                emit(StreamEvent::Failed {
                    error: map_transport_error(&error),
                });
            }
        }

        Ok(())
    }
}

fn map_transport_error(error: &ChatApiError) -> TransportError {
    match error {
        ChatApiError::Status(status, message) => {
            TransportError::with_status(status.as_u16(), message.clone())
        }
        other => match other.status() {
            Some(status) => TransportError::with_status(status.as_u16(), other.to_string()),
            None => TransportError::new(other.to_string()),
        },
    }
}

fn map_init_error(error: ChatApiError) -> ProviderInitError {
    ProviderInitError::new(format!("failed to initialize chat completion client: {error}"))
}
