use std::future::Future;
use std::sync::{atomic::AtomicBool, atomic::Ordering, Arc};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;

use crate::config::ChatApiConfig;
use crate::error::{parse_error_message, ChatApiError};
use crate::events::ChatStreamEvent;
use crate::headers::build_headers;
use crate::payload::ChatCompletionRequest;
use crate::retry::is_transient_failure;
use crate::sse::SseStreamParser;
use crate::url::{normalize_chat_completions_url, normalize_models_url};

/// Optional cancellation signal shared across request and stream loops.
pub type CancellationSignal = Arc<AtomicBool>;

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug)]
pub struct ChatApiClient {
    http: Client,
    config: ChatApiConfig,
}

#[derive(Debug, Clone)]
pub struct StreamResult {
    pub events: Vec<ChatStreamEvent>,
    /// The `finish_reason` reported by the server, if any.
    pub finish_reason: Option<String>,
}

impl StreamResult {
    /// Concatenates every content delta in arrival order.
    pub fn text(&self) -> String {
        self.events
            .iter()
            .filter_map(|event| match event {
                ChatStreamEvent::ContentDelta { delta } => Some(delta.as_str()),
                _ => None,
            })
            .collect()
    }
}

impl ChatApiClient {
    pub fn new(config: ChatApiConfig) -> Result<Self, ChatApiError> {
        let mut builder = Client::builder();
        if let Some(timeout) = config.timeout {
            builder = builder.connect_timeout(timeout);
        }
        let http = builder.build().map_err(ChatApiError::from)?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &ChatApiConfig {
        &self.config
    }

    pub fn endpoint(&self) -> String {
        normalize_chat_completions_url(&self.config.base_url)
    }

    pub fn models_endpoint(&self) -> String {
        normalize_models_url(&self.config.base_url)
    }

    pub fn build_headers(&self, user_agent: Option<&str>) -> Result<HeaderMap, ChatApiError> {
        let headers = build_headers(&self.config, user_agent);
        let mut out = HeaderMap::new();
        for (key, value) in headers {
            out.insert(
                HeaderName::from_bytes(key.as_bytes())
                    .map_err(|_| ChatApiError::InvalidHeader(format!("invalid header key: {key}")))?,
                HeaderValue::from_str(&value).map_err(|_| {
                    ChatApiError::InvalidHeader(format!("invalid header value for {key}"))
                })?,
            );
        }
        Ok(out)
    }

    pub fn build_request(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<reqwest::RequestBuilder, ChatApiError> {
        validate_base_url(&self.config.base_url)?;

        let headers = self.build_headers(self.config.user_agent.as_deref())?;
        let payload = self.request_with_transport_defaults(request);
        Ok(self.http.post(self.endpoint()).headers(headers).json(&payload))
    }

    fn request_with_transport_defaults(
        &self,
        request: &ChatCompletionRequest,
    ) -> ChatCompletionRequest {
        let mut payload = request.clone();
        payload.stream = true;
        if payload.temperature.is_none() {
            payload.temperature = Some(self.config.temperature);
        }
        payload
    }

    /// Sends the request, retrying transient failures before any byte of the
    /// response body has been consumed.
    pub async fn send_with_retry(
        &self,
        request: &ChatCompletionRequest,
        cancellation: Option<&CancellationSignal>,
    ) -> Result<Response, ChatApiError> {
        let mut last_status: Option<StatusCode> = None;
        let mut last_error = None;
        let policy = self.config.retry;

        for attempt in 0..=policy.max_retries {
            if is_cancelled(cancellation) {
                return Err(ChatApiError::Cancelled);
            }

            let response = self.build_request(request)?.send();
            let response = await_or_cancel(response, cancellation)
                .await?
                .map_err(ChatApiError::from);

            match response {
                Ok(response) => {
                    if response.status().is_success() {
                        return Ok(response);
                    }

                    let status = response.status();
                    last_status = Some(status);
                    let body = await_or_cancel(response.text(), cancellation)
                        .await?
                        .unwrap_or_default();
                    let message = parse_error_message(status, &body);
                    last_error = Some(message.clone());

                    if policy.has_retry_after(attempt)
                        && is_transient_failure(status.as_u16(), &body)
                    {
                        tracing::debug!(
                            attempt,
                            status = status.as_u16(),
                            "retrying chat completion request"
                        );
                        await_or_cancel(tokio::time::sleep(policy.backoff(attempt)), cancellation)
                            .await?;
                        continue;
                    }

                    return Err(ChatApiError::Status(status, message));
                }
                Err(error) => {
                    let message = error.to_string();
                    last_error = Some(message);
                    if policy.has_retry_after(attempt) {
                        tracing::debug!(attempt, error = %error, "retrying after transport error");
                        await_or_cancel(tokio::time::sleep(policy.backoff(attempt)), cancellation)
                            .await?;
                        continue;
                    }
                    return Err(ChatApiError::RetryExhausted {
                        status: last_status,
                        last_error,
                    });
                }
            }
        }

        Err(ChatApiError::RetryExhausted {
            status: last_status,
            last_error,
        })
    }

    /// Streams one completion, handing every parsed event to `on_event`.
    ///
    /// Returns the server's `finish_reason` when one was reported. A stream
    /// that closes without `[DONE]` or a `finish_reason` is an error.
    pub async fn stream_with_handler<F>(
        &self,
        request: &ChatCompletionRequest,
        cancellation: Option<&CancellationSignal>,
        mut on_event: F,
    ) -> Result<Option<String>, ChatApiError>
    where
        F: FnMut(ChatStreamEvent),
    {
        let response = self.send_with_retry(request, cancellation).await?;
        let mut bytes = response.bytes_stream();
        let mut parser = SseStreamParser::default();
        let mut termination = StreamTermination::default();

        loop {
            let Some(chunk) = await_or_cancel(bytes.next(), cancellation).await? else {
                break;
            };
            if is_cancelled(cancellation) {
                return Err(ChatApiError::Cancelled);
            }
            let chunk = chunk.map_err(ChatApiError::from)?;
            for event in parser.feed(&chunk)? {
                process_stream_event(event, &mut termination, &mut on_event)?;
            }
            if termination.done {
                break;
            }
        }

        if !termination.done {
            for event in parser.finish()? {
                process_stream_event(event, &mut termination, &mut on_event)?;
            }
        }

        if is_cancelled(cancellation) {
            return Err(ChatApiError::Cancelled);
        }

        if !termination.seen() {
            return Err(ChatApiError::IncompleteStream);
        }

        Ok(termination.finish_reason)
    }

    pub async fn stream(
        &self,
        request: &ChatCompletionRequest,
        cancellation: Option<&CancellationSignal>,
    ) -> Result<StreamResult, ChatApiError> {
        let mut events = Vec::new();
        let finish_reason = self
            .stream_with_handler(request, cancellation, |event| {
                events.push(event);
            })
            .await?;

        Ok(StreamResult {
            events,
            finish_reason,
        })
    }

    /// Lists model identifiers advertised by the server's `/models` endpoint.
    pub async fn list_models(
        &self,
        cancellation: Option<&CancellationSignal>,
    ) -> Result<Vec<String>, ChatApiError> {
        validate_base_url(&self.config.base_url)?;

        let mut headers = self.build_headers(self.config.user_agent.as_deref())?;
        headers.insert(
            reqwest::header::ACCEPT,
            HeaderValue::from_static("application/json"),
        );
        headers.remove(reqwest::header::CONTENT_TYPE);

        let response = self.http.get(self.models_endpoint()).headers(headers).send();
        let response = await_or_cancel(response, cancellation).await??;
        let status = response.status();
        let body = await_or_cancel(response.text(), cancellation).await??;

        if !status.is_success() {
            return Err(ChatApiError::Status(
                status,
                parse_error_message(status, &body),
            ));
        }

        let value: Value = serde_json::from_str(&body)?;
        parse_model_ids(&value)
    }
}

#[derive(Debug, Default)]
struct StreamTermination {
    done: bool,
    finish_reason: Option<String>,
}

impl StreamTermination {
    fn seen(&self) -> bool {
        self.done || self.finish_reason.is_some()
    }
}

fn process_stream_event<F>(
    event: ChatStreamEvent,
    termination: &mut StreamTermination,
    on_event: &mut F,
) -> Result<(), ChatApiError>
where
    F: FnMut(ChatStreamEvent),
{
    match &event {
        ChatStreamEvent::Error { code, message } => {
            return Err(ChatApiError::StreamFailed {
                code: code.clone(),
                message: message
                    .clone()
                    .or_else(|| code.clone())
                    .unwrap_or_else(|| "server reported an error".to_owned()),
            });
        }
        ChatStreamEvent::Finished { reason } => termination.finish_reason = Some(reason.clone()),
        ChatStreamEvent::Done => termination.done = true,
        ChatStreamEvent::ContentDelta { .. } => {}
    }

    on_event(event);
    Ok(())
}

/// Accepts both `{"data": [{"id": ..}]}` and a bare list of ids or objects.
fn parse_model_ids(value: &Value) -> Result<Vec<String>, ChatApiError> {
    let entries = match value {
        Value::Object(object) => object.get("data").and_then(Value::as_array),
        Value::Array(entries) => Some(entries),
        _ => None,
    }
    .ok_or_else(|| {
        ChatApiError::UnexpectedResponse("model listing has no `data` array".to_owned())
    })?;

    Ok(entries
        .iter()
        .filter_map(|entry| match entry {
            Value::String(id) => Some(id.clone()),
            Value::Object(object) => object.get("id").and_then(Value::as_str).map(str::to_owned),
            _ => None,
        })
        .collect())
}

fn validate_base_url(base_url: &str) -> Result<(), ChatApiError> {
    let trimmed = base_url.trim();
    if trimmed.is_empty() || trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        return Ok(());
    }
    Err(ChatApiError::InvalidBaseUrl(trimmed.to_owned()))
}

fn is_cancelled(cancel: Option<&CancellationSignal>) -> bool {
    cancel.is_some_and(|token| token.load(Ordering::Acquire))
}

async fn await_or_cancel<F>(
    future: F,
    cancellation: Option<&CancellationSignal>,
) -> Result<F::Output, ChatApiError>
where
    F: Future,
{
    if cancellation.is_none() {
        return Ok(future.await);
    }

    let mut future = Box::pin(future);

    loop {
        if is_cancelled(cancellation) {
            return Err(ChatApiError::Cancelled);
        }

        if let Ok(output) = tokio::time::timeout(CANCEL_POLL_INTERVAL, &mut future).await {
            if is_cancelled(cancellation) {
                return Err(ChatApiError::Cancelled);
            }
            return Ok(output);
        }
    }
}
