use std::fmt;

use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Error as JsonError;

#[derive(Debug)]
pub enum ChatApiError {
    InvalidBaseUrl(String),
    InvalidHeader(String),
    Request(reqwest::Error),
    Status(StatusCode, String),
    MalformedSse(String),
    Serde(JsonError),
    RetryExhausted {
        status: Option<StatusCode>,
        last_error: Option<String>,
    },
    StreamFailed {
        code: Option<String>,
        message: String,
    },
    /// The connection closed before `[DONE]` or a `finish_reason` arrived.
    IncompleteStream,
    UnexpectedResponse(String),
    Cancelled,
    Unknown(String),
}

impl ChatApiError {
    /// Returns the HTTP status associated with this failure, when one was observed.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Status(status, _) => Some(*status),
            Self::RetryExhausted { status, .. } => *status,
            Self::Request(error) => error.status(),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ErrorPayload {
    #[serde(rename = "error")]
    pub value: Option<ErrorPayloadValue>,
}

/// Servers disagree on the error shape: OpenAI nests an object, others send a string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum ErrorPayloadValue {
    Fields(ErrorPayloadFields),
    Text(String),
}

#[derive(Debug, Deserialize)]
pub(crate) struct ErrorPayloadFields {
    pub message: Option<String>,
    pub code: Option<serde_json::Value>,
    #[serde(rename = "type")]
    pub type_: Option<String>,
}

impl ErrorPayloadValue {
    fn message(&self) -> Option<String> {
        match self {
            Self::Fields(fields) => fields
                .message
                .as_deref()
                .and_then(non_empty_string)
                .map(str::to_owned),
            Self::Text(text) => non_empty_string(text).map(str::to_owned),
        }
    }
}

impl ErrorPayloadFields {
    pub fn code_label(&self) -> Option<String> {
        match &self.code {
            Some(serde_json::Value::String(code)) => non_empty_string(code).map(str::to_owned),
            Some(serde_json::Value::Number(code)) => Some(code.to_string()),
            _ => self.type_.as_deref().and_then(non_empty_string).map(str::to_owned),
        }
    }
}

impl fmt::Display for ChatApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidBaseUrl(value) => write!(f, "invalid base URL: {value}"),
            Self::InvalidHeader(message) => write!(f, "invalid header: {message}"),
            Self::Request(error) => write!(f, "request error: {error}"),
            Self::Status(status, message) => write!(f, "HTTP {status} {message}"),
            Self::MalformedSse(message) => write!(f, "malformed SSE event: {message}"),
            Self::Serde(error) => write!(f, "serialization error: {error}"),
            Self::RetryExhausted { status, last_error } => {
                let status = status
                    .map(|status| status.as_u16().to_string())
                    .unwrap_or_else(|| "n/a".to_owned());
                let last_error = last_error.as_deref().unwrap_or("unknown error");
                write!(
                    f,
                    "retry exhausted after max attempts (status: {status}, last_error: {last_error})"
                )
            }
            Self::StreamFailed { code, message } => match code {
                Some(code) if !code.trim().is_empty() => {
                    write!(f, "stream failed ({code}): {message}")
                }
                _ => write!(f, "stream failed: {message}"),
            },
            Self::IncompleteStream => {
                write!(f, "stream ended before the server signalled completion")
            }
            Self::UnexpectedResponse(message) => write!(f, "unexpected response: {message}"),
            Self::Cancelled => write!(f, "request was cancelled"),
            Self::Unknown(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for ChatApiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Request(error) => Some(error),
            Self::Serde(error) => Some(error),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ChatApiError {
    fn from(error: reqwest::Error) -> Self {
        Self::Request(error)
    }
}

impl From<JsonError> for ChatApiError {
    fn from(error: JsonError) -> Self {
        Self::Serde(error)
    }
}

/// Extracts a human-readable message from a non-success response body.
pub fn parse_error_message(status: StatusCode, body: &str) -> String {
    let fallback = || {
        if body.trim().is_empty() {
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string()
        } else {
            body.trim().to_string()
        }
    };

    match serde_json::from_str::<ErrorPayload>(body) {
        Ok(ErrorPayload { value: Some(value) }) => value.message().unwrap_or_else(fallback),
        _ => fallback(),
    }
}

pub(crate) fn in_band_error(value: &serde_json::Value) -> Option<(Option<String>, Option<String>)> {
    let error = value.get("error")?;
    if error.is_null() {
        return None;
    }

    match serde_json::from_value::<ErrorPayloadValue>(error.clone()) {
        Ok(ErrorPayloadValue::Fields(fields)) => Some((
            fields.code_label(),
            fields.message.as_deref().and_then(non_empty_string).map(str::to_owned),
        )),
        Ok(ErrorPayloadValue::Text(text)) => Some((None, Some(text))),
        Err(_) => Some((None, Some(error.to_string()))),
    }
}

fn non_empty_string(value: &str) -> Option<&str> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}
