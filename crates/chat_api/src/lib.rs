//! Transport-only client primitives for OpenAI-compatible chat endpoints.
//!
//! This crate owns request building, SSE framing, error mapping, and
//! cancellable streaming for `/v1/chat/completions`, plus model listing via
//! `/v1/models`. It contains no conversation policy and no terminal coupling.

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod headers;
pub mod payload;
pub mod retry;
pub mod sse;
pub mod url;

pub use client::CancellationSignal;
pub use client::ChatApiClient;
pub use client::StreamResult;
pub use config::ChatApiConfig;
pub use error::ChatApiError;
pub use events::ChatStreamEvent;
pub use payload::{ChatCompletionRequest, ChatCompletionMessage};
pub use retry::RetryPolicy;
pub use reqwest::StatusCode;
pub use sse::SseStreamParser;
pub use url::{normalize_chat_completions_url, normalize_models_url};
