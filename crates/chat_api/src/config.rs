use std::collections::BTreeMap;
use std::time::Duration;

use crate::retry::RetryPolicy;
use crate::url::DEFAULT_BASE_URL;

/// Sampling temperature sent when the caller does not choose one.
pub const DEFAULT_TEMPERATURE: f64 = 0.2;

/// Transport configuration for chat completion requests.
#[derive(Debug, Clone)]
pub struct ChatApiConfig {
    /// Optional bearer token passed to `Authorization`.
    pub api_key: Option<String>,
    /// Base URL of the OpenAI-compatible server.
    pub base_url: String,
    /// Optional `User-Agent` override.
    pub user_agent: Option<String>,
    /// Additional headers merged into request headers.
    pub extra_headers: BTreeMap<String, String>,
    /// Optional timeout for establishing the response (not the whole stream).
    pub timeout: Option<Duration>,
    pub temperature: f64,
    pub retry: RetryPolicy,
}

impl Default for ChatApiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            user_agent: None,
            extra_headers: BTreeMap::new(),
            timeout: None,
            temperature: DEFAULT_TEMPERATURE,
            retry: RetryPolicy::default(),
        }
    }
}

impl ChatApiConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// Sets the API key; blank keys are treated as absent.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        let api_key = api_key.into();
        self.api_key = if api_key.trim().is_empty() {
            None
        } else {
            Some(api_key)
        };
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn insert_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.insert(key.into(), value.into());
        self
    }
}
