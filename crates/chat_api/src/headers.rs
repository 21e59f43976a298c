use std::collections::BTreeMap;

use crate::config::ChatApiConfig;

pub const HEADER_ACCEPT: &str = "accept";
pub const HEADER_CONTENT_TYPE: &str = "content-type";
pub const HEADER_AUTHORIZATION: &str = "authorization";
pub const HEADER_USER_AGENT: &str = "user-agent";

/// Build a deterministic header map for chat completion requests.
///
/// `Authorization` is only sent when a non-blank API key is configured, since
/// local OpenAI-compatible servers commonly run without one.
pub fn build_headers(config: &ChatApiConfig, user_agent: Option<&str>) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();

    if let Some(api_key) = config
        .api_key
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        headers.insert(HEADER_AUTHORIZATION.to_owned(), format!("Bearer {api_key}"));
    }
    headers.insert(HEADER_ACCEPT.to_owned(), "text/event-stream".to_owned());
    headers.insert(
        HEADER_CONTENT_TYPE.to_owned(),
        "application/json".to_owned(),
    );

    let ua = match (user_agent, config.user_agent.as_deref()) {
        (Some(explicit), _) if !explicit.trim().is_empty() => explicit.trim().to_owned(),
        (None, Some(explicit)) if !explicit.trim().is_empty() => explicit.trim().to_owned(),
        _ => default_user_agent(),
    };
    headers.insert(HEADER_USER_AGENT.to_owned(), ua);

    for (key, value) in &config.extra_headers {
        headers.insert(key.trim().to_ascii_lowercase(), value.trim().to_owned());
    }

    headers
}

pub fn default_user_agent() -> String {
    format!(
        "chat_api/{} ({} {})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}
