/// Default base URL when none is configured.
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com";

const CHAT_COMPLETIONS_PATH: &str = "/chat/completions";
const MODELS_PATH: &str = "/models";

/// Normalize a base URL to the chat completions endpoint.
///
/// Normalization rules:
/// 1) keep `/chat/completions` unchanged
/// 2) append `/chat/completions` when path ends in `/v1`
/// 3) append `/v1/chat/completions` otherwise
pub fn normalize_chat_completions_url(input: &str) -> String {
    normalize_endpoint(input, CHAT_COMPLETIONS_PATH)
}

/// Normalize a base URL to the model listing endpoint, using the same rules.
pub fn normalize_models_url(input: &str) -> String {
    let trimmed = input.trim().trim_end_matches('/');
    let base = trimmed.strip_suffix(CHAT_COMPLETIONS_PATH).unwrap_or(trimmed);
    normalize_endpoint(base, MODELS_PATH)
}

fn normalize_endpoint(input: &str, suffix: &str) -> String {
    let base = if input.trim().is_empty() {
        DEFAULT_BASE_URL
    } else {
        input.trim()
    };

    let trimmed = base.trim_end_matches('/');
    if trimmed.ends_with(suffix) {
        return trimmed.to_string();
    }
    if trimmed.ends_with("/v1") {
        return format!("{trimmed}{suffix}");
    }
    format!("{trimmed}/v1{suffix}")
}
