use chat_api::events::ChatStreamEvent;
use chat_api::{
    normalize_chat_completions_url, ChatApiClient, ChatApiConfig, ChatCompletionMessage,
    ChatCompletionRequest,
};
use serde_json::Value;

fn user_request(text: &str) -> ChatCompletionRequest {
    ChatCompletionRequest::new("gpt-4o-mini", vec![ChatCompletionMessage::new("user", text)])
}

#[test]
fn http_request_builds_chat_completions_endpoint() {
    let config = ChatApiConfig::new("http://localhost:11434/v1").with_api_key("sk-test");
    let client = ChatApiClient::new(config).expect("client");

    let http_request = client
        .build_request(&user_request("payload"))
        .expect("build request")
        .build()
        .expect("request");

    assert_eq!(
        http_request.url().as_str(),
        normalize_chat_completions_url("http://localhost:11434/v1")
    );
    assert_eq!(http_request.method(), "POST");
    assert_eq!(
        http_request
            .headers()
            .get("authorization")
            .and_then(|value| value.to_str().ok()),
        Some("Bearer sk-test")
    );
}

#[test]
fn http_request_omits_authorization_without_key() {
    let client = ChatApiClient::new(ChatApiConfig::new("http://localhost:8080")).expect("client");
    let http_request = client
        .build_request(&user_request("hi"))
        .expect("build request")
        .build()
        .expect("request");

    assert!(http_request.headers().get("authorization").is_none());
    assert_eq!(
        http_request
            .headers()
            .get("accept")
            .and_then(|value| value.to_str().ok()),
        Some("text/event-stream")
    );
}

#[test]
fn http_request_body_forces_streaming_and_default_temperature() {
    let client = ChatApiClient::new(ChatApiConfig::new("http://localhost:8080")).expect("client");
    let mut request = user_request("hi");
    request.stream = false;

    let http_request = client
        .build_request(&request)
        .expect("build request")
        .build()
        .expect("request");
    let body = http_request
        .body()
        .and_then(|body| body.as_bytes())
        .expect("json body");
    let body: Value = serde_json::from_slice(body).expect("body is json");

    assert_eq!(body["stream"], Value::Bool(true));
    assert_eq!(body["temperature"], serde_json::json!(0.2));
    assert_eq!(body["model"], "gpt-4o-mini");
    assert_eq!(body["messages"][0]["role"], "user");
    assert_eq!(body["messages"][0]["content"], "hi");
}

#[test]
fn explicit_user_agent_overrides_default() {
    let config = ChatApiConfig::new("http://localhost:8080").with_user_agent("halp/1.0");
    let client = ChatApiClient::new(config).expect("client");
    let headers = client.build_headers(None).expect("headers");

    assert_eq!(
        headers.get("user-agent").and_then(|value| value.to_str().ok()),
        Some("halp/1.0")
    );
}

#[test]
fn invalid_extra_header_is_rejected() {
    let config = ChatApiConfig::new("http://localhost:8080").insert_header("x-bad", "line\nbreak");
    let client = ChatApiClient::new(config).expect("client");

    assert!(client.build_headers(None).is_err());
}

#[test]
fn http_stream_event_variant_names_stable() {
    let delta = ChatStreamEvent::ContentDelta {
        delta: "hello".to_string(),
    };
    let delta_json = serde_json::to_value(&delta).expect("serialize content delta event");
    assert_eq!(delta_json["type"], "content_delta");
    assert_eq!(delta_json["delta"], "hello");

    let finished = ChatStreamEvent::Finished {
        reason: "stop".to_string(),
    };
    let finished_json = serde_json::to_value(&finished).expect("serialize finished event");
    assert_eq!(finished_json["type"], "finished");
    assert!(finished.is_termination());
    assert!(ChatStreamEvent::Done.is_termination());
}
