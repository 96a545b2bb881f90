//! HTTP-level tests for ResilientClient against a mock completions server.

use std::time::Duration;

use parley_rs::api::{ResilientClient, RetryConfig};
use parley_rs::config::ClientConfig;
use parley_rs::{ChatRequest, ErrorKind, Hyperparameters, Message};
use reqwest::Method;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const KEY: &str = "sk-test";

fn completion_body(text: &str) -> serde_json::Value {
    serde_json::json!({
        "id": "chatcmpl-test",
        "object": "chat.completion",
        "model": "gpt-4",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": text},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 12, "completion_tokens": 4, "total_tokens": 16}
    })
}

/// Client with the default five attempts but millisecond backoff.
fn client(server: &MockServer) -> ResilientClient {
    client_with(server, RetryConfig::default())
}

fn client_with(server: &MockServer, retry: RetryConfig) -> ResilientClient {
    let config = ClientConfig::new(KEY)
        .with_base_url(server.uri())
        .with_retry(retry.with_base_delay(Duration::from_millis(5)));
    ResilientClient::from_config(config).unwrap()
}

fn request() -> ChatRequest {
    ChatRequest::new("gpt-4", vec![Message::system("Be brief."), Message::user("Hello")])
}

async fn mount_failures(server: &MockServer, status: u16, times: u64) {
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(status).set_body_string("upstream unhappy"))
        .up_to_n_times(times)
        .mount(server)
        .await;
}

async fn mount_success(server: &MockServer, text: &str) {
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body(text)))
        .mount(server)
        .await;
}

async fn request_count(server: &MockServer) -> usize {
    server.received_requests().await.map_or(0, |r| r.len())
}

#[tokio::test]
async fn transient_failures_are_retried_until_success() {
    let server = MockServer::start().await;
    mount_failures(&server, 503, 3).await;
    mount_success(&server, "Hello!").await;

    let completion = client(&server).chat(&request()).await.unwrap();

    assert_eq!(completion.text(), "Hello!");
    assert_eq!(completion.prompt_tokens, 12);
    assert_eq!(completion.completion_tokens, 4);
    assert_eq!(request_count(&server).await, 4);
}

#[tokio::test]
async fn rate_limit_is_transient() {
    let server = MockServer::start().await;
    mount_failures(&server, 429, 1).await;
    mount_success(&server, "ok").await;

    client(&server).chat(&request()).await.unwrap();
    assert_eq!(request_count(&server).await, 2);
}

#[tokio::test]
async fn client_error_is_not_retried() {
    let server = MockServer::start().await;
    mount_failures(&server, 400, 10).await;

    let err = client(&server).chat(&request()).await.unwrap_err();

    assert_eq!(err.kind, ErrorKind::Permanent);
    assert_eq!(err.status, Some(400));
    assert_eq!(err.attempts, 1);
    assert_eq!(err.raw_body.as_deref(), Some("upstream unhappy"));
    assert_eq!(request_count(&server).await, 1);
}

#[tokio::test]
async fn exhaustion_surfaces_transient_error() {
    let server = MockServer::start().await;
    mount_failures(&server, 502, 100).await;

    let err = client_with(&server, RetryConfig::with_attempts(3))
        .chat(&request())
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::Transient);
    assert_eq!(err.attempts, 3);
    assert_eq!(err.status, Some(502));
    assert_eq!(request_count(&server).await, 3);
}

#[tokio::test]
async fn undecodable_body_is_a_decode_error_with_raw_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
        .mount(&server)
        .await;

    let err = client(&server).chat(&request()).await.unwrap_err();

    assert_eq!(err.kind, ErrorKind::Decode);
    assert_eq!(err.raw_body.as_deref(), Some("<html>oops</html>"));
    assert_eq!(request_count(&server).await, 1);
}

#[tokio::test]
async fn missing_usage_is_a_decode_error() {
    let server = MockServer::start().await;
    let mut body = completion_body("hi");
    body.as_object_mut().unwrap().remove("usage");
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(&server)
        .await;

    let err = client(&server).chat(&request()).await.unwrap_err();

    assert_eq!(err.kind, ErrorKind::Decode);
    assert!(err.raw_body.unwrap().contains("chatcmpl-test"));
    assert_eq!(request_count(&server).await, 1);
}

#[tokio::test]
async fn api_error_object_is_permanent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "error": {"message": "model overloaded", "type": "server_error"}
        })))
        .mount(&server)
        .await;

    let err = client(&server).chat(&request()).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Permanent);
    assert!(err.detail.contains("model overloaded"));
}

#[tokio::test]
async fn bearer_token_sent_on_every_attempt() {
    let server = MockServer::start().await;
    mount_failures(&server, 500, 2).await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("ok")))
        .expect(1)
        .mount(&server)
        .await;

    client(&server).chat(&request()).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 3);
    for req in &requests {
        assert_eq!(
            req.headers.get("authorization").unwrap().to_str().unwrap(),
            "Bearer sk-test"
        );
    }
}

#[tokio::test]
async fn timeout_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(completion_body("late"))
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let config = ClientConfig::new(KEY)
        .with_base_url(server.uri())
        .with_timeout(Duration::from_millis(100))
        .with_retry(RetryConfig::with_attempts(2).with_base_delay(Duration::from_millis(5)));
    let err = ResilientClient::from_config(config)
        .unwrap()
        .chat(&request())
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::Transient);
    assert_eq!(err.attempts, 2);
}

#[tokio::test]
async fn request_body_carries_messages_and_hyperparameters() {
    let server = MockServer::start().await;
    mount_success(&server, "ok").await;

    let request = request()
        .with_hyperparameters(Hyperparameters::default().with_temperature(0.5).with_max_tokens(64));
    client(&server).chat(&request).await.unwrap();

    let sent = &server.received_requests().await.unwrap()[0];
    let body: serde_json::Value = serde_json::from_slice(&sent.body).unwrap();
    assert_eq!(body["model"], "gpt-4");
    assert_eq!(body["messages"][0]["role"], "system");
    assert_eq!(body["messages"][1]["content"], "Hello");
    assert_eq!(body["temperature"], 0.5);
    assert_eq!(body["max_tokens"], 64);
    assert!(body.get("functions").is_none());
    assert!(body.get("top_p").is_none());
}

#[tokio::test]
async fn send_decodes_arbitrary_routes() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/models"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": [{"id": "gpt-4"}]})),
        )
        .mount(&server)
        .await;

    let models: serde_json::Value = client(&server)
        .send(Method::GET, "/models", None)
        .await
        .unwrap();
    assert_eq!(models["data"][0]["id"], "gpt-4");
}
