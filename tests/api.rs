use async_trait::async_trait;
use axum::{
    body::{ to_bytes, Body },
    http::{ header::{ CACHE_CONTROL, CONNECTION, CONTENT_TYPE }, Request, StatusCode },
    Router,
};
use chat_relay::agent::{ RelayAgent, RelayOptions };
use chat_relay::history::MemoryHistoryStore;
use chat_relay::llm::LlmError;
use chat_relay::llm::chat::{ ChatClient, DeltaStream };
use chat_relay::models::chat::{ ChatMessage, Role };
use chat_relay::server::api::build_router;
use futures::stream;
use serde_json::{ json, Value };
use std::sync::Arc;
use std::sync::atomic::{ AtomicUsize, Ordering };
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

/// Replays `script` for streamed turns; `Err` entries become provider errors.
/// Non-streamed turns answer "reply N", or fail when `fail_complete` is set.
struct StubClient {
    script: Vec<Result<&'static str, &'static str>>,
    fail_complete: bool,
    hang: bool,
    calls: AtomicUsize,
}

impl StubClient {
    fn streaming(script: Vec<Result<&'static str, &'static str>>) -> Self {
        Self { script, fail_complete: false, hang: false, calls: AtomicUsize::new(0) }
    }

    fn hanging() -> Self {
        Self { script: Vec::new(), fail_complete: false, hang: true, calls: AtomicUsize::new(0) }
    }

    fn failing() -> Self {
        Self { script: Vec::new(), fail_complete: true, hang: false, calls: AtomicUsize::new(0) }
    }
}

#[async_trait]
impl ChatClient for StubClient {
    async fn complete(&self, _messages: &[ChatMessage]) -> Result<String, LlmError> {
        if self.fail_complete {
            return Err(LlmError::Provider("provider down".into()));
        }
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("reply {}", n))
    }

    async fn stream_completion(
        &self,
        _messages: &[ChatMessage],
        _cancel: CancellationToken
    ) -> Result<DeltaStream, LlmError> {
        if self.hang {
            return Ok(Box::pin(stream::pending::<Result<String, LlmError>>()));
        }
        let items: Vec<Result<String, LlmError>> = self.script
            .iter()
            .map(|item| match item {
                Ok(text) => Ok(text.to_string()),
                Err(msg) => Err(LlmError::Provider(msg.to_string())),
            })
            .collect();
        Ok(Box::pin(stream::iter(items)))
    }

    fn get_model(&self) -> String {
        "stub".into()
    }

    fn get_base_url(&self) -> Option<String> {
        None
    }
}

fn create_test_app(client: StubClient) -> (Router, Arc<RelayAgent>) {
    let agent = Arc::new(RelayAgent::new(
        Arc::new(client),
        Arc::new(MemoryHistoryStore::new()),
        RelayOptions { system_prompt: Some("be kind".into()), stream_delay: Duration::ZERO }
    ));
    (build_router(Arc::clone(&agent)), agent)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn roles(messages: &[ChatMessage]) -> Vec<(Role, &str)> {
    messages.iter().map(|m| (m.role, m.content.as_str())).collect()
}

#[tokio::test]
async fn test_liveness_route() {
    let (app, _) = create_test_app(StubClient::streaming(vec![]));
    let response = app
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "Chat relay backend is running!");
}

#[tokio::test]
async fn test_chat_streams_event_frames() {
    let (app, agent) = create_test_app(StubClient::streaming(vec![Ok("Hel"), Ok("lo!")]));

    let response = app
        .oneshot(post_json("/api/chat", json!({ "userId": "a", "message": "hi" })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(headers[CONTENT_TYPE], "text/event-stream");
    assert_eq!(headers[CACHE_CONTROL], "no-cache");
    assert_eq!(headers[CONNECTION], "keep-alive");

    let body = body_string(response).await;
    assert_eq!(body, "data: {\"response\":\"Hel\"}\n\ndata: {\"response\":\"lo!\"}\n\n");

    let history = agent.conversation("a").await;
    assert_eq!(roles(&history.messages), [(Role::User, "hi"), (Role::Assistant, "Hello!")]);
}

#[tokio::test]
async fn test_chat_without_streaming_returns_json() {
    let (app, agent) = create_test_app(StubClient::streaming(vec![]));

    let response = app
        .oneshot(post_json("/api/chat", json!({ "message": "hi", "stream": false })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(body, json!({ "response": "reply 1" }));

    let history = agent.conversation("defaultUser").await;
    assert_eq!(roles(&history.messages), [(Role::User, "hi"), (Role::Assistant, "reply 1")]);
}

#[tokio::test]
async fn test_chat_without_streaming_reports_failure() {
    let (app, agent) = create_test_app(StubClient::failing());

    let response = app
        .oneshot(post_json("/api/chat", json!({ "userId": "a", "message": "hi", "stream": false })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(body, json!({ "error": "Internal server error" }));
    assert_eq!(agent.conversation("a").await.messages.len(), 1);
}

#[tokio::test]
async fn test_stream_failure_before_output_is_500() {
    let (app, agent) = create_test_app(StubClient::streaming(vec![Err("boom")]));

    let response = app
        .oneshot(post_json("/api/chat", json!({ "userId": "a", "message": "hi" })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(body["error"], "Internal server error");
    assert!(!agent.is_pending("a"));
}

#[tokio::test]
async fn test_stream_failure_after_output_sends_error_event() {
    let (app, agent) = create_test_app(StubClient::streaming(vec![Ok("Hel"), Err("boom")]));

    let response = app
        .oneshot(post_json("/api/chat", json!({ "userId": "a", "message": "hi" })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_string(response).await;
    assert!(body.starts_with("data: {\"response\":\"Hel\"}\n\n"));
    assert!(body.contains("event: error"));
    assert!(body.contains("{\"error\":\"Internal server error\"}"));

    let history = agent.conversation("a").await;
    assert_eq!(roles(&history.messages), [(Role::User, "hi")]);
}

#[tokio::test]
async fn test_stop_without_pending_request() {
    let (app, _) = create_test_app(StubClient::streaming(vec![]));

    let response = app
        .oneshot(post_json("/api/stop", json!({ "userId": "nobody" })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(body, json!({ "error": "No active streaming to stop" }));
}

#[tokio::test]
async fn test_stop_before_first_fragment_aborts_with_499() {
    let (app, agent) = create_test_app(StubClient::hanging());

    let chat = tokio::spawn(
        app.clone().oneshot(post_json("/api/chat", json!({ "userId": "a", "message": "hi" })))
    );

    while agent.conversation("a").await.messages.is_empty() {
        tokio::task::yield_now().await;
    }

    let stop = app
        .oneshot(post_json("/api/stop", json!({ "userId": "a" })))
        .await
        .unwrap();
    assert_eq!(stop.status(), StatusCode::OK);
    let body: Value = serde_json::from_str(&body_string(stop).await).unwrap();
    assert_eq!(body, json!({ "message": "Streaming stopped successfully" }));

    let response = chat.await.unwrap().unwrap();
    assert_eq!(response.status().as_u16(), 499);
    assert!(body_string(response).await.is_empty());

    let history = agent.conversation("a").await;
    assert_eq!(roles(&history.messages), [(Role::User, "hi")]);
    assert!(!agent.is_pending("a"));
}

#[tokio::test]
async fn test_malformed_body_is_rejected() {
    let (app, agent) = create_test_app(StubClient::streaming(vec![]));

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/chat")
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from("{not json"))
                .unwrap()
        )
        .await
        .unwrap();

    assert!(response.status().is_client_error());
    assert!(agent.conversation("defaultUser").await.messages.is_empty());
}
