use crate::messages::{convert_messages, ChatRequest};
use crate::state::AppState;
use crate::stream::DataStreamResponse;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use bytes::Bytes;
use conduit::{
    agent::{Agent, AgentEvent},
    errors::LoopError,
    providers::configs::resolve_model,
    tools::ToolRegistry,
};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{info, warn};

const INVALID_MESSAGES: &str = "Messages array is required";

fn bad_request() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": INVALID_MESSAGES })),
    )
        .into_response()
}

fn internal_error(details: &str) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "error": "Internal server error",
            "details": details,
        })),
    )
        .into_response()
}

async fn handler(State(state): State<AppState>, body: Bytes) -> Response {
    // Anything but a JSON object with a messages array is rejected before any outbound call
    let request: ChatRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            tracing::debug!(error = %e, "rejecting chat request");
            return bad_request();
        }
    };

    let model = resolve_model(&[
        request.body_model(),
        request.top_level_model(),
        state.default_model.as_deref(),
    ]);
    let mut conversation = convert_messages(&request.messages);

    // Create channel for streaming
    let (tx, mut rx) = mpsc::channel(100);
    let request_timeout = state.limits.request_timeout;

    tokio::spawn(async move {
        // Kept outside the timed section so sessions are closed even after a timeout
        let mut slot: Option<Agent> = None;

        // Tool discovery counts against the request ceiling along with the loop
        let chat = async {
            let registry = ToolRegistry::discover(&state.tool_servers).await;
            let agent = slot.insert(
                Agent::new(state.provider.clone(), registry, model.as_str())
                    .with_max_steps(state.limits.max_steps)
                    .with_tool_timeout(state.limits.tool_timeout),
            );
            info!(
                model = %model,
                messages = conversation.len(),
                tools = agent.registry().len(),
                "starting chat"
            );
            agent.run(&mut conversation, &tx).await
        };
        let result = timeout(request_timeout, chat).await;

        match result {
            Ok(Ok(outcome)) => info!(
                model = %model,
                steps = outcome.steps,
                model_calls = outcome.model_calls,
                "chat finished"
            ),
            Ok(Err(LoopError::Disconnected)) => info!("client disconnected, chat abandoned"),
            Ok(Err(e)) => warn!(error = %e, "chat failed"),
            Err(_) => {
                let secs = request_timeout.as_secs_f64();
                warn!(timeout_secs = secs, "chat timed out");
                let _ = tx
                    .send(AgentEvent::Error {
                        message: format!("Request timed out after {}s", secs),
                    })
                    .await;
            }
        }
        if let Some(agent) = slot {
            agent.registry().close().await;
        }
    });

    // Until the first event arrives nothing has been streamed, so failures can still
    // be reported with a status code
    match rx.recv().await {
        Some(AgentEvent::Error { message }) => internal_error(&message),
        Some(first) => DataStreamResponse::new(first, rx).into_response(),
        None => internal_error("The response ended before it started"),
    }
}

// Configure routes for this module
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/api/chat", post(handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{body_text, sse_body, test_state};
    use axum::{body::Body, http::Request};
    use conduit::providers::configs::FALLBACK_MODEL;
    use conduit::tools::ToolServerDescriptor;
    use serde_json::Value;
    use std::time::{Duration, Instant};
    use stub_tool_server::StubKind;
    use tower::ServiceExt;
    use wiremock::matchers::{body_partial_json, body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn chat_request(body: Value) -> Request<Body> {
        Request::builder()
            .uri("/api/chat")
            .method("POST")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn frame_codes(body: &str) -> Vec<&str> {
        body.lines().map(|line| &line[..1]).collect()
    }

    fn user_says(text: &str) -> Value {
        json!({"messages": [{"role": "user", "content": text}]})
    }

    /// A tool server that handshakes and lists one tool, but answers `tools/call` slowly
    async fn slow_calling_tool_server(delay: Duration) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "initialize"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0", "id": 1, "result": {"protocolVersion": "2024-11-05"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "notifications/initialized"})))
            .respond_with(ResponseTemplate::new(202))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "tools/list"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0", "id": 2,
                "result": {"tools": [{"name": "calculate", "inputSchema": {"type": "object"}}]}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "tools/call"})))
            .respond_with(ResponseTemplate::new(200).set_delay(delay))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn test_missing_messages_rejected() {
        let backend = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&backend)
            .await;
        let app = routes(test_state(&backend.uri(), vec![]));

        for body in [json!({}), json!({"messages": "hi"}), json!({"messages": [1, 2]})] {
            let response = app.clone().oneshot(chat_request(body)).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
            assert_eq!(body, json!({"error": "Messages array is required"}));
        }

        let request = Request::builder()
            .uri("/api/chat")
            .method("POST")
            .body(Body::from("not json"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_backend_unreachable() {
        // Bind and drop a listener to get a port nothing listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let app = routes(test_state(&url, vec![]));
        let response = app
            .oneshot(chat_request(json!({
                "messages": [{"role": "user", "content": "hello"}]
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["error"], "Internal server error");
        assert!(body["details"].as_str().unwrap().contains("Backend request failed"));
    }

    #[tokio::test]
    async fn test_plain_text_without_tools() {
        let backend = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                sse_body(&[
                    json!({"choices": [{"delta": {"content": "Hello"}}]}),
                    json!({"choices": [{"delta": {"content": " there"}, "finish_reason": "stop"}]}),
                ]),
                "text/event-stream",
            ))
            .expect(1)
            .mount(&backend)
            .await;

        let app = routes(test_state(&backend.uri(), vec![]));
        let response = app
            .oneshot(chat_request(json!({
                "messages": [{"role": "user", "parts": [{"type": "text", "text": "hi"}]}],
                "model": "top-level-model"
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-vercel-ai-data-stream"], "v1");
        let body = body_text(response).await;
        assert_eq!(frame_codes(&body), vec!["f", "0", "0", "e", "d"]);
        assert!(body.contains("0:\"Hello\"\n0:\" there\"\n"));

        let received = backend.received_requests().await.unwrap();
        let payload: Value = serde_json::from_slice(&received[0].body).unwrap();
        assert_eq!(payload["model"], "top-level-model");
        assert!(payload.get("tools").is_none());
    }

    #[tokio::test]
    async fn test_tool_round_trip() {
        let calculator = stub_tool_server::spawn(StubKind::Calculator);
        let backend = MockServer::start().await;

        // Once the tool result is in the conversation the model answers in text
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_string_contains("\"role\":\"tool\""))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                sse_body(&[json!({"choices": [{
                    "delta": {"content": "The result is 3."}, "finish_reason": "stop"}]})]),
                "text/event-stream",
            ))
            .with_priority(1)
            .mount(&backend)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                sse_body(&[
                    json!({"choices": [{"delta": {"tool_calls": [{"index": 0, "id": "call_1",
                        "type": "function",
                        "function": {"name": "calculate", "arguments": ""}}]}}]}),
                    json!({"choices": [{"delta": {"tool_calls": [{"index": 0,
                        "function": {"arguments": "{\"expression\":\"1+2\"}"}}]},
                        "finish_reason": "tool_calls"}]}),
                ]),
                "text/event-stream",
            ))
            .with_priority(2)
            .mount(&backend)
            .await;

        let state = test_state(
            &backend.uri(),
            vec![ToolServerDescriptor::new(stub_tool_server::endpoint(calculator))],
        );
        let response = routes(state)
            .oneshot(chat_request(json!({
                "messages": [{"role": "user", "content": "what is 1+2"}],
                "body": {"model": "override-model"}
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_text(response).await;
        let codes = frame_codes(&body);
        let position = |code: &str| codes.iter().position(|c| *c == code).unwrap();
        assert!(position("b") < position("9"));
        assert!(position("9") < position("a"));
        assert!(position("a") < position("0"));
        assert_eq!(codes.last(), Some(&"d"));
        assert_eq!(codes.iter().filter(|c| **c == "d" || **c == "3").count(), 1);
        assert!(body.contains("The result is 3."));

        let result_line = body.lines().find(|line| line.starts_with("a:")).unwrap();
        let result: Value = serde_json::from_str(&result_line[2..]).unwrap();
        assert_eq!(result["toolCallId"], "call_1");
        assert_eq!(result["result"]["content"][0]["text"], "3");

        let received = backend.received_requests().await.unwrap();
        assert_eq!(received.len(), 2);
        let first: Value = serde_json::from_slice(&received[0].body).unwrap();
        assert_eq!(first["model"], "override-model");
        assert_eq!(first["tools"][0]["function"]["name"], "calculate");
    }

    #[tokio::test]
    async fn test_malformed_optional_fields_ignored() {
        let backend = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                sse_body(&[json!({"choices": [{
                    "delta": {"content": "ok"}, "finish_reason": "stop"}]})]),
                "text/event-stream",
            ))
            .expect(1)
            .mount(&backend)
            .await;

        let app = routes(test_state(&backend.uri(), vec![]));
        let response = app
            .oneshot(chat_request(json!({
                "messages": [{"role": "user", "content": "hello"}],
                "body": "extra",
                "model": 42
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(frame_codes(&body_text(response).await).last(), Some(&"d"));
        let received = backend.received_requests().await.unwrap();
        let payload: Value = serde_json::from_slice(&received[0].body).unwrap();
        assert_eq!(payload["model"], FALLBACK_MODEL);
    }

    #[tokio::test]
    async fn test_backend_error_mid_stream() {
        let backend = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "data: {\"choices\": [{\"delta\": {\"content\": \"Hel\"}}]}\n\n\
                 data: {\"error\": {\"message\": \"upstream reset\"}}\n\n",
                "text/event-stream",
            ))
            .mount(&backend)
            .await;

        let response = routes(test_state(&backend.uri(), vec![]))
            .oneshot(chat_request(user_says("hello")))
            .await
            .unwrap();

        // Text already went out, so the failure arrives in-band
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_text(response).await;
        assert_eq!(frame_codes(&body), vec!["f", "0", "3"]);
        assert!(body.starts_with("f:"));
        assert!(body.contains("0:\"Hel\"\n"));
        assert!(body.ends_with("3:\"Backend API error: upstream reset\"\n"));
    }

    #[tokio::test]
    async fn test_slow_backend_times_out_before_streaming() {
        let backend = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(sse_body(&[]), "text/event-stream")
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&backend)
            .await;

        let mut state = test_state(&backend.uri(), vec![]);
        state.limits.request_timeout = Duration::from_secs(1);
        let started = Instant::now();
        let response = routes(state).oneshot(chat_request(user_says("hello"))).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["error"], "Internal server error");
        assert_eq!(body["details"], "Request timed out after 1s");
    }

    #[tokio::test]
    async fn test_slow_tool_discovery_counts_against_request_timeout() {
        let tools = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&tools)
            .await;
        let backend = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&backend)
            .await;

        let mut state = test_state(&backend.uri(), vec![ToolServerDescriptor::new(tools.uri())]);
        state.limits.request_timeout = Duration::from_secs(1);
        let started = Instant::now();
        let response = routes(state).oneshot(chat_request(user_says("hello"))).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["details"], "Request timed out after 1s");
    }

    #[tokio::test]
    async fn test_timeout_after_streaming_ends_with_error_frame() {
        let tools = slow_calling_tool_server(Duration::from_secs(5)).await;
        let backend = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                sse_body(&[json!({"choices": [{
                    "delta": {"tool_calls": [{"index": 0, "id": "call_1", "type": "function",
                        "function": {"name": "calculate", "arguments": "{}"}}]},
                    "finish_reason": "tool_calls"}]})]),
                "text/event-stream",
            ))
            .expect(1)
            .mount(&backend)
            .await;

        let mut state = test_state(&backend.uri(), vec![ToolServerDescriptor::new(tools.uri())]);
        state.limits.request_timeout = Duration::from_secs(1);
        let started = Instant::now();
        let response = routes(state).oneshot(chat_request(user_says("hello"))).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_text(response).await;
        assert!(started.elapsed() < Duration::from_secs(3));
        let codes = frame_codes(&body);
        assert_eq!(codes.first(), Some(&"f"));
        assert!(codes.contains(&"9"));
        assert!(!codes.contains(&"d"));
        assert_eq!(codes.iter().filter(|c| **c == "3").count(), 1);
        assert!(body.ends_with("3:\"Request timed out after 1s\"\n"));
    }
}
