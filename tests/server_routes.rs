//! Route tests driving the axum router directly.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use chat_mux::cli::AppConfig;
use chat_mux::server::{build_app, AppState};
use std::sync::Arc;
use tower::ServiceExt;

fn config(base_url: &str, password: Option<&str>) -> AppConfig {
    let password = password
        .map(|p| format!("password = \"{}\"\n", p))
        .unwrap_or_default();
    let toml = format!(
        r#"
[server]
{password}
[[providers]]
id = "openai"
api_key = "sk-upstream-secret"
base_url = "{base_url}"

[[providers.models]]
id = "gpt-4o"
name = "GPT-4o"
capabilities = {{ functionCall = true, vision = true }}
"#
    );
    toml::from_str(&toml).unwrap()
}

fn app(config: AppConfig) -> axum::Router {
    build_app(Arc::new(AppState::from_config(config).unwrap()))
}

fn chat_request(body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/chat")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn health_reports_ok() {
    let response = app(AppConfig::default())
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(json, serde_json::json!({"status": "ok", "service": "chat-mux"}));
}

#[tokio::test]
async fn models_are_listed_without_keys() {
    let response = app(config("http://127.0.0.1:9", None))
        .oneshot(Request::builder().uri("/api/models").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_string(response).await;
    assert!(!body.contains("sk-upstream-secret"));

    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    let model = &json["providers"][0]["models"][0];
    assert_eq!(model["id"], "gpt-4o");
    assert_eq!(model["name"], "GPT-4o");
    assert_eq!(model["capabilities"]["functionCall"], true);
    assert_eq!(model["capabilities"]["tts"], false);
}

#[tokio::test]
async fn password_gate_accepts_either_header() {
    let app = app(config("http://127.0.0.1:9", Some("letmein")));

    let denied = app
        .clone()
        .oneshot(Request::builder().uri("/api/models").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

    let wrong = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/models")
                .header(header::AUTHORIZATION, "Bearer nope")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

    let bearer = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/models")
                .header(header::AUTHORIZATION, "Bearer letmein")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(bearer.status(), StatusCode::OK);

    let custom = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/models")
                .header("x-access-password", "letmein")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(custom.status(), StatusCode::OK);

    let health = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(health.status(), StatusCode::OK);
}

#[tokio::test]
async fn unknown_provider_is_rejected_before_any_upstream_call() {
    let mut server = mockito::Server::new_async().await;
    let upstream = server.mock("POST", mockito::Matcher::Any).expect(0).create_async().await;

    let response = app(config(&server.url(), None))
        .oneshot(chat_request(serde_json::json!({
            "providerId": "nope",
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "hi"}]
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(json["error"]["type"], "error");
    assert!(json["error"]["message"].as_str().unwrap().contains("nope"));
    upstream.assert_async().await;
}

#[tokio::test]
async fn streamed_chat_is_relayed_as_sse() {
    let mut server = mockito::Server::new_async().await;
    let _upstream = server
        .mock("POST", "/chat/completions")
        .match_header("authorization", "Bearer sk-upstream-secret")
        .with_header("content-type", "text/event-stream")
        .with_body(
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hi\"}}]}\n\n\
             data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\" there\"}}]}\n\n\
             data: [DONE]\n\n",
        )
        .create_async()
        .await;

    let response = app(config(&server.url(), None))
        .oneshot(chat_request(serde_json::json!({
            "providerId": "openai",
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "hi"}]
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "text/event-stream"
    );
    assert_eq!(
        body_string(response).await,
        "data: {\"type\":\"text\",\"content\":\"Hi\"}\n\n\
         data: {\"type\":\"text\",\"content\":\" there\"}\n\n\
         data: {\"type\":\"done\"}\n\n"
    );
}

#[tokio::test]
async fn streamed_tool_call_gets_a_result_frame() {
    let mut server = mockito::Server::new_async().await;
    let _upstream = server
        .mock("POST", "/chat/completions")
        .match_body(mockito::Matcher::Regex(r#""name":"current_time""#.to_string()))
        .with_header("content-type", "text/event-stream")
        .with_body(
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_9\",\"type\":\"function\",\"function\":{\"name\":\"current_time\",\"arguments\":\"{}\"}}]}}]}\n\n\
             data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"tool_calls\"}]}\n\n\
             data: [DONE]\n\n",
        )
        .create_async()
        .await;

    let response = app(config(&server.url(), None))
        .oneshot(chat_request(serde_json::json!({
            "providerId": "openai",
            "model": "gpt-4o",
            "tools": ["current_time"],
            "messages": [{"role": "user", "content": "what time is it?"}]
        })))
        .await
        .unwrap();

    let body = body_string(response).await;
    let frames: Vec<serde_json::Value> = body
        .split("\n\n")
        .filter_map(|frame| frame.strip_prefix("data: "))
        .map(|json| serde_json::from_str(json).unwrap())
        .collect();

    assert_eq!(frames.len(), 3);
    assert_eq!(frames[0]["type"], "tool_call");
    assert_eq!(frames[0]["toolCall"]["status"], "running");
    assert_eq!(frames[1]["type"], "tool_result");
    assert_eq!(frames[1]["toolId"], "call_9");
    assert_eq!(frames[1]["result"]["success"], true);
    assert!(frames[1]["result"]["data"]["utc"].is_string());
    assert_eq!(frames[2]["type"], "done");
}

#[tokio::test]
async fn non_stream_chat_returns_json() {
    let mut server = mockito::Server::new_async().await;
    let _upstream = server
        .mock("POST", "/chat/completions")
        .with_header("content-type", "application/json")
        .with_body(
            serde_json::json!({
                "choices": [{"index": 0, "message": {"role": "assistant", "content": "Hello!"}, "finish_reason": "stop"}]
            })
            .to_string(),
        )
        .create_async()
        .await;

    let response = app(config(&server.url(), None))
        .oneshot(chat_request(serde_json::json!({
            "providerId": "openai",
            "model": "gpt-4o",
            "stream": false,
            "messages": [{"role": "user", "content": "hi"}]
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(json["content"], "Hello!");
}

#[tokio::test]
async fn upstream_failure_in_non_stream_mode_is_bad_gateway() {
    let mut server = mockito::Server::new_async().await;
    let _upstream = server
        .mock("POST", "/chat/completions")
        .with_status(500)
        .with_body("boom")
        .create_async()
        .await;

    let response = app(config(&server.url(), None))
        .oneshot(chat_request(serde_json::json!({
            "providerId": "openai",
            "model": "gpt-4o",
            "stream": false,
            "messages": [{"role": "user", "content": "hi"}]
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}
