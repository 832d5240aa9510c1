// tests/api_test.rs

mod common;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

use common::{tool_reply, Harness, ScriptedModel};
use edgechat::rate_limit::RateLimiter;
use edgechat::server::create_router;

async fn app(model: ScriptedModel) -> Router {
    let h = Harness::new(model, 10).await;
    create_router(h.app_state(None))
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn empty_request(method: &str, uri: &str) -> Request<Body> {
    Request::builder().method(method).uri(uri).body(Body::empty()).unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

#[tokio::test]
async fn test_health() {
    let app = app(ScriptedModel::replying("ok")).await;
    let (status, body) = send(&app, empty_request("GET", "/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["model"], "scripted");
}

#[tokio::test]
async fn test_add_and_list_messages() {
    let app = app(ScriptedModel::replying("ok")).await;

    let (status, created) = send(
        &app,
        json_request("POST", "/sessions/alice/messages", json!({"role": "user", "content": "hello"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(created["id"].as_str().is_some());
    assert_eq!(created["role"], "user");

    send(
        &app,
        json_request(
            "POST",
            "/sessions/alice/messages",
            json!({"role": "assistant", "content": "hi", "metadata": {"processingTimeMs": 12}}),
        ),
    )
    .await;

    let (status, messages) = send(&app, empty_request("GET", "/sessions/alice/messages")).await;
    assert_eq!(status, StatusCode::OK);
    let messages = messages.as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["content"], "hello");
    assert_eq!(messages[1]["metadata"]["processingTimeMs"], 12);

    let (_, filtered) = send(&app, empty_request("GET", "/sessions/alice/messages?role=assistant")).await;
    assert_eq!(filtered.as_array().unwrap().len(), 1);

    let (_, limited) = send(&app, empty_request("GET", "/sessions/alice/messages?limit=1")).await;
    assert_eq!(limited[0]["content"], "hi");
}

#[tokio::test]
async fn test_validation_envelope() {
    let app = app(ScriptedModel::replying("ok")).await;

    let (status, body) = send(
        &app,
        json_request("POST", "/sessions/alice/messages", json!({"role": "user", "content": ""})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], true);
    assert_eq!(body["status"], 400);
    assert_eq!(body["error_code"], "VALIDATION_ERROR");

    let (status, body) = send(
        &app,
        json_request("POST", "/sessions/alice/messages", json!({"role": "robot", "content": "x"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_code"], "VALIDATION_ERROR");

    let (status, body) = send(&app, empty_request("GET", "/sessions/alice/messages?limit=lots")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_code"], "VALIDATION_ERROR");

    let (status, _) = send(&app, empty_request("GET", "/sessions/bad$id/messages")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Nothing was stored by the rejected writes
    let (_, session) = send(&app, empty_request("GET", "/sessions/alice")).await;
    assert_eq!(session["messageCount"], 0);
}

#[tokio::test]
async fn test_context_merge_over_http() {
    let app = app(ScriptedModel::replying("ok")).await;

    let (status, body) = send(
        &app,
        json_request(
            "PUT",
            "/sessions/alice/context",
            json!({"projectName": "edge-api", "errorLogs": ["a"], "cloudflareServices": ["kv"]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["projectName"], "edge-api");

    let (_, body) = send(
        &app,
        json_request(
            "PUT",
            "/sessions/alice/context",
            json!({"errorLogs": ["b"], "cloudflareServices": ["kv", "d1"]}),
        ),
    )
    .await;
    assert_eq!(body["data"]["errorLogs"], json!(["a", "b"]));
    assert_eq!(body["data"]["cloudflareServices"], json!(["kv", "d1"]));

    let (status, context) = send(&app, empty_request("GET", "/sessions/alice/context")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(context["projectName"], "edge-api");
    assert!(context["lastUpdated"].as_i64().is_some());

    let (status, _) = send(
        &app,
        json_request("PUT", "/sessions/alice/context", json!({"favouriteColour": "orange"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        json_request(
            "PUT",
            "/sessions/alice/context",
            json!({"errorLogs": vec!["line"; 101]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_clear_session_resets_everything() {
    let app = app(ScriptedModel::replying("ok")).await;

    send(
        &app,
        json_request("POST", "/sessions/alice/messages", json!({"role": "user", "content": "hello"})),
    )
    .await;
    send(
        &app,
        json_request("PUT", "/sessions/alice/context", json!({"projectName": "edge-api"})),
    )
    .await;
    let (_, before) = send(&app, empty_request("GET", "/sessions/alice")).await;
    assert_eq!(before["messageCount"], 1);
    assert_eq!(before["status"], "active");

    let (status, body) = send(&app, empty_request("DELETE", "/sessions/alice")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let (_, after) = send(&app, empty_request("GET", "/sessions/alice")).await;
    assert_eq!(after["messageCount"], 0);
    assert_eq!(after["status"], "created");
    assert_ne!(after["sessionId"], before["sessionId"]);

    let (_, context) = send(&app, empty_request("GET", "/sessions/alice/context")).await;
    assert_eq!(context, json!({}));
}

#[tokio::test]
async fn test_delete_message_and_state() {
    let app = app(ScriptedModel::replying("ok")).await;

    let (_, first) = send(
        &app,
        json_request("POST", "/sessions/alice/messages", json!({"role": "user", "content": "one"})),
    )
    .await;
    send(
        &app,
        json_request("POST", "/sessions/alice/messages", json!({"role": "user", "content": "two"})),
    )
    .await;

    let uri = format!("/sessions/alice/messages/{}", first["id"].as_str().unwrap());
    let (_, deleted) = send(&app, empty_request("DELETE", &uri)).await;
    assert_eq!(deleted["success"], true);
    let (_, again) = send(&app, empty_request("DELETE", &uri)).await;
    assert_eq!(again["success"], false);

    let (status, state) = send(&app, empty_request("GET", "/sessions/alice/state")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(state["session"]["messageCount"], 1);
    assert_eq!(state["messages"][0]["content"], "two");
    assert_eq!(state["projectContext"], json!({}));
}

#[tokio::test]
async fn test_deactivate() {
    let app = app(ScriptedModel::replying("ok")).await;
    send(
        &app,
        json_request("POST", "/sessions/alice/messages", json!({"role": "user", "content": "one"})),
    )
    .await;

    let (status, info) = send(&app, empty_request("POST", "/sessions/alice/deactivate")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(info["status"], "inactive");
    assert_eq!(info["isActive"], false);

    let (_, info) = send(&app, empty_request("GET", "/sessions/alice")).await;
    assert_eq!(info["status"], "inactive");
}

#[tokio::test]
async fn test_turn_endpoint() {
    let app = app(ScriptedModel::replying("Hello from the edge")).await;

    let (status, body) = send(&app, json_request("POST", "/sessions/alice/turn", json!({"message": "hello"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "finished");
    assert_eq!(body["message"]["content"], "Hello from the edge");
    assert_eq!(body["steps"], 1);

    let (_, session) = send(&app, empty_request("GET", "/sessions/alice")).await;
    assert_eq!(session["messageCount"], 2);
}

#[tokio::test]
async fn test_turn_endpoint_confirmation_conflict() {
    let model = ScriptedModel::replying("Deployed.").then(tool_reply("c1", "deploy", json!({})));
    let app = app(model).await;

    let (status, body) = send(&app, json_request("POST", "/sessions/alice/turn", json!({"message": "ship it"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "awaiting_confirmation");
    assert_eq!(body["pending"][0]["callId"], "c1");
    assert_eq!(body["pending"][0]["toolName"], "deploy");

    let (status, body) = send(&app, json_request("POST", "/sessions/alice/turn", json!({}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error_code"], "CONFIRMATION_REQUIRED");
    assert_eq!(body["callId"], "c1");

    let (status, body) = send(
        &app,
        json_request(
            "POST",
            "/sessions/alice/turn",
            json!({"confirmations": [{"callId": "c1", "approved": true}]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "finished");
    assert_eq!(body["message"]["content"], "Deployed.");
}

#[tokio::test]
async fn test_add_message_blocked_while_confirmation_pending() {
    let model = ScriptedModel::replying("Deployed.").then(tool_reply("c1", "deploy", json!({})));
    let h = Harness::new(model, 10).await;
    let app = create_router(h.app_state(None));

    let (_, body) = send(&app, json_request("POST", "/sessions/alice/turn", json!({"message": "ship it"}))).await;
    assert_eq!(body["status"], "awaiting_confirmation");

    let (status, body) = send(
        &app,
        json_request(
            "POST",
            "/sessions/alice/messages",
            json!({"role": "user", "content": "actually, something else"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error_code"], "CONFIRMATION_REQUIRED");
    assert_eq!(body["callId"], "c1");

    // The gated call is still what the next turn waits on
    let (status, _) = send(&app, json_request("POST", "/sessions/alice/turn", json!({}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(h.model.calls(), 1);
    assert_eq!(h.deploy_runs.load(std::sync::atomic::Ordering::SeqCst), 0);

    let (_, messages) = send(&app, empty_request("GET", "/sessions/alice/messages")).await;
    assert_eq!(messages.as_array().unwrap().len(), 2);

    let (status, body) = send(
        &app,
        json_request(
            "POST",
            "/sessions/alice/turn",
            json!({"confirmations": [{"callId": "c1", "approved": true}]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "finished");

    // Resolved, so plain messages are accepted again
    let (status, _) = send(
        &app,
        json_request("POST", "/sessions/alice/messages", json!({"role": "user", "content": "thanks"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_chat_streams_sse_events() {
    let app = app(ScriptedModel::replying("Streaming hello")).await;

    let response = app
        .clone()
        .oneshot(json_request("POST", "/sessions/alice/chat", json!({"message": "hello"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    let delta = text.find(r#""type":"text_delta""#).expect("text delta frame");
    let done = text.find(r#""type":"done""#).expect("done frame");
    assert!(delta < done);
    assert!(text.contains("Streaming hello"));
}

#[tokio::test]
async fn test_chat_stream_reports_errors_in_band() {
    let app = app(ScriptedModel::replying("unused")).await;

    // No user message to answer: the turn fails after the stream opened
    let response = app
        .clone()
        .oneshot(json_request("POST", "/sessions/alice/chat", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains(r#""type":"error""#));
    assert!(text.contains("VALIDATION_ERROR"));
}

#[tokio::test]
async fn test_rate_limit_rejects_with_headers() {
    let h = Harness::new(ScriptedModel::replying("ok"), 10).await;
    let app = create_router(h.app_state(Some(Arc::new(RateLimiter::new(2, 60_000)))));

    let request = |client: &str| {
        Request::builder()
            .uri("/sessions/alice")
            .header("x-client-id", client)
            .body(Body::empty())
            .unwrap()
    };

    for expected_remaining in ["1", "0"] {
        let response = app.clone().oneshot(request("tester")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-limit"], "2");
        assert_eq!(response.headers()["x-ratelimit-remaining"], expected_remaining);
    }

    let response = app.clone().oneshot(request("tester")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = response.headers()[header::RETRY_AFTER]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!((1..=60).contains(&retry_after));
    assert!(response.headers().contains_key("x-ratelimit-reset"));
    let body: Value = serde_json::from_slice(&to_bytes(response.into_body(), usize::MAX).await.unwrap()).unwrap();
    assert_eq!(body["error_code"], "RATE_LIMIT_EXCEEDED");
    assert_eq!(body["status"], 429);

    // Other clients and the health probe are unaffected
    let response = app.clone().oneshot(request("someone-else")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let response = app.clone().oneshot(empty_request("GET", "/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
