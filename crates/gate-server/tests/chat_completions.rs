// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! End-to-end coverage of `POST /v1/chat/completions` against a mocked
//! upstream (spec §8 scenario (a): a plain non-streaming turn, no tool
//! calls). Exercises client auth, account selection, upstream payload
//! translation, event-stream parsing, and usage accounting together,
//! the way `wiremock`-backed tests in the teacher's own HTTP layer do.

use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use gate_config::GatewayConfig;
use gate_server::AppState;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn build_state(upstream: &MockServer) -> (AppState, String) {
    let mut creds_file = tempfile::NamedTempFile::new().unwrap();
    write!(
        creds_file,
        r#"{{"refreshToken":"rt","accessToken":"at","expiresAt":"{}"}}"#,
        (Utc::now() + chrono::Duration::hours(1)).to_rfc3339()
    )
    .unwrap();

    let mut config = GatewayConfig::default();
    config.credentials.creds_file = Some(creds_file.path().to_path_buf());
    config.upstream.chat_url_template = format!("{}/generateAssistantResponse", upstream.uri());
    config.retry.max_retries = 1;
    config.retry.base_retry_delay_ms = 10;

    // Read once during account seeding inside `AppState::new`; safe to drop after.
    let state = AppState::new(config).await.unwrap();
    let (plaintext, _record) = state.api_keys.create_key("test", None, None).await.unwrap();

    (state, plaintext)
}

fn authed_request(body: serde_json::Value, api_key: &str) -> Request<Body> {
    let mut req = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {api_key}"))
        .body(Body::from(body.to_string()))
        .unwrap();
    req.extensions_mut().insert(ConnectInfo(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)));
    req
}

#[tokio::test]
async fn non_streaming_completion_round_trips_through_the_router() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/generateAssistantResponse"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(br#"{"content":"Hello"}{"content":" there"}"#.to_vec()))
        .mount(&upstream)
        .await;

    let (state, api_key) = build_state(&upstream).await;
    let app = gate_server::router(state.clone());

    let body = serde_json::json!({
        "model": "claude-sonnet-4.5",
        "messages": [{"role": "user", "content": "hi"}],
        "stream": false,
    });

    let response = app.oneshot(authed_request(body, &api_key)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let decoded: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(decoded["choices"][0]["message"]["content"], "Hello there");
    assert_eq!(decoded["choices"][0]["finish_reason"], "stop");

    let agg = state.usage.aggregate(None).await.unwrap();
    assert_eq!(agg.total_requests, 1);
    assert_eq!(agg.success_count, 1);
}

#[tokio::test]
async fn missing_api_key_is_rejected_before_reaching_upstream() {
    let upstream = MockServer::start().await;
    let (state, _api_key) = build_state(&upstream).await;
    let app = gate_server::router(state);

    let mut req = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::json!({"model": "claude-sonnet-4.5", "messages": []}).to_string(),
        ))
        .unwrap();
    req.extensions_mut().insert(ConnectInfo(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)));

    let response = app.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn upstream_5xx_is_reported_as_a_gateway_error() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/generateAssistantResponse"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&upstream)
        .await;

    let (state, api_key) = build_state(&upstream).await;
    let app = gate_server::router(state.clone());

    let body = serde_json::json!({
        "model": "claude-sonnet-4.5",
        "messages": [{"role": "user", "content": "hi"}],
        "stream": false,
    });

    let response = app.oneshot(authed_request(body, &api_key)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    let agg = state.usage.aggregate(None).await.unwrap();
    assert_eq!(agg.fail_count, 1);
}
