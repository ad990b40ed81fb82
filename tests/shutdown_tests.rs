//! Graceful shutdown: drain gate, in-flight completion, forced close.

use axum::http::{header, StatusCode};
use graphmcp::config::GatewayConfig;
use graphmcp::test_utils::test_helpers::{body_json, mcp_request, test_config, tool_call, tool_text};
use graphmcp::Gateway;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt; // for `oneshot`
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn slow_backend(delay: Duration) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/groups"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"groups": ["proj-a"]}))
                .set_delay(delay),
        )
        .mount(&server)
        .await;
    server
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_drain_rejects_new_requests_and_finishes_in_flight() {
    let backend = slow_backend(Duration::from_millis(400)).await;
    let config = GatewayConfig {
        shutdown_timeout: Duration::from_secs(5),
        ..test_config(&backend.uri())
    };
    let gateway = Arc::new(Gateway::from_config(config).unwrap());

    let in_flight = tokio::spawn(
        gateway
            .router()
            .oneshot(mcp_request(&tool_call(1, "list_groups", json!({})), None)),
    );
    wait_until(|| gateway.state().lifecycle.active_requests() == 1).await;

    let shutdown = {
        let gateway = Arc::clone(&gateway);
        tokio::spawn(async move { gateway.shutdown().await })
    };
    wait_until(|| gateway.state().lifecycle.is_draining()).await;

    let rejected = gateway
        .router()
        .oneshot(mcp_request(&json!({"jsonrpc": "2.0", "id": 2, "method": "ping"}), None))
        .await
        .unwrap();
    assert_eq!(rejected.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(rejected.headers().contains_key(header::RETRY_AFTER));
    let body = body_json(rejected).await;
    assert_eq!(body["error"]["code"], -32030);
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("temporarily unavailable"));

    let response = in_flight.await.unwrap().unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert!(tool_text(&body).contains("proj-a"));

    let report = shutdown.await.unwrap();
    assert!(!report.forced);
    assert_eq!(report.in_flight, 0);
    assert_eq!(report.closed_sessions, 1);
    assert_eq!(gateway.state().lifecycle.active_requests(), 0);
}

#[tokio::test]
async fn test_drain_waits_for_dispatch_after_client_disconnects() {
    let backend = slow_backend(Duration::from_millis(400)).await;
    let config = GatewayConfig {
        shutdown_timeout: Duration::from_secs(5),
        ..test_config(&backend.uri())
    };
    let gateway = Arc::new(Gateway::from_config(config).unwrap());

    let client = tokio::spawn(
        gateway
            .router()
            .oneshot(mcp_request(&tool_call(1, "list_groups", json!({})), None)),
    );
    for _ in 0..200 {
        if !backend.received_requests().await.unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Dropping the request future leaves the backend call running.
    client.abort();
    let _ = client.await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(gateway.state().lifecycle.active_requests(), 1);

    let started = std::time::Instant::now();
    let report = gateway.shutdown().await;
    assert!(!report.forced);
    assert_eq!(report.in_flight, 0);
    assert!(started.elapsed() >= Duration::from_millis(150));
    assert_eq!(gateway.state().lifecycle.active_requests(), 0);
    assert_eq!(backend.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_forced_shutdown_closes_sessions_with_requests_in_flight() {
    let backend = slow_backend(Duration::from_secs(5)).await;
    let config = GatewayConfig {
        backend_timeout: Duration::from_secs(10),
        shutdown_timeout: Duration::from_millis(200),
        ..test_config(&backend.uri())
    };
    let gateway = Arc::new(Gateway::from_config(config).unwrap());

    let in_flight = tokio::spawn(
        gateway
            .router()
            .oneshot(mcp_request(&tool_call(1, "list_groups", json!({})), None)),
    );
    wait_until(|| gateway.state().lifecycle.active_requests() == 1).await;

    let report = gateway.shutdown().await;
    assert!(report.forced);
    assert_eq!(report.in_flight, 1);

    let response = tokio::time::timeout(Duration::from_secs(2), in_flight)
        .await
        .expect("in-flight request aborted by session close")
        .unwrap()
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["id"], 1);
    assert_eq!(body["error"]["code"], -32032);

    assert_eq!(gateway.state().registry.len().await, 0);
}

#[tokio::test]
async fn test_serve_stops_on_signal() {
    let backend = MockServer::start().await;
    let gateway = Gateway::from_config(test_config(&backend.uri())).unwrap();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(gateway.serve(listener, async move {
        let _ = rx.await;
    }));

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{}/mcp", addr))
        .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert!(response.headers().contains_key("mcp-session-id"));

    tx.send(()).unwrap();
    let report = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("server stopped")
        .unwrap()
        .unwrap();
    assert!(!report.forced);
    assert_eq!(report.closed_sessions, 1);
}
