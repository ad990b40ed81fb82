use graphmcp::services::{BackendError, BackendRequest, HttpBackend, KnowledgeBackend};
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn backend(server: &MockServer, token: Option<&str>, max_retries: u32) -> HttpBackend {
    HttpBackend::new(
        &server.uri(),
        token.map(str::to_string),
        Duration::from_millis(500),
        max_retries,
        Duration::from_millis(10),
    )
    .expect("valid backend")
}

#[tokio::test]
async fn test_retries_server_errors_then_succeeds() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/groups"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/groups"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"groups": ["proj-a"]})))
        .expect(1)
        .mount(&server)
        .await;

    let value = backend(&server, None, 2)
        .send(BackendRequest::get(["groups"]))
        .await
        .expect("third attempt succeeds");
    assert_eq!(value, json!({"groups": ["proj-a"]}));
}

#[tokio::test]
async fn test_gives_up_after_max_retries() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/groups"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({"detail": "db down"})))
        .expect(3)
        .mount(&server)
        .await;

    let err = backend(&server, None, 2)
        .send(BackendRequest::get(["groups"]))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        BackendError::Server {
            status: 500,
            message: "db down".to_string()
        }
    );
}

#[tokio::test]
async fn test_client_errors_are_not_retried() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/episodes/missing"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({"detail": "Group not found"})))
        .expect(1)
        .mount(&server)
        .await;

    let err = backend(&server, None, 3)
        .send(BackendRequest::get(["episodes", "missing"]))
        .await
        .unwrap_err();
    assert!(!err.is_retriable());
    assert_eq!(err.status(), Some(404));
    assert!(err.to_string().contains("Group not found"));
}

#[tokio::test]
async fn test_request_credential_takes_precedence() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/groups"))
        .and(header("authorization", "Bearer client-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/groups"))
        .and(header("authorization", "Bearer static-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;

    let backend = backend(&server, Some("static-token"), 0);
    backend
        .send(BackendRequest::get(["groups"]).with_credential(Some("client-token".to_string())))
        .await
        .expect("client token accepted");
    backend
        .send(BackendRequest::get(["groups"]))
        .await
        .expect("static token accepted");
}

#[tokio::test]
async fn test_sends_query_and_body() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/entities/proj-a"))
        .and(query_param("limit", "25"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"entities": []})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/search"))
        .and(body_json(json!({"query": "rust", "max_facts": 5})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"facts": []})))
        .expect(1)
        .mount(&server)
        .await;

    let backend = backend(&server, None, 0);
    backend
        .send(BackendRequest::get(["entities", "proj-a"]).with_query("limit", 25))
        .await
        .expect("entities");
    backend
        .send(BackendRequest::post(["search"], json!({"query": "rust", "max_facts": 5})))
        .await
        .expect("search");
}

#[tokio::test]
async fn test_empty_success_body_is_null() {
    let server = MockServer::start().await;

    Mock::given(method("DELETE"))
        .and(path("/episode/e-1"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let value = backend(&server, None, 0)
        .send(BackendRequest::delete(["episode", "e-1"]))
        .await
        .expect("delete");
    assert!(value.is_null());
}

#[tokio::test]
async fn test_slow_backend_times_out() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/groups"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([]))
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let err = backend(&server, None, 0)
        .send(BackendRequest::get(["groups"]))
        .await
        .unwrap_err();
    assert!(matches!(err, BackendError::Timeout(_)));
    assert!(err.is_retriable());
}

#[tokio::test]
async fn test_health_reports_latency_and_failures() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/healthcheck"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "healthy"})))
        .mount(&server)
        .await;

    let latency = backend(&server, None, 0).health().await.expect("healthy");
    assert!(latency < Duration::from_secs(2));

    let unreachable = HttpBackend::new(
        "http://127.0.0.1:9",
        None,
        Duration::from_millis(200),
        0,
        Duration::from_millis(10),
    )
    .expect("valid backend");
    let err = unreachable.health().await.unwrap_err();
    assert!(matches!(err, BackendError::Network(_) | BackendError::Timeout(_)));
}
