mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use common::{test_config, Harness};
use ragserve::{http, RagService};
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn multipart_upload(filename: &str, content: &[u8]) -> Request<Body> {
    let boundary = "ragserve-test-boundary";
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
            filename
        )
        .as_bytes(),
    );
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());

    Request::builder()
        .method("POST")
        .uri("/api/upload")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", boundary),
        )
        .body(Body::from(body))
        .unwrap()
}

async fn ready_app(temp_dir: &TempDir) -> (Router, Harness) {
    let harness = Harness::new().await;
    let service = Arc::new(RagService::new(test_config(temp_dir.path())));
    service.initialize_with_backends(harness.backends()).await.unwrap();
    (http::router(service), harness)
}

#[tokio::test]
async fn test_query_before_initialization_is_503() {
    let temp_dir = TempDir::new().unwrap();
    let app = http::router(Arc::new(RagService::new(test_config(temp_dir.path()))));

    let (status, body) = send(&app, post_json("/api/query", json!({"query": "What is the capital of France?"}))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["detail"], "RAG system not initialized");

    let (status, _) = send(&app, post_json("/api/insert", json!({"content": "x"}))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let (status, _) = send(&app, multipart_upload("a.txt", b"text")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_root_and_health_report_state() {
    let temp_dir = TempDir::new().unwrap();
    let harness = Harness::new().await;
    let service = Arc::new(RagService::new(test_config(temp_dir.path())));
    let app = http::router(Arc::clone(&service));

    let (status, body) = send(&app, get("/")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["service"], "RAGServe");
    assert!(body["docs"].is_string());

    let (_, body) = send(&app, get("/health")).await;
    assert_eq!(body["status"], "initializing");
    assert_eq!(body["rag_initialized"], false);
    assert_eq!(body["providers_available"], false);
    assert_eq!(body["state"], "uninitialized");
    assert_eq!(body["graph_uri"], "sqlite::memory:");

    service.initialize_with_backends(harness.backends()).await.unwrap();
    let (status, body) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["rag_initialized"], true);
    assert_eq!(body["state"], "ready");
}

#[tokio::test]
async fn test_health_reports_failed_initialization() {
    let temp_dir = TempDir::new().unwrap();
    let harness = Harness::new().await;
    let mut config = test_config(temp_dir.path());
    config.graph.password.clear();
    let service = Arc::new(RagService::new(config));
    let app = http::router(Arc::clone(&service));

    assert!(service.initialize_with_backends(harness.backends()).await.is_err());
    let (status, body) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["rag_initialized"], false);
    assert_eq!(body["state"], "uninitialized");
    assert!(body["error"].as_str().unwrap().contains("GRAPH_PASSWORD"));

    let (status, _) = send(&app, post_json("/api/insert", json!({"content": "x"}))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_insert_then_query_over_http() {
    let temp_dir = TempDir::new().unwrap();
    let (app, _harness) = ready_app(&temp_dir).await;

    let content = "Paris is the capital of France.";
    let (status, body) = send(&app, post_json("/api/insert", json!({"content": content}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");
    assert_eq!(body["content_length"], content.chars().count());

    let (status, body) = send(
        &app,
        post_json("/api/query", json!({"query": "What is the capital of France?", "mode": "naive"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["mode"], "naive");
    assert!(body["answer"].as_str().unwrap().contains("Paris"));

    let (status, body) = send(&app, post_json("/api/query", json!({"query": "What is the capital of France?"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["mode"], "hybrid");
}

#[tokio::test]
async fn test_bad_requests_are_400() {
    let temp_dir = TempDir::new().unwrap();
    let (app, harness) = ready_app(&temp_dir).await;

    let (status, body) = send(&app, post_json("/api/query", json!({"query": "q", "mode": "fuzzy"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["detail"].as_str().unwrap().contains("fuzzy"));
    assert!(harness.graph.take_calls().is_empty());

    let (status, _) = send(&app, post_json("/api/insert", json!({"description": "no content"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, post_json("/api/insert", json!({"content": "   "}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_huge_top_k_is_400() {
    let temp_dir = TempDir::new().unwrap();
    let (app, _harness) = ready_app(&temp_dir).await;
    send(&app, post_json("/api/insert", json!({"content": "Paris is the capital of France."}))).await;

    let (status, body) = send(
        &app,
        post_json(
            "/api/query",
            json!({"query": "What is the capital of France?", "mode": "hybrid", "top_k": u64::MAX}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["detail"].as_str().unwrap().contains("top_k"));
}

#[tokio::test]
async fn test_extraction_failure_is_500_with_detail() {
    let temp_dir = TempDir::new().unwrap();
    let (app, harness) = ready_app(&temp_dir).await;
    harness.completion.garble_extraction.store(true, Ordering::SeqCst);

    let (status, body) = send(&app, post_json("/api/insert", json!({"content": "Paris is the capital of France."}))).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["detail"].as_str().unwrap().contains("Extraction"));
}

#[tokio::test]
async fn test_query_failure_is_500_with_detail() {
    let temp_dir = TempDir::new().unwrap();
    let (app, _harness) = ready_app(&temp_dir).await;

    // Nothing ingested yet
    let (status, body) = send(&app, post_json("/api/query", json!({"query": "anything", "mode": "local"}))).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["detail"].as_str().unwrap().contains("Retrieval error"));
}

#[tokio::test]
async fn test_upload_over_http() {
    let temp_dir = TempDir::new().unwrap();
    let (app, _harness) = ready_app(&temp_dir).await;

    let content = b"Berlin is the capital of Germany.";
    let (status, body) = send(&app, multipart_upload("germany.txt", content)).await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["status"], "success");
    assert_eq!(body["filename"], "germany.txt");
    assert_eq!(body["size"], content.len());

    let (status, body) = send(
        &app,
        post_json("/api/query", json!({"query": "What is the capital of Germany?", "mode": "naive"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["answer"].as_str().unwrap().contains("Berlin"));
}
