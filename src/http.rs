//! HTTP surface: axum router, request DTOs and error-to-status mapping.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::error::{RagError, Result};
use crate::pipeline::{QueryOptions, RetrievalMode};
use crate::service::{RagService, SystemState};

/// Error wrapper mapping `RagError` to an HTTP response
pub struct ApiError(pub RagError);

impl From<RagError> for ApiError {
    fn from(e: RagError) -> Self {
        ApiError(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self.0 {
            RagError::NotReady => StatusCode::SERVICE_UNAVAILABLE,
            RagError::InvalidMode(_) | RagError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(json!({ "detail": self.0.to_string() }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct InsertRequest {
    pub content: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub only_need_context: bool,
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &Bytes) -> std::result::Result<T, ApiError> {
    serde_json::from_slice(body)
        .map_err(|e| ApiError(RagError::InvalidInput(format!("Invalid JSON: {}", e))))
}

/// Build the router over a shared service
pub fn router(service: Arc<RagService>) -> Router {
    let max_upload = service.config().server.max_upload_bytes;
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(handle_root))
        .route("/health", get(handle_health))
        .route("/api/insert", post(handle_insert))
        .route("/api/query", post(handle_query))
        .route(
            "/api/upload",
            post(handle_upload).layer(DefaultBodyLimit::max(max_upload)),
        )
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(service)
}

async fn handle_root() -> Json<serde_json::Value> {
    Json(json!({
        "service": "RAGServe",
        "status": "running",
        "docs": "/docs",
    }))
}

async fn handle_health(State(service): State<Arc<RagService>>) -> Json<serde_json::Value> {
    let state = service.state().await;
    let ready = state == SystemState::Ready;
    let mut body = json!({
        "status": if ready { "healthy" } else { "initializing" },
        "rag_initialized": ready,
        "graph_uri": service.graph_uri(),
        "providers_available": ready,
        "state": state,
    });
    if let Some(reason) = service.failure().await {
        body["error"] = json!(reason);
    }
    Json(body)
}

async fn handle_insert(
    State(service): State<Arc<RagService>>,
    body: Bytes,
) -> std::result::Result<Json<serde_json::Value>, ApiError> {
    let request: InsertRequest = parse_body(&body)?;
    let receipt = service.insert(&request.content, request.description).await?;
    Ok(Json(json!({
        "status": "success",
        "message": if receipt.report.skipped {
            "Content already present"
        } else {
            "Content inserted successfully"
        },
        "content_length": receipt.content_length,
        "doc_id": receipt.report.doc_id,
    })))
}

async fn handle_query(
    State(service): State<Arc<RagService>>,
    body: Bytes,
) -> std::result::Result<Json<serde_json::Value>, ApiError> {
    let request: QueryRequest = parse_body(&body)?;
    let default_mode = RetrievalMode::default().to_string();
    let mode = request.mode.unwrap_or(default_mode);
    let options = QueryOptions {
        top_k: request.top_k,
        only_need_context: request.only_need_context,
    };
    let answer = service.query(&request.query, &mode, options).await?;
    Ok(Json(json!({
        "answer": answer.answer,
        "mode": answer.mode,
    })))
}

async fn handle_upload(
    State(service): State<Arc<RagService>>,
    mut multipart: Multipart,
) -> std::result::Result<Json<serde_json::Value>, ApiError> {
    // Reject early so an uninitialized service does not buffer the body
    if service.state().await != SystemState::Ready {
        return Err(ApiError(RagError::NotReady));
    }

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError(RagError::InvalidInput(format!("Malformed multipart body: {}", e))))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or("upload").to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError(RagError::InvalidInput(format!("Failed to read upload: {}", e))))?;

        let receipt = service.upload(&filename, &bytes).await?;
        return Ok(Json(json!({
            "status": "success",
            "message": format!("File {} processed successfully", receipt.filename),
            "filename": receipt.filename,
            "size": receipt.size,
        })));
    }

    Err(ApiError(RagError::InvalidInput(
        "multipart body has no 'file' field".to_string(),
    )))
}

/// Check if a port is available by attempting to bind to it
async fn check_port_available(host: &str, port: u16) -> bool {
    tokio::net::TcpListener::bind((host, port)).await.is_ok()
}

/// Bind and serve until the process stops
pub async fn serve(service: Arc<RagService>, server: &ServerConfig) -> Result<()> {
    let addr = format!("{}:{}", server.host, server.port);

    if !check_port_available(&server.host, server.port).await {
        return Err(RagError::Configuration(format!(
            "Port {} is already in use. Stop the other process or set PORT to a free port.",
            server.port
        )));
    }

    let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
        RagError::Io(std::io::Error::new(
            e.kind(),
            format!("Failed to bind to {}: {}", addr, e),
        ))
    })?;
    log::info!("Starting RAGServe on http://{}", addr);

    axum::serve(listener, router(service))
        .await
        .map_err(|e| RagError::Io(std::io::Error::other(format!("HTTP server error: {}", e))))?;
    Ok(())
}
