//! Ingestion Router
//!
//! `POST /v1/metrics` accepts OTLP/HTTP protobuf exports, flattens them to
//! metric points, and dispatches each point to the durable stream.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde::Serialize;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use fm_core::StreamProducer;

use crate::otlp::{self, DecodeError};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Stream producer with the overflow buffer.
    pub producer: Arc<StreamProducer>,
}

/// Ingestion error types.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Body was not `application/x-protobuf`.
    #[error("unsupported content type: {0}")]
    UnsupportedMediaType(String),

    /// Body failed to decode.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Non-transient stream failure (transient failures are buffered).
    #[error("stream dispatch failed: {0}")]
    Stream(String),
}

/// Error response body for JSON responses.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    /// Machine-readable error code.
    error: String,
    /// Human-readable error message.
    message: String,
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            Self::UnsupportedMediaType(_) => {
                (StatusCode::UNSUPPORTED_MEDIA_TYPE, "UNSUPPORTED_MEDIA_TYPE")
            }
            Self::Decode(_) => (StatusCode::BAD_REQUEST, "INVALID_OTLP"),
            Self::Stream(_) => (StatusCode::INTERNAL_SERVER_ERROR, "STREAM_ERROR"),
        };
        let body = Json(ErrorResponse {
            error: code.to_string(),
            message: self.to_string(),
        });
        (status, body).into_response()
    }
}

/// Create the collector router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/metrics", post(ingest_metrics))
        .route("/health", get(health_check))
        // Middleware
        .layer(TraceLayer::new_for_http())
        // Request ID doubles as the ingest trace id
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(state)
}

/// Ingestion response: how many metric points the body flattened into.
#[derive(Debug, Serialize)]
struct IngestResponse {
    received: usize,
}

async fn ingest_metrics(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<IngestResponse>, IngestError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();
    if !content_type.contains("application/x-protobuf") {
        return Err(IngestError::UnsupportedMediaType(content_type));
    }

    let points = otlp::decode_request(&body)?;

    let trace_id = headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    for point in &points {
        state
            .producer
            .send(point, trace_id.clone())
            .await
            .map_err(|e| {
                tracing::error!(
                    trace_id = trace_id.as_deref().unwrap_or(""),
                    metric = %point.name,
                    error = %e,
                    "Failed to dispatch point to stream"
                );
                IngestError::Stream(e.to_string())
            })?;
    }

    Ok(Json(IngestResponse {
        received: points.len(),
    }))
}

/// Health check response.
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}
