//! API Error Types

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use fm_store::StoreError;

use crate::promql::parser::ParseError;

/// Query API error types.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Invalid PromQL.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Scalar expression used where a range is required.
    #[error("scalar expressions are not valid in range queries")]
    ScalarInRange,

    /// Invalid or missing request parameter.
    #[error("{0}")]
    BadRequest(String),

    /// Storage failure.
    #[error("storage error: {0}")]
    Database(#[from] sqlx::Error),

    /// Storage facade failure.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

/// Prometheus-style error envelope.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    status: &'static str,
    #[serde(rename = "errorType")]
    error_type: &'static str,
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            Self::Parse(_) | Self::ScalarInRange | Self::BadRequest(_) => {
                (StatusCode::BAD_REQUEST, "bad_data")
            }
            Self::Database(_) | Self::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };

        if status.is_server_error() {
            tracing::error!(error = %self, "Query request failed");
        } else {
            tracing::warn!(error = %self, "Rejected query request");
        }

        let body = Json(ErrorResponse {
            status: "error",
            error_type,
            error: self.to_string(),
        });
        (status, body).into_response()
    }
}
