//! Minimal health endpoint for the headless worker process.

use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tracing::{error, info};

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// Serve `GET /health` until the task is aborted. Failures are logged, not
/// raised; a broken health listener must not take the worker down.
pub async fn serve(addr: String) {
    let app = Router::new().route("/health", get(health_check));

    match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => {
            info!(address = %addr, "Health server listening");
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "Health server terminated");
            }
        }
        Err(e) => {
            error!(address = %addr, error = %e, "Failed to bind health server");
        }
    }
}
