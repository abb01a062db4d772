//! Flowline API - Main Entry Point
//!
//! Prometheus-compatible query service over the persisted time series.

use anyhow::Result;
use tracing::info;

use fm_core::logging;

mod config;
mod error;
mod format;
mod promql;
mod router;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    dotenvy::dotenv().ok();
    let config = config::Config::from_env()?;

    // Initialize tracing
    logging::init(&config.service);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        service = %config.service.service_name,
        "Starting Flowline API"
    );

    // Initialize database
    let pool = fm_store::create_pool(&config.db).await?;

    // Build router
    let state = router::AppState { db: pool.clone() };
    let app = router::create_router(state);

    // Start server
    let bind_address = config.http.bind_address();
    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    info!(address = %bind_address, "API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    pool.close().await;
    info!("API shutdown complete");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C signal handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Received shutdown signal, cleaning up...");
}
