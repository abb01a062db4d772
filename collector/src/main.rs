//! Flowline Collector - Main Entry Point
//!
//! OTLP/HTTP metric ingestion service: decodes exports, flattens them to
//! internal metric points, and appends them to the durable Redis stream.

use std::sync::Arc;

use anyhow::Result;
use fred::interfaces::ClientLike;
use tracing::{info, warn};

use fm_core::{logging, stream, StreamProducer};

mod config;
mod otlp;
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
        "Starting Flowline collector"
    );

    // Initialize Redis and the stream producer
    let redis = stream::connect(&config.redis).await?;
    let producer = Arc::new(StreamProducer::new(
        redis.clone(),
        &config.redis.stream_name,
        config.buffer_size,
    ));

    // Build router
    let state = router::AppState { producer };
    let app = router::create_router(state);

    // Start server
    let bind_address = config.http.bind_address();
    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    info!(address = %bind_address, "Collector listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Errors on close are captured, not raised.
    if let Err(e) = redis.quit().await {
        warn!(error = %e, "Error while closing Redis client");
    }

    info!("Collector shutdown complete");
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
