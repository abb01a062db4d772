//! Flowline Aggregator - Main Entry Point
//!
//! Stream-group consumer that persists metric points into the time-series
//! store with at-least-once delivery.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use fred::interfaces::ClientLike;
use tracing::{info, warn};

use fm_core::{logging, stream, StreamConsumer};

mod config;
mod health;
mod worker;

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
        consumer = %config.consumer.consumer_name,
        "Starting Flowline aggregator"
    );

    // Initialize Redis and the database pool
    let redis = stream::connect(&config.redis).await?;
    let pool = fm_store::create_pool(&config.db).await?;

    let consumer = StreamConsumer::new(
        redis.clone(),
        &config.redis.stream_name,
        &config.consumer.group,
        &config.consumer.consumer_name,
    );

    // Start the worker and the health endpoint
    let stop = Arc::new(AtomicBool::new(false));
    let aggregation_worker =
        worker::AggregationWorker::new(consumer, pool.clone(), config.consumer.clone(), stop.clone());
    let mut worker_handle = tokio::spawn(aggregation_worker.run());

    let health_addr = format!("{}:{}", config.health_host, config.health_port);
    let health_handle = tokio::spawn(health::serve(health_addr));

    shutdown_signal().await;

    // Raise the stop flag; the loop breaks at the next iteration boundary.
    stop.store(true, Ordering::Relaxed);
    if tokio::time::timeout(config.worker_shutdown_timeout, &mut worker_handle)
        .await
        .is_err()
    {
        warn!(
            timeout = ?config.worker_shutdown_timeout,
            "Worker did not stop within the shutdown timeout, cancelling"
        );
        worker_handle.abort();
    }
    health_handle.abort();

    // Close connections concurrently; errors are captured, not raised.
    let (redis_result, ()) = tokio::join!(redis.quit(), pool.close());
    if let Err(e) = redis_result {
        warn!(error = %e, "Error while closing Redis client");
    }

    info!("Aggregator shutdown complete");
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
