//! Aggregator Configuration
//!
//! Loads configuration from environment variables.

use std::env;
use std::time::Duration;

use anyhow::Result;

use fm_core::config::{ConsumerSettings, DbSettings, RedisSettings, ServiceSettings};

/// Aggregator configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Redis connection and source stream.
    pub redis: RedisSettings,
    /// Consumer-group identity and read tuning.
    pub consumer: ConsumerSettings,
    /// Postgres connection and pool bounds.
    pub db: DbSettings,
    /// Service identity and logging.
    pub service: ServiceSettings,
    /// How long shutdown waits for the worker before cancelling it.
    pub worker_shutdown_timeout: Duration,
    /// Health endpoint listener.
    pub health_host: String,
    pub health_port: u16,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            redis: RedisSettings::from_env()?,
            consumer: ConsumerSettings::from_env()?,
            db: DbSettings::from_env()?,
            service: ServiceSettings::from_env()?,
            worker_shutdown_timeout: Duration::from_secs_f64(
                env::var("WORKER_SHUTDOWN_TIMEOUT")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(10.0),
            ),
            health_host: env::var("HEALTH_SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            health_port: env::var("HEALTH_SERVER_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8081),
        })
    }
}
