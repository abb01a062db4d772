//! Collector Configuration
//!
//! Loads configuration from environment variables.

use std::env;

use anyhow::Result;

use fm_core::config::{HttpSettings, RedisSettings, ServiceSettings};

/// Default overflow-buffer capacity when `REDIS_BUFFER_SIZE` is unset.
const DEFAULT_BUFFER_SIZE: usize = 1000;

/// Collector configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Redis connection and target stream.
    pub redis: RedisSettings,
    /// HTTP listener address.
    pub http: HttpSettings,
    /// Service identity and logging.
    pub service: ServiceSettings,
    /// Capacity of the in-memory overflow buffer used while the stream is
    /// unreachable.
    pub buffer_size: usize,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            redis: RedisSettings::from_env()?,
            http: HttpSettings::from_env()?,
            service: ServiceSettings::from_env()?,
            buffer_size: env::var("REDIS_BUFFER_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_BUFFER_SIZE),
        })
    }
}
