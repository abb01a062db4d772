//! API Configuration
//!
//! Loads configuration from environment variables.

use anyhow::Result;

use fm_core::config::{DbSettings, HttpSettings, ServiceSettings};

/// Query API configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres connection and pool bounds.
    pub db: DbSettings,
    /// HTTP listener address.
    pub http: HttpSettings,
    /// Service identity and logging.
    pub service: ServiceSettings,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            db: DbSettings::from_env()?,
            http: HttpSettings::from_env()?,
            service: ServiceSettings::from_env()?,
        })
    }
}
