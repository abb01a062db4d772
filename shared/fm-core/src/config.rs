//! Shared configuration sections.
//!
//! Each Flowline binary composes its own `Config` out of these sections,
//! loaded from environment variables. Missing required keys abort startup.

use std::env;

use anyhow::{Context, Result};

/// Redis connection and stream identity.
#[derive(Debug, Clone)]
pub struct RedisSettings {
    pub host: String,
    pub port: u16,
    pub db: u8,
    pub password: Option<String>,
    /// Name of the append-only metric stream.
    pub stream_name: String,
}

impl RedisSettings {
    /// Load from `REDIS_HOST`, `REDIS_PORT`, `REDIS_DB`, `REDIS_PASSWORD`,
    /// `REDIS_STREAM_NAME`.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            host: env::var("REDIS_HOST").context("REDIS_HOST must be set")?,
            port: env::var("REDIS_PORT")
                .context("REDIS_PORT must be set")?
                .parse()
                .context("REDIS_PORT must be a port number")?,
            db: env::var("REDIS_DB")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            password: env::var("REDIS_PASSWORD").ok().filter(|p| !p.is_empty()),
            stream_name: env::var("REDIS_STREAM_NAME").context("REDIS_STREAM_NAME must be set")?,
        })
    }

    /// Connection URL for the fred client.
    #[must_use]
    pub fn url(&self) -> String {
        let auth = self
            .password
            .as_deref()
            .map(|p| format!(":{p}@"))
            .unwrap_or_default();
        format!("redis://{auth}{}:{}/{}", self.host, self.port, self.db)
    }
}

/// Consumer-group identity and read tuning for the aggregator.
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub group: String,
    /// Per-instance consumer name; defaults to `agg-<rand8>`.
    pub consumer_name: String,
    pub block_ms: u64,
    pub batch_size: u64,
    pub pending_idle_ms: u64,
}

impl ConsumerSettings {
    /// Load from `REDIS_CONSUMER_GROUP`, `REDIS_CONSUMER_NAME`,
    /// `REDIS_BLOCK_MS`, `REDIS_BATCH_SIZE`, `REDIS_PENDING_IDLE_MS`.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            group: env::var("REDIS_CONSUMER_GROUP").context("REDIS_CONSUMER_GROUP must be set")?,
            consumer_name: env::var("REDIS_CONSUMER_NAME")
                .unwrap_or_else(|_| Self::generated_consumer_name()),
            block_ms: env::var("REDIS_BLOCK_MS")
                .context("REDIS_BLOCK_MS must be set")?
                .parse()
                .context("REDIS_BLOCK_MS must be an integer")?,
            batch_size: env::var("REDIS_BATCH_SIZE")
                .context("REDIS_BATCH_SIZE must be set")?
                .parse()
                .context("REDIS_BATCH_SIZE must be an integer")?,
            pending_idle_ms: env::var("REDIS_PENDING_IDLE_MS")
                .context("REDIS_PENDING_IDLE_MS must be set")?
                .parse()
                .context("REDIS_PENDING_IDLE_MS must be an integer")?,
        })
    }

    #[must_use]
    pub fn generated_consumer_name() -> String {
        let hex = uuid::Uuid::new_v4().simple().to_string();
        format!("agg-{}", &hex[..8])
    }
}

/// Postgres connection and pool bounds.
#[derive(Debug, Clone)]
pub struct DbSettings {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub min_pool_size: u32,
    pub max_pool_size: u32,
    /// Per-statement bound in seconds, applied as `statement_timeout`.
    pub command_timeout_secs: f64,
    /// One of disable/allow/prefer/require/verify-ca/verify-full.
    pub ssl_mode: Option<String>,
}

impl DbSettings {
    /// Load from `DB_HOST`, `DB_PORT`, `POSTGRES_DB`, `POSTGRES_USER`,
    /// `POSTGRES_PASSWORD`, `DB_MIN_POOL_SIZE`, `DB_MAX_POOL_SIZE`,
    /// `DB_COMMAND_TIMEOUT`, `DB_SSL_MODE`.
    pub fn from_env() -> Result<Self> {
        let ssl_mode = env::var("DB_SSL_MODE").ok().filter(|m| !m.is_empty());
        if let Some(mode) = &ssl_mode {
            const MODES: [&str; 6] = [
                "disable",
                "allow",
                "prefer",
                "require",
                "verify-ca",
                "verify-full",
            ];
            anyhow::ensure!(
                MODES.contains(&mode.as_str()),
                "DB_SSL_MODE must be one of {MODES:?}, got {mode:?}"
            );
        }

        Ok(Self {
            host: env::var("DB_HOST").context("DB_HOST must be set")?,
            port: env::var("DB_PORT")
                .context("DB_PORT must be set")?
                .parse()
                .context("DB_PORT must be a port number")?,
            database: env::var("POSTGRES_DB").context("POSTGRES_DB must be set")?,
            user: env::var("POSTGRES_USER").context("POSTGRES_USER must be set")?,
            password: env::var("POSTGRES_PASSWORD").context("POSTGRES_PASSWORD must be set")?,
            min_pool_size: env::var("DB_MIN_POOL_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1),
            max_pool_size: env::var("DB_MAX_POOL_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            command_timeout_secs: env::var("DB_COMMAND_TIMEOUT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30.0),
            ssl_mode,
        })
    }
}

/// Service identity and logging.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    /// `json` or `text`.
    pub log_format: String,
}

impl ServiceSettings {
    /// Load from `SERVICE_NAME`, `SERVICE_VERSION`, `LOG_LEVEL`,
    /// `LOG_FORMAT`.
    pub fn from_env() -> Result<Self> {
        let log_format = env::var("LOG_FORMAT").unwrap_or_else(|_| "text".into());
        anyhow::ensure!(
            log_format == "json" || log_format == "text",
            "LOG_FORMAT must be 'json' or 'text', got {log_format:?}"
        );
        Ok(Self {
            service_name: env::var("SERVICE_NAME").context("SERVICE_NAME must be set")?,
            service_version: env::var("SERVICE_VERSION").unwrap_or_else(|_| "dev".into()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            log_format,
        })
    }
}

/// HTTP listener address.
#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub host: String,
    pub port: u16,
}

impl HttpSettings {
    /// Load from `API_HOST` and `API_PORT`.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            host: env::var("API_HOST").context("API_HOST must be set")?,
            port: env::var("API_PORT")
                .context("API_PORT must be set")?
                .parse()
                .context("API_PORT must be a port number")?,
        })
    }

    #[must_use]
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redis_url_with_and_without_password() {
        let mut settings = RedisSettings {
            host: "localhost".into(),
            port: 6379,
            db: 2,
            password: None,
            stream_name: "metrics".into(),
        };
        assert_eq!(settings.url(), "redis://localhost:6379/2");

        settings.password = Some("s3cret".into());
        assert_eq!(settings.url(), "redis://:s3cret@localhost:6379/2");
    }

    #[test]
    fn generated_consumer_name_shape() {
        let name = ConsumerSettings::generated_consumer_name();
        assert!(name.starts_with("agg-"));
        assert_eq!(name.len(), "agg-".len() + 8);
        assert!(name[4..].chars().all(|c| c.is_ascii_hexdigit()));
    }
}
