//! Flowline time-series store facade.
//!
//! Owns the persisted schema (`metrics_info` descriptors, `metrics_values`
//! samples, `metrics_histograms`) behind a small set of query functions
//! over a shared [`sqlx::PgPool`]. The write path resolves descriptors by
//! identity (`name`, `attributes`, bucket layout) so repeated delivery of
//! the same point is idempotent at the descriptor level; samples are never
//! deduplicated.
//!
//! The expected DDL lives in `schema.sql` next to this crate (migrations
//! are managed outside this repository).

pub mod models;
pub mod queries;

use anyhow::Result;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::PgPool;
use tracing::info;

use fm_core::config::DbSettings;

pub use models::{BucketRow, InstantRow, RawCounterRow, SeriesRow, StoredMetric};
pub use queries::StoreError;

/// Create the bounded Postgres connection pool.
///
/// `DB_COMMAND_TIMEOUT` becomes the server-side `statement_timeout` for
/// every connection, so no single statement can outlive the configured
/// bound.
pub async fn create_pool(settings: &DbSettings) -> Result<PgPool> {
    let timeout_ms = (settings.command_timeout_secs * 1000.0).round() as i64;
    let mut options = PgConnectOptions::new()
        .host(&settings.host)
        .port(settings.port)
        .database(&settings.database)
        .username(&settings.user)
        .password(&settings.password)
        .options([("statement_timeout", format!("{timeout_ms}ms"))]);

    if let Some(mode) = &settings.ssl_mode {
        options = options.ssl_mode(mode.parse::<PgSslMode>()?);
    }

    let pool = PgPoolOptions::new()
        .min_connections(settings.min_pool_size)
        .max_connections(settings.max_pool_size)
        .connect_with(options)
        .await?;

    info!(
        host = %settings.host,
        port = settings.port,
        database = %settings.database,
        "Connected to Postgres"
    );
    Ok(pool)
}
