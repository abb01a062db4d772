//! Logging bootstrap.
//!
//! Initialises the global tracing subscriber from the service settings:
//! `LOG_LEVEL` feeds an `EnvFilter`, `LOG_FORMAT` selects the JSON or the
//! human-readable formatter.

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::ServiceSettings;

/// Install the global subscriber. Call once, before any other logging.
pub fn init(service: &ServiceSettings) {
    let filter = EnvFilter::try_new(&service.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if service.log_format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!(
        service = %service.service_name,
        version = %service.service_version,
        "Logging initialised"
    );
}
