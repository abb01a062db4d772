//! Flowline Core Library
//!
//! Shared building blocks for the collector, aggregator, and query API:
//! the internal metric-point model, the durable Redis-stream client, and
//! environment-driven configuration and logging bootstrap.

pub mod config;
pub mod logging;
pub mod metric;
pub mod stream;

pub use metric::{MetricPoint, MetricType};
pub use stream::{StreamConsumer, StreamError, StreamProducer};
