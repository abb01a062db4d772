//! Row types returned by the store queries.

use chrono::{DateTime, Utc};
use serde_json::Value;

/// Distinct series identity: metric name plus its label set.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SeriesRow {
    pub name: String,
    pub attributes: Value,
}

/// Latest counter/gauge observation at or before a point in time.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct InstantRow {
    pub name: String,
    pub attributes: Value,
    pub value: f64,
    pub time: DateTime<Utc>,
}

/// One step-sized gauge bucket (average of the samples inside it).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BucketRow {
    pub metric_id: i64,
    pub attributes: Value,
    pub bucket_time: DateTime<Utc>,
    pub value: f64,
}

/// One raw counter observation, used by the rate/increase evaluator.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RawCounterRow {
    pub metric_id: i64,
    pub attributes: Value,
    pub time: DateTime<Utc>,
    pub value: f64,
}

/// A recent stored sample joined with its descriptor, as rendered by the
/// text exposition endpoint. Exactly one of `value` and the histogram
/// fields is populated depending on the sample table it came from.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredMetric {
    pub name: String,
    pub description: String,
    pub unit: String,
    #[sqlx(rename = "type")]
    pub metric_type: String,
    pub attributes: Value,
    pub time: DateTime<Utc>,
    pub value: Option<f64>,
    pub sum: Option<f64>,
    pub count: Option<i64>,
    pub bucket_counts: Option<Vec<i64>>,
    pub explicit_bounds: Option<Vec<f64>>,
}

/// Fractional Unix seconds for a database timestamp.
#[must_use]
pub fn epoch_secs(t: DateTime<Utc>) -> f64 {
    t.timestamp_micros() as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn epoch_secs_keeps_fractional_precision() {
        let t = Utc.timestamp_opt(1_700_000_000, 250_000_000).unwrap();
        assert!((epoch_secs(t) - 1_700_000_000.25).abs() < 1e-6);
    }
}
