//! Internal metric-point model.
//!
//! The canonical in-flight representation of one observed sample. Points
//! are produced by the collector's OTLP decoder, serialized as JSON into
//! the stream field `data`, reconstructed by the aggregator, and discarded
//! after a successful insert + ack.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Metric kind. Sum data points map to `Counter` regardless of the OTLP
/// monotonicity flag; downstream treats counters as monotonic cumulative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

impl MetricType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Histogram => "histogram",
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "counter" => Ok(Self::Counter),
            "gauge" => Ok(Self::Gauge),
            "histogram" => Ok(Self::Histogram),
            other => Err(format!("unknown metric type: {other}")),
        }
    }
}

/// One flattened metric sample.
///
/// Counter/gauge points carry `value`; histogram points carry `sum`,
/// `count`, `bucket_counts`, and `explicit_bounds`, where
/// `bucket_counts.len() == explicit_bounds.len() + 1` (the final bucket is
/// the `+Inf` overflow). Attributes are kept sorted so result identity
/// never depends on insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub name: String,
    pub description: String,
    pub unit: String,
    #[serde(rename = "type")]
    pub metric_type: MetricType,
    /// Unix timestamp in nanoseconds; always > 0 for decoded points.
    pub timestamp_nano: u64,
    pub attributes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_counts: Option<Vec<u64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explicit_bounds: Option<Vec<f64>>,
}

impl MetricPoint {
    /// Timestamp in fractional Unix seconds, as stored in the database.
    #[must_use]
    pub fn timestamp_secs(&self) -> f64 {
        self.timestamp_nano as f64 / 1_000_000_000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gauge_point() -> MetricPoint {
        MetricPoint {
            name: "mem_usage".into(),
            description: "resident memory".into(),
            unit: "bytes".into(),
            metric_type: MetricType::Gauge,
            timestamp_nano: 1_700_000_000_000_000_000,
            attributes: BTreeMap::from([("host".into(), "a".into())]),
            value: Some(2.0),
            sum: None,
            count: None,
            bucket_counts: None,
            explicit_bounds: None,
        }
    }

    #[test]
    fn wire_format_uses_type_field_and_omits_empty_payload() {
        let json = serde_json::to_value(gauge_point()).unwrap();
        assert_eq!(json["type"], "gauge");
        assert_eq!(json["value"], 2.0);
        assert!(json.get("sum").is_none());
        assert!(json.get("bucket_counts").is_none());
    }

    #[test]
    fn decodes_payload_with_extra_fields() {
        // The producer merges a trace_id into the payload; the consumer
        // must still reconstruct the point.
        let raw = r#"{
            "name": "http_requests_total",
            "description": "",
            "unit": "",
            "type": "counter",
            "timestamp_nano": 1700000000000000000,
            "attributes": {"job": "api"},
            "value": 10.0,
            "trace_id": "a1b2c3"
        }"#;
        let point: MetricPoint = serde_json::from_str(raw).unwrap();
        assert_eq!(point.metric_type, MetricType::Counter);
        assert_eq!(point.value, Some(10.0));
        assert_eq!(point.attributes["job"], "api");
    }

    #[test]
    fn metric_type_round_trips_through_str() {
        for t in [MetricType::Counter, MetricType::Gauge, MetricType::Histogram] {
            assert_eq!(t.as_str().parse::<MetricType>().unwrap(), t);
        }
        assert!("summary".parse::<MetricType>().is_err());
    }

    #[test]
    fn timestamp_converts_to_fractional_seconds() {
        let point = gauge_point();
        assert!((point.timestamp_secs() - 1_700_000_000.0).abs() < 1e-9);
    }
}
