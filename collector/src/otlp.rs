//! OTLP decoder.
//!
//! Turns the protobuf `ExportMetricsServiceRequest` body of an OTLP/HTTP
//! export into a flat sequence of internal metric points. Sum data points
//! become counters regardless of the monotonicity flag; the rest of the
//! pipeline treats counters as monotonic cumulative.

use std::collections::BTreeMap;

use opentelemetry_proto::tonic::collector::metrics::v1::ExportMetricsServiceRequest;
use opentelemetry_proto::tonic::common::v1::{any_value, KeyValue};
use opentelemetry_proto::tonic::metrics::v1::{
    metric, number_data_point, HistogramDataPoint, Metric, NumberDataPoint,
};
use prost::Message;
use tracing::debug;

use fm_core::{MetricPoint, MetricType};

/// Attribute keys with these prefixes are SDK noise and are dropped.
const RESERVED_PREFIXES: [&str; 3] = ["telemetry.sdk.", "otel.scope.", "otel.library."];

/// Decoding errors, surfaced to the HTTP caller as 400.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid OTLP protobuf payload: {0}")]
    Protobuf(#[from] prost::DecodeError),
}

/// Decode a protobuf request body into flattened metric points.
///
/// Every emitted point carries the union of the enclosing resource's
/// attributes and its own data-point attributes, with the data-point
/// winning on key conflicts. Metrics with an unsupported payload branch
/// (exponential histogram, summary) are skipped, not fatal.
pub fn decode_request(body: &[u8]) -> Result<Vec<MetricPoint>, DecodeError> {
    let request = ExportMetricsServiceRequest::decode(body)?;

    let mut points = Vec::new();
    for rm in request.resource_metrics {
        let resource_attrs = rm
            .resource
            .map(|r| attributes_to_map(&r.attributes))
            .unwrap_or_default();

        for sm in rm.scope_metrics {
            for m in sm.metrics {
                flatten_metric(m, &resource_attrs, &mut points);
            }
        }
    }
    Ok(points)
}

fn flatten_metric(
    m: Metric,
    resource_attrs: &BTreeMap<String, String>,
    out: &mut Vec<MetricPoint>,
) {
    let Metric {
        name,
        description,
        unit,
        data,
        ..
    } = m;

    match data {
        Some(metric::Data::Sum(sum)) => {
            for dp in sum.data_points {
                out.push(number_point(
                    &name,
                    &description,
                    &unit,
                    MetricType::Counter,
                    dp,
                    resource_attrs,
                ));
            }
        }
        Some(metric::Data::Gauge(gauge)) => {
            for dp in gauge.data_points {
                out.push(number_point(
                    &name,
                    &description,
                    &unit,
                    MetricType::Gauge,
                    dp,
                    resource_attrs,
                ));
            }
        }
        Some(metric::Data::Histogram(histogram)) => {
            for dp in histogram.data_points {
                out.push(histogram_point(&name, &description, &unit, dp, resource_attrs));
            }
        }
        Some(_) => {
            debug!(metric = %name, "Skipping metric with unsupported payload branch");
        }
        None => {
            debug!(metric = %name, "Skipping metric without payload");
        }
    }
}

fn number_point(
    name: &str,
    description: &str,
    unit: &str,
    metric_type: MetricType,
    dp: NumberDataPoint,
    resource_attrs: &BTreeMap<String, String>,
) -> MetricPoint {
    let value = match dp.value {
        Some(number_data_point::Value::AsDouble(v)) => v,
        Some(number_data_point::Value::AsInt(v)) => v as f64,
        None => 0.0,
    };

    MetricPoint {
        name: name.to_owned(),
        description: description.to_owned(),
        unit: unit.to_owned(),
        metric_type,
        timestamp_nano: dp.time_unix_nano,
        attributes: merged_attributes(resource_attrs, &dp.attributes),
        value: Some(value),
        sum: None,
        count: None,
        bucket_counts: None,
        explicit_bounds: None,
    }
}

fn histogram_point(
    name: &str,
    description: &str,
    unit: &str,
    dp: HistogramDataPoint,
    resource_attrs: &BTreeMap<String, String>,
) -> MetricPoint {
    MetricPoint {
        name: name.to_owned(),
        description: description.to_owned(),
        unit: unit.to_owned(),
        metric_type: MetricType::Histogram,
        timestamp_nano: dp.time_unix_nano,
        attributes: merged_attributes(resource_attrs, &dp.attributes),
        value: None,
        sum: dp.sum,
        count: Some(dp.count),
        bucket_counts: Some(dp.bucket_counts),
        explicit_bounds: Some(dp.explicit_bounds),
    }
}

/// Resource attributes first, then data-point attributes; the data point
/// wins on key conflicts.
fn merged_attributes(
    resource_attrs: &BTreeMap<String, String>,
    attributes: &[KeyValue],
) -> BTreeMap<String, String> {
    let mut merged = resource_attrs.clone();
    merged.extend(attributes_to_map(attributes));
    merged
}

/// Normalise an OTLP attribute list into the internal label map: reserved
/// prefixes dropped, `.` replaced with `_`, values coerced to strings,
/// empty values dropped.
fn attributes_to_map(attributes: &[KeyValue]) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for kv in attributes {
        if RESERVED_PREFIXES.iter().any(|p| kv.key.starts_with(p)) {
            continue;
        }
        let Some(value) = kv.value.as_ref().and_then(|v| v.value.as_ref()) else {
            continue;
        };
        let coerced = coerce_value(value);
        if coerced.is_empty() {
            continue;
        }
        map.insert(kv.key.replace('.', "_"), coerced);
    }
    map
}

/// String pass-through, bool as lowercase, numbers via the shortest
/// decimal form (`Display` drops the `.0` of integral doubles). Array,
/// kvlist, and bytes values coerce to empty and are dropped.
fn coerce_value(value: &any_value::Value) -> String {
    match value {
        any_value::Value::StringValue(s) => s.clone(),
        any_value::Value::BoolValue(b) => b.to_string(),
        any_value::Value::IntValue(i) => i.to_string(),
        any_value::Value::DoubleValue(d) => format!("{d}"),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry_proto::tonic::common::v1::AnyValue;
    use opentelemetry_proto::tonic::metrics::v1::{
        Gauge, Histogram, ResourceMetrics, ScopeMetrics, Sum, Summary,
    };
    use opentelemetry_proto::tonic::resource::v1::Resource;

    fn string_attr(key: &str, value: &str) -> KeyValue {
        KeyValue {
            key: key.into(),
            value: Some(AnyValue {
                value: Some(any_value::Value::StringValue(value.into())),
            }),
        }
    }

    fn number_dp(value: f64, attrs: Vec<KeyValue>) -> NumberDataPoint {
        NumberDataPoint {
            attributes: attrs,
            time_unix_nano: 1_700_000_000_000_000_000,
            value: Some(number_data_point::Value::AsDouble(value)),
            ..Default::default()
        }
    }

    fn request_with(metrics: Vec<Metric>, resource_attrs: Vec<KeyValue>) -> Vec<u8> {
        ExportMetricsServiceRequest {
            resource_metrics: vec![ResourceMetrics {
                resource: Some(Resource {
                    attributes: resource_attrs,
                    ..Default::default()
                }),
                scope_metrics: vec![ScopeMetrics {
                    scope: None,
                    metrics,
                    ..Default::default()
                }],
                ..Default::default()
            }],
        }
        .encode_to_vec()
    }

    #[test]
    fn point_count_matches_data_points() {
        let body = request_with(
            vec![
                Metric {
                    name: "http_requests_total".into(),
                    data: Some(metric::Data::Sum(Sum {
                        data_points: vec![number_dp(1.0, vec![]), number_dp(2.0, vec![])],
                        aggregation_temporality: 2,
                        is_monotonic: false,
                    })),
                    ..Default::default()
                },
                Metric {
                    name: "mem_usage".into(),
                    data: Some(metric::Data::Gauge(Gauge {
                        data_points: vec![number_dp(3.0, vec![])],
                    })),
                    ..Default::default()
                },
            ],
            vec![],
        );

        let points = decode_request(&body).unwrap();
        assert_eq!(points.len(), 3);
        // Sum data points become counters even when not monotonic.
        assert_eq!(points[0].metric_type, MetricType::Counter);
        assert_eq!(points[2].metric_type, MetricType::Gauge);
    }

    #[test]
    fn data_point_attributes_win_over_resource() {
        let body = request_with(
            vec![Metric {
                name: "m".into(),
                data: Some(metric::Data::Gauge(Gauge {
                    data_points: vec![number_dp(
                        1.0,
                        vec![string_attr("host", "dp"), string_attr("zone", "z1")],
                    )],
                })),
                ..Default::default()
            }],
            vec![
                string_attr("host", "resource"),
                string_attr("service.name", "api"),
            ],
        );

        let points = decode_request(&body).unwrap();
        let attrs = &points[0].attributes;
        assert_eq!(attrs["host"], "dp");
        assert_eq!(attrs["zone"], "z1");
        // Resource key with a dot is normalised.
        assert_eq!(attrs["service_name"], "api");
    }

    #[test]
    fn reserved_and_empty_attributes_are_dropped() {
        let attrs = vec![
            string_attr("telemetry.sdk.name", "opentelemetry"),
            string_attr("otel.scope.name", "scope"),
            string_attr("otel.library.version", "1.0"),
            string_attr("empty", ""),
            KeyValue {
                key: "no_value".into(),
                value: None,
            },
            string_attr("kept", "yes"),
        ];
        let map = attributes_to_map(&attrs);
        assert_eq!(map.len(), 1);
        assert_eq!(map["kept"], "yes");
    }

    #[test]
    fn value_coercion_shapes() {
        assert_eq!(coerce_value(&any_value::Value::BoolValue(true)), "true");
        assert_eq!(coerce_value(&any_value::Value::BoolValue(false)), "false");
        assert_eq!(coerce_value(&any_value::Value::IntValue(-3)), "-3");
        assert_eq!(coerce_value(&any_value::Value::DoubleValue(4.0)), "4");
        assert_eq!(coerce_value(&any_value::Value::DoubleValue(4.5)), "4.5");
        assert_eq!(
            coerce_value(&any_value::Value::StringValue("x".into())),
            "x"
        );
    }

    #[test]
    fn int_data_points_decode_as_floats() {
        let dp = NumberDataPoint {
            time_unix_nano: 1,
            value: Some(number_data_point::Value::AsInt(42)),
            ..Default::default()
        };
        let point = number_point("c", "", "", MetricType::Counter, dp, &BTreeMap::new());
        assert_eq!(point.value, Some(42.0));
    }

    #[test]
    fn histogram_payload_is_carried_through() {
        let body = request_with(
            vec![Metric {
                name: "latency".into(),
                data: Some(metric::Data::Histogram(Histogram {
                    data_points: vec![HistogramDataPoint {
                        time_unix_nano: 1_700_000_000_000_000_000,
                        count: 6,
                        sum: Some(12.5),
                        bucket_counts: vec![2, 3, 1],
                        explicit_bounds: vec![1.0, 5.0],
                        ..Default::default()
                    }],
                    aggregation_temporality: 2,
                })),
                ..Default::default()
            }],
            vec![],
        );

        let points = decode_request(&body).unwrap();
        assert_eq!(points.len(), 1);
        let p = &points[0];
        assert_eq!(p.metric_type, MetricType::Histogram);
        assert_eq!(p.sum, Some(12.5));
        assert_eq!(p.count, Some(6));
        assert_eq!(p.bucket_counts.as_deref(), Some(&[2_u64, 3, 1][..]));
        assert_eq!(p.explicit_bounds.as_deref(), Some(&[1.0, 5.0][..]));
    }

    #[test]
    fn unsupported_branch_is_skipped_not_fatal() {
        let body = request_with(
            vec![
                Metric {
                    name: "quantiles".into(),
                    data: Some(metric::Data::Summary(Summary::default())),
                    ..Default::default()
                },
                Metric {
                    name: "kept".into(),
                    data: Some(metric::Data::Gauge(Gauge {
                        data_points: vec![number_dp(1.0, vec![])],
                    })),
                    ..Default::default()
                },
            ],
            vec![],
        );

        let points = decode_request(&body).unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].name, "kept");
    }

    #[test]
    fn malformed_body_is_an_error() {
        assert!(decode_request(&[0xff, 0xff, 0xff]).is_err());
    }
}
