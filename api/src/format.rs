//! Prometheus response shapes.
//!
//! JSON envelopes for the HTTP API (`{status, data}` with vector, matrix,
//! labels, series, and buildinfo payloads) and the text exposition format
//! served on `/metrics`.

use std::collections::{BTreeMap, HashMap};

use serde::ser::SerializeTuple;
use serde::{Serialize, Serializer};
use serde_json::Value;

use fm_store::StoredMetric;

// ============================================================================
// JSON envelope
// ============================================================================

/// Top-level `{status, data}` envelope.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub status: &'static str,
    pub data: T,
}

impl<T> ApiResponse<T> {
    pub const fn success(data: T) -> Self {
        Self {
            status: "success",
            data,
        }
    }
}

/// `data` payload for query results.
#[derive(Debug, Serialize)]
pub struct QueryData<T> {
    #[serde(rename = "resultType")]
    pub result_type: &'static str,
    pub result: Vec<T>,
}

/// One instant-vector element.
#[derive(Debug, Serialize)]
pub struct VectorItem {
    pub metric: BTreeMap<String, String>,
    pub value: Sample,
}

/// One matrix stream.
#[derive(Debug, Serialize)]
pub struct MatrixItem {
    pub metric: BTreeMap<String, String>,
    pub values: Vec<Sample>,
}

#[must_use]
pub const fn vector(result: Vec<VectorItem>) -> ApiResponse<QueryData<VectorItem>> {
    ApiResponse::success(QueryData {
        result_type: "vector",
        result,
    })
}

#[must_use]
pub const fn matrix(result: Vec<MatrixItem>) -> ApiResponse<QueryData<MatrixItem>> {
    ApiResponse::success(QueryData {
        result_type: "matrix",
        result,
    })
}

/// One `[timestamp, "value"]` pair. Timestamps are Unix seconds with
/// fractional precision; integral timestamps serialize without a fraction
/// and values are always strings.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub timestamp: f64,
    pub value: String,
}

impl Sample {
    #[must_use]
    pub fn new(timestamp: f64, value: f64) -> Self {
        Self {
            timestamp,
            value: format_value(value),
        }
    }
}

impl Serialize for Sample {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(2)?;
        if self.timestamp.fract() == 0.0 && self.timestamp.abs() < 9e15 {
            tuple.serialize_element(&(self.timestamp as i64))?;
        } else {
            tuple.serialize_element(&self.timestamp)?;
        }
        tuple.serialize_element(&self.value)?;
        tuple.end()
    }
}

/// Shortest decimal form; integral floats lose the trailing `.0`.
#[must_use]
pub fn format_value(value: f64) -> String {
    format!("{value}")
}

/// Fixed `/api/v1/status/buildinfo` payload.
#[derive(Debug, Serialize)]
pub struct BuildInfo {
    pub version: String,
    pub revision: String,
    pub branch: String,
    #[serde(rename = "buildUser")]
    pub build_user: String,
    #[serde(rename = "buildDate")]
    pub build_date: String,
}

impl BuildInfo {
    #[must_use]
    pub fn current() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_owned(),
            revision: "custom".to_owned(),
            branch: "master".to_owned(),
            build_user: "flowline".to_owned(),
            build_date: chrono::Utc::now().format("%Y%m%d-%H:%M:%SZ").to_string(),
        }
    }
}

/// JSONB attribute object to an ordered label map.
#[must_use]
pub fn attrs_to_map(attrs: &Value) -> BTreeMap<String, String> {
    attrs
        .as_object()
        .map(|map| {
            map.iter()
                .map(|(k, v)| {
                    let s = v
                        .as_str()
                        .map_or_else(|| v.to_string(), std::borrow::ToOwned::to_owned);
                    (k.clone(), s)
                })
                .collect()
        })
        .unwrap_or_default()
}

// ============================================================================
// Text exposition
// ============================================================================

/// Render recent samples in Prometheus exposition format. `# HELP` and
/// `# TYPE` are emitted once per metric name; histogram samples expand to
/// cumulative `_bucket` lines in ascending bound order, with the final
/// `le="+Inf"` bucket equal to the observation count, then `_sum` and
/// `_count`.
#[must_use]
pub fn render_exposition(metrics: &[StoredMetric]) -> String {
    let mut order: Vec<&str> = Vec::new();
    let mut groups: HashMap<&str, Vec<&StoredMetric>> = HashMap::new();
    for m in metrics {
        let group = groups.entry(m.name.as_str()).or_default();
        if group.is_empty() {
            order.push(m.name.as_str());
        }
        group.push(m);
    }

    let mut lines = Vec::new();
    for name in order {
        let group = &groups[name];
        lines.push(format!("# HELP {name} {}", group[0].description));
        lines.push(format!("# TYPE {name} {}", group[0].metric_type));

        for m in group {
            let labels = attrs_to_map(&m.attributes);
            match m.metric_type.as_str() {
                "counter" | "gauge" => {
                    if let Some(value) = m.value {
                        lines.push(format!(
                            "{name}{} {}",
                            format_labels(&labels, None),
                            format_value(value)
                        ));
                    }
                }
                "histogram" => render_histogram(&mut lines, name, &labels, m),
                _ => {}
            }
        }
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

fn render_histogram(
    lines: &mut Vec<String>,
    name: &str,
    labels: &BTreeMap<String, String>,
    m: &StoredMetric,
) {
    let (Some(bucket_counts), Some(bounds), Some(sum), Some(count)) = (
        m.bucket_counts.as_ref(),
        m.explicit_bounds.as_ref(),
        m.sum,
        m.count,
    ) else {
        return;
    };

    let mut cumulative: i64 = 0;
    for (bound, bucket) in bounds.iter().zip(bucket_counts) {
        cumulative += bucket;
        lines.push(format!(
            "{name}_bucket{} {cumulative}",
            format_labels(labels, Some(("le", &format_value(*bound))))
        ));
    }
    lines.push(format!(
        "{name}_bucket{} {count}",
        format_labels(labels, Some(("le", "+Inf")))
    ));
    lines.push(format!(
        "{name}_sum{} {}",
        format_labels(labels, None),
        format_value(sum)
    ));
    lines.push(format!("{name}_count{} {count}", format_labels(labels, None)));
}

/// `{k="v",…}`, empty string when there are no labels. The optional extra
/// pair is appended last (used for `le`).
fn format_labels(labels: &BTreeMap<String, String>, extra: Option<(&str, &str)>) -> String {
    let mut pairs: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{k}=\"{}\"", escape_label_value(v)))
        .collect();
    if let Some((k, v)) = extra {
        pairs.push(format!("{k}=\"{}\"", escape_label_value(v)));
    }
    if pairs.is_empty() {
        String::new()
    } else {
        format!("{{{}}}", pairs.join(","))
    }
}

/// Backslash, newline, and double quote become their escaped forms.
fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', r"\\")
        .replace('\n', r"\n")
        .replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn stored(name: &str, kind: &str, attrs: Value) -> StoredMetric {
        StoredMetric {
            name: name.into(),
            description: "test metric".into(),
            unit: String::new(),
            metric_type: kind.into(),
            attributes: attrs,
            time: Utc::now(),
            value: None,
            sum: None,
            count: None,
            bucket_counts: None,
            explicit_bounds: None,
        }
    }

    #[test]
    fn vector_envelope_shape() {
        let response = vector(vec![VectorItem {
            metric: BTreeMap::from([("__name__".into(), "up".into())]),
            value: Sample::new(1_700_000_000.0, 1.0),
        }]);
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(
            json,
            json!({
                "status": "success",
                "data": {
                    "resultType": "vector",
                    "result": [
                        {"metric": {"__name__": "up"}, "value": [1_700_000_000_i64, "1"]}
                    ]
                }
            })
        );
    }

    #[test]
    fn fractional_timestamps_keep_their_fraction() {
        let json = serde_json::to_value(Sample::new(10.5, 0.25)).unwrap();
        assert_eq!(json, json!([10.5, "0.25"]));
    }

    #[test]
    fn matrix_envelope_shape() {
        let response = matrix(vec![MatrixItem {
            metric: BTreeMap::from([
                ("__name__".into(), "mem".into()),
                ("host".into(), "a".into()),
            ]),
            values: vec![Sample::new(10.0, 2.0), Sample::new(20.0, 4.0)],
        }]);
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["data"]["resultType"], "matrix");
        assert_eq!(
            json["data"]["result"][0]["values"],
            json!([[10, "2"], [20, "4"]])
        );
    }

    #[test]
    fn value_formatting_drops_trailing_zero() {
        assert_eq!(format_value(1.0), "1");
        assert_eq!(format_value(0.25), "0.25");
        assert_eq!(format_value(-3.0), "-3");
    }

    #[test]
    fn histogram_exposition_is_cumulative() {
        let mut m = stored("latency", "histogram", json!({}));
        m.sum = Some(12.5);
        m.count = Some(6);
        m.bucket_counts = Some(vec![2, 3, 1]);
        m.explicit_bounds = Some(vec![1.0, 5.0]);

        let text = render_exposition(&[m]);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "# HELP latency test metric",
                "# TYPE latency histogram",
                "latency_bucket{le=\"1\"} 2",
                "latency_bucket{le=\"5\"} 5",
                "latency_bucket{le=\"+Inf\"} 6",
                "latency_sum 12.5",
                "latency_count 6",
            ]
        );
    }

    #[test]
    fn help_and_type_once_per_metric_name() {
        let mut a = stored("reqs", "counter", json!({"job": "a"}));
        a.value = Some(1.0);
        let mut b = stored("reqs", "counter", json!({"job": "b"}));
        b.value = Some(2.0);

        let text = render_exposition(&[a, b]);
        assert_eq!(text.matches("# HELP reqs").count(), 1);
        assert_eq!(text.matches("# TYPE reqs").count(), 1);
        assert!(text.contains("reqs{job=\"a\"} 1"));
        assert!(text.contains("reqs{job=\"b\"} 2"));
    }

    #[test]
    fn label_values_are_escaped() {
        let mut m = stored("m", "gauge", json!({"path": "a\"b\\c\nd"}));
        m.value = Some(1.0);
        let text = render_exposition(&[m]);
        assert!(text.contains(r#"m{path="a\"b\\c\nd"} 1"#));
    }

    #[test]
    fn histogram_le_label_is_merged_with_attributes() {
        let mut m = stored("lat", "histogram", json!({"job": "api"}));
        m.sum = Some(1.0);
        m.count = Some(2);
        m.bucket_counts = Some(vec![1, 1]);
        m.explicit_bounds = Some(vec![0.5]);

        let text = render_exposition(&[m]);
        assert!(text.contains("lat_bucket{job=\"api\",le=\"0.5\"} 1"));
        assert!(text.contains("lat_bucket{job=\"api\",le=\"+Inf\"} 2"));
        assert!(text.contains("lat_sum{job=\"api\"} 1"));
    }
}
