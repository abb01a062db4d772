//! Query evaluator.
//!
//! Resolves parsed queries against the time-series store. Gauge range
//! queries use the store's bucket averages; counter rate/increase run a
//! counter-reset-aware fold over a raw sweep pre-fetched for the whole
//! window span; aggregation groups samples by the `by`-label projection.

use std::collections::BTreeMap;

use serde_json::Value;
use sqlx::PgPool;
use tracing::warn;

use fm_core::MetricType;
use fm_store::models::epoch_secs;
use fm_store::queries;
use fm_store::{BucketRow, RawCounterRow};

use crate::error::ApiError;
use crate::format::{attrs_to_map, MatrixItem, Sample, VectorItem};
use crate::promql::parser::{self, Aggregation, ParsedQuery, QueryFunction};

/// Lookback applied when `rate`/`increase` is used without a range vector.
pub const DEFAULT_LOOKBACK_SECS: f64 = 300.0;

/// Tolerance for float comparisons on tick boundaries.
const EPSILON: f64 = 1e-9;

/// One series during evaluation: its label identity plus `(ts, value)`
/// samples in ascending time order.
#[derive(Debug, Clone, PartialEq)]
struct SeriesData {
    labels: BTreeMap<String, String>,
    samples: Vec<(f64, f64)>,
}

// ============================================================================
// Entry points
// ============================================================================

/// Evaluate an instant query at `ts`.
pub async fn instant_query(
    pool: &PgPool,
    query: &str,
    ts: f64,
) -> Result<Vec<VectorItem>, ApiError> {
    let parsed = parser::parse(query)?;

    // Hard-coded scalars.
    if let Some(scalar) = parsed.scalar_value {
        return Ok(vec![VectorItem {
            metric: BTreeMap::from([("__name__".to_owned(), parsed.raw.clone())]),
            value: Sample::new(ts, scalar),
        }]);
    }

    // `up` is synthesized; target liveness is not tracked.
    if parsed.metric_name.as_deref() == Some("up") {
        let mut metric = parsed.labels.clone();
        metric.insert("__name__".to_owned(), "up".to_owned());
        return Ok(vec![VectorItem {
            metric,
            value: Sample::new(ts, 1.0),
        }]);
    }

    if parsed.function != QueryFunction::Raw {
        // Single window of the lookback size, ending at the queried time.
        let window = lookback_window(&parsed);
        let rows = queries::fetch_counter_raw(
            pool,
            parsed.metric_name.as_deref(),
            &labels_json(&parsed.labels),
            ts - window,
            ts,
        )
        .await?;
        let series = evaluate_windows(
            group_counter_rows(rows),
            ts,
            ts,
            window.max(1.0),
            window,
            parsed.function,
        );
        let series = maybe_aggregate(series, &parsed);
        return Ok(series
            .into_iter()
            .filter(|s| !s.samples.is_empty())
            .map(|s| VectorItem {
                metric: with_effective_name(s.labels, &parsed),
                value: Sample::new(s.samples[0].0, s.samples[0].1),
            })
            .collect());
    }

    // Plain instant: latest observation per matching descriptor, each with
    // its own observed timestamp.
    let rows = queries::fetch_instant(
        pool,
        parsed.metric_name.as_deref(),
        &labels_json(&parsed.labels),
        ts,
    )
    .await?;
    Ok(rows
        .into_iter()
        .map(|row| {
            let mut metric = attrs_to_map(&row.attributes);
            metric.insert("__name__".to_owned(), row.name);
            VectorItem {
                metric,
                value: Sample::new(epoch_secs(row.time), row.value),
            }
        })
        .collect())
}

/// Evaluate a range query over `[start, end]` with the given step.
pub async fn range_query(
    pool: &PgPool,
    query: &str,
    start: f64,
    end: f64,
    step: f64,
) -> Result<Vec<MatrixItem>, ApiError> {
    let parsed = parser::parse(query)?;

    if parsed.scalar_value.is_some() {
        return Err(ApiError::ScalarInRange);
    }

    if parsed.metric_name.as_deref() == Some("up") {
        let mut metric = parsed.labels.clone();
        metric.insert("__name__".to_owned(), "up".to_owned());
        return Ok(vec![MatrixItem {
            metric,
            values: ticks(start, end, step)
                .into_iter()
                .map(|t| Sample::new(t, 1.0))
                .collect(),
        }]);
    }

    let labels = labels_json(&parsed.labels);
    let name = parsed.metric_name.as_deref();
    let Some(kind) = queries::metric_type(pool, name, &labels).await? else {
        return Ok(Vec::new());
    };

    let series = match kind {
        MetricType::Gauge => {
            let rows = queries::fetch_gauge_aggregated(pool, name, &labels, start, end, step).await?;
            group_bucket_rows(rows)
        }
        MetricType::Counter if parsed.function == QueryFunction::Raw => {
            let rows = queries::fetch_counter_raw(pool, name, &labels, start, end).await?;
            last_per_bucket(group_counter_rows(rows), start, end, step)
        }
        MetricType::Counter => {
            let window = lookback_window(&parsed);
            let rows =
                queries::fetch_counter_raw(pool, name, &labels, start - window, end).await?;
            evaluate_windows(
                group_counter_rows(rows),
                start,
                end,
                step,
                window,
                parsed.function,
            )
        }
        // No subset operation consumes histogram samples.
        MetricType::Histogram => Vec::new(),
    };

    let series = maybe_aggregate(series, &parsed);
    Ok(series
        .into_iter()
        .filter(|s| !s.samples.is_empty())
        .map(|s| MatrixItem {
            metric: with_effective_name(s.labels, &parsed),
            values: s
                .samples
                .into_iter()
                .map(|(t, v)| Sample::new(t, v))
                .collect(),
        })
        .collect())
}

// ============================================================================
// Pure evaluation helpers
// ============================================================================

/// Reset-aware total delta over ascending counter values. A drop is a
/// counter reset: the new value counts as the delta since the reset.
fn reset_aware_delta(values: &[f64]) -> f64 {
    let mut total = 0.0;
    for pair in values.windows(2) {
        let d = pair[1] - pair[0];
        total += if d < 0.0 { pair[1] } else { d };
    }
    total
}

/// Evaluation ticks: `start, start+step, …` up to and including `end`.
fn ticks(start: f64, end: f64, step: f64) -> Vec<f64> {
    let mut out = Vec::new();
    let mut i: u64 = 0;
    loop {
        let t = (i as f64).mul_add(step, start);
        if t > end + EPSILON {
            break;
        }
        out.push(t);
        i += 1;
    }
    out
}

/// Per tick `t`, fold the points inside the inclusive window
/// `[t - window, t]`. No points: the tick is skipped; a single point is
/// not enough for a delta and emits `0.0`.
fn evaluate_windows(
    series: Vec<SeriesData>,
    start: f64,
    end: f64,
    step: f64,
    window: f64,
    function: QueryFunction,
) -> Vec<SeriesData> {
    series
        .into_iter()
        .map(|s| {
            let samples = ticks(start, end, step)
                .into_iter()
                .filter_map(|t| {
                    let values: Vec<f64> = s
                        .samples
                        .iter()
                        .filter(|(ts, _)| *ts >= t - window - EPSILON && *ts <= t + EPSILON)
                        .map(|(_, v)| *v)
                        .collect();
                    if values.is_empty() {
                        return None;
                    }
                    if values.len() < 2 {
                        return Some((t, 0.0));
                    }
                    let delta = reset_aware_delta(&values);
                    let value = match function {
                        QueryFunction::Rate => delta / window,
                        _ => delta,
                    };
                    Some((t, value))
                })
                .collect();
            SeriesData {
                labels: s.labels,
                samples,
            }
        })
        .collect()
}

/// Last value inside each `[t, t+step)` bucket; empty buckets are skipped.
fn last_per_bucket(series: Vec<SeriesData>, start: f64, end: f64, step: f64) -> Vec<SeriesData> {
    series
        .into_iter()
        .map(|s| {
            let samples = ticks(start, end, step)
                .into_iter()
                .filter_map(|t| {
                    s.samples
                        .iter()
                        .filter(|(ts, _)| *ts >= t - EPSILON && *ts < t + step - EPSILON)
                        .next_back()
                        .map(|(_, v)| (t, *v))
                })
                .collect();
            SeriesData {
                labels: s.labels,
                samples,
            }
        })
        .collect()
}

/// Group samples by the `by`-label projection and fold each timestamp
/// across the group, one output stream per distinct projected key.
fn aggregate(series: Vec<SeriesData>, agg: Aggregation, by: &[String]) -> Vec<SeriesData> {
    let mut grouped: BTreeMap<Vec<(String, String)>, BTreeMap<i64, Vec<f64>>> = BTreeMap::new();
    for s in series {
        let key: Vec<(String, String)> = by
            .iter()
            .filter_map(|label| s.labels.get(label).map(|v| (label.clone(), v.clone())))
            .collect();
        let buckets = grouped.entry(key).or_default();
        for (ts, value) in s.samples {
            buckets.entry(ts_key(ts)).or_default().push(value);
        }
    }

    grouped
        .into_iter()
        .map(|(key, buckets)| SeriesData {
            labels: key.into_iter().collect(),
            samples: buckets
                .into_iter()
                .map(|(tsk, values)| (tsk as f64 / 1e6, fold(agg, &values)))
                .collect(),
        })
        .collect()
}

fn fold(agg: Aggregation, values: &[f64]) -> f64 {
    match agg {
        Aggregation::Sum => values.iter().sum(),
        Aggregation::Avg => values.iter().sum::<f64>() / values.len() as f64,
        Aggregation::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
        Aggregation::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        Aggregation::Count => values.len() as f64,
    }
}

fn maybe_aggregate(series: Vec<SeriesData>, parsed: &ParsedQuery) -> Vec<SeriesData> {
    match parsed.aggregation {
        Some(agg) => aggregate(series, agg, &parsed.by_labels),
        None => series,
    }
}

/// Timestamps as microsecond keys so they can index ordered maps.
fn ts_key(ts: f64) -> i64 {
    (ts * 1e6).round() as i64
}

/// The `__name__` reported for shaped results wraps the base name with
/// the applied function and aggregation, e.g. `sum(rate(x))`.
pub fn effective_name(parsed: &ParsedQuery) -> String {
    let base = parsed
        .metric_name
        .clone()
        .unwrap_or_else(|| parsed.raw.clone());
    let with_func = match parsed.function {
        QueryFunction::Raw => base,
        QueryFunction::Rate => format!("rate({base})"),
        QueryFunction::Increase => format!("increase({base})"),
    };
    match parsed.aggregation {
        Some(agg) => format!("{agg}({with_func})"),
        None => with_func,
    }
}

fn with_effective_name(
    mut labels: BTreeMap<String, String>,
    parsed: &ParsedQuery,
) -> BTreeMap<String, String> {
    labels.insert("__name__".to_owned(), effective_name(parsed));
    labels
}

fn lookback_window(parsed: &ParsedQuery) -> f64 {
    parsed.range.map_or_else(
        || {
            warn!(
                query = %parsed.raw,
                "rate/increase without a range vector, using default lookback"
            );
            DEFAULT_LOOKBACK_SECS
        },
        |r| r.as_secs(),
    )
}

fn labels_json(labels: &BTreeMap<String, String>) -> Value {
    Value::Object(
        labels
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    )
}

/// Group raw counter rows into per-descriptor series, keeping ascending
/// time order within each series.
fn group_counter_rows(rows: Vec<RawCounterRow>) -> Vec<SeriesData> {
    let mut map: BTreeMap<i64, SeriesData> = BTreeMap::new();
    for row in rows {
        map.entry(row.metric_id)
            .or_insert_with(|| SeriesData {
                labels: attrs_to_map(&row.attributes),
                samples: Vec::new(),
            })
            .samples
            .push((epoch_secs(row.time), row.value));
    }
    map.into_values().collect()
}

/// Group gauge bucket rows into per-descriptor series.
fn group_bucket_rows(rows: Vec<BucketRow>) -> Vec<SeriesData> {
    let mut map: BTreeMap<i64, SeriesData> = BTreeMap::new();
    for row in rows {
        map.entry(row.metric_id)
            .or_insert_with(|| SeriesData {
                labels: attrs_to_map(&row.attributes),
                samples: Vec::new(),
            })
            .samples
            .push((epoch_secs(row.bucket_time), row.value));
    }
    map.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(labels: &[(&str, &str)], samples: &[(f64, f64)]) -> SeriesData {
        SeriesData {
            labels: labels
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect(),
            samples: samples.to_vec(),
        }
    }

    #[test]
    fn monotonic_increase_is_last_minus_first() {
        assert_eq!(reset_aware_delta(&[0.0, 10.0, 25.0, 40.0]), 40.0);
    }

    #[test]
    fn reset_counts_new_value_as_delta() {
        // Deltas: +10, reset to 5 (+5), +10 => 25.
        assert_eq!(reset_aware_delta(&[0.0, 10.0, 5.0, 15.0]), 25.0);
    }

    #[test]
    fn reset_preserves_monotonic_deltas_on_either_side() {
        let without_reset = reset_aware_delta(&[0.0, 10.0, 20.0]);
        let with_reset = reset_aware_delta(&[0.0, 10.0, 2.0, 12.0]);
        assert_eq!(without_reset, 20.0);
        assert_eq!(with_reset, 22.0);
    }

    #[test]
    fn ticks_are_inclusive_of_both_ends() {
        assert_eq!(ticks(0.0, 30.0, 10.0), vec![0.0, 10.0, 20.0, 30.0]);
        assert_eq!(ticks(30.0, 30.0, 30.0), vec![30.0]);
    }

    #[test]
    fn rate_with_reset_matches_reference_scenario() {
        // Raw points (0,0),(10,10),(20,5),(30,15); rate(c[30s])
        // start=end=30 step=30: one window [0,30], delta 25, rate 25/30.
        let input = vec![series(
            &[("job", "a")],
            &[(0.0, 0.0), (10.0, 10.0), (20.0, 5.0), (30.0, 15.0)],
        )];
        let out = evaluate_windows(input, 30.0, 30.0, 30.0, 30.0, QueryFunction::Rate);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].samples.len(), 1);
        let (t, v) = out[0].samples[0];
        assert_eq!(t, 30.0);
        assert!((v - 25.0 / 30.0).abs() < 1e-9);
    }

    #[test]
    fn increase_is_the_raw_delta() {
        let input = vec![series(&[], &[(0.0, 0.0), (30.0, 15.0)])];
        let out = evaluate_windows(input, 30.0, 30.0, 30.0, 30.0, QueryFunction::Increase);
        assert_eq!(out[0].samples, vec![(30.0, 15.0)]);
    }

    #[test]
    fn window_with_one_point_emits_zero_and_empty_window_is_skipped() {
        let input = vec![series(&[], &[(25.0, 7.0)])];
        // Ticks 10 (empty window), 20 (empty), 30 (one point).
        let out = evaluate_windows(input, 10.0, 30.0, 10.0, 10.0, QueryFunction::Rate);
        assert_eq!(out[0].samples, vec![(30.0, 0.0)]);
    }

    #[test]
    fn last_per_bucket_picks_latest_point() {
        let input = vec![series(
            &[],
            &[(0.0, 1.0), (4.0, 2.0), (12.0, 3.0), (30.0, 9.0)],
        )];
        let out = last_per_bucket(input, 0.0, 30.0, 10.0);
        assert_eq!(
            out[0].samples,
            vec![(0.0, 2.0), (10.0, 3.0), (30.0, 9.0)]
        );
    }

    #[test]
    fn aggregate_sums_across_series_by_label() {
        let input = vec![
            series(&[("job", "a"), ("host", "1")], &[(10.0, 1.0), (20.0, 2.0)]),
            series(&[("job", "a"), ("host", "2")], &[(10.0, 3.0)]),
            series(&[("job", "b"), ("host", "3")], &[(10.0, 5.0)]),
        ];
        let out = aggregate(input, Aggregation::Sum, &["job".to_owned()]);
        assert_eq!(out.len(), 2);

        let a = out.iter().find(|s| s.labels["job"] == "a").unwrap();
        assert_eq!(a.samples, vec![(10.0, 4.0), (20.0, 2.0)]);
        let b = out.iter().find(|s| s.labels["job"] == "b").unwrap();
        assert_eq!(b.samples, vec![(10.0, 5.0)]);
    }

    #[test]
    fn aggregation_folds() {
        let values = [4.0, 1.0, 3.0];
        assert_eq!(fold(Aggregation::Sum, &values), 8.0);
        assert_eq!(fold(Aggregation::Avg, &values), 8.0 / 3.0);
        assert_eq!(fold(Aggregation::Min, &values), 1.0);
        assert_eq!(fold(Aggregation::Max, &values), 4.0);
        assert_eq!(fold(Aggregation::Count, &values), 3.0);
    }

    #[test]
    fn effective_name_wraps_function_and_aggregation() {
        let parsed = parser::parse("sum(rate(http_requests_total[5m])) by (a,b)").unwrap();
        assert_eq!(effective_name(&parsed), "sum(rate(http_requests_total))");

        let plain = parser::parse("mem").unwrap();
        assert_eq!(effective_name(&plain), "mem");

        let increase = parser::parse("increase(c[1h])").unwrap();
        assert_eq!(effective_name(&increase), "increase(c)");
    }
}
