//! Store queries: the write path and the read operations behind the
//! Prometheus-compatible API.
//!
//! All functions take a `&PgPool` and run plain runtime queries (no
//! compile-time `DATABASE_URL` required). Label matchers arrive as a JSON
//! object and are applied with the JSONB containment operator
//! (`attributes @> $labels`).

use std::collections::BTreeSet;
use std::str::FromStr;

use serde_json::Value;
use sqlx::{PgConnection, PgPool};
use tracing::debug;

use fm_core::{MetricPoint, MetricType};

use crate::models::{BucketRow, InstantRow, RawCounterRow, SeriesRow, StoredMetric};

/// Store-level errors. Invalid points are data-validity failures raised
/// before any row is written; callers treat them like any other failed
/// insert (no ack, the entry stays pending).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid metric point: {0}")]
    InvalidPoint(String),
    #[error("descriptor upsert resolved no id")]
    DescriptorResolution,
    #[error("unknown metric type in descriptor: {0}")]
    UnknownType(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

// ============================================================================
// Write path
// ============================================================================

/// Insert one metric point: resolve its descriptor id by identity, then
/// append one sample row. Both statements run on the same checked-out
/// connection; each is individually atomic, and descriptor identity makes
/// the pair idempotent under redelivery.
pub async fn insert_metric(pool: &PgPool, point: &MetricPoint) -> Result<(), StoreError> {
    let mut conn = pool.acquire().await?;
    let metric_id = get_or_create_metric_id(&mut conn, point).await?;
    let ts = point.timestamp_secs();

    match point.metric_type {
        MetricType::Counter | MetricType::Gauge => {
            let value = point.value.ok_or_else(|| {
                StoreError::InvalidPoint(format!(
                    "{} metric must have 'value'",
                    point.metric_type
                ))
            })?;
            sqlx::query(
                "INSERT INTO metrics_values (time, metric_id, value) \
                 VALUES (to_timestamp($1), $2, $3)",
            )
            .bind(ts)
            .bind(metric_id)
            .bind(value)
            .execute(&mut *conn)
            .await?;
        }
        MetricType::Histogram => {
            let (Some(sum), Some(count), Some(bucket_counts)) =
                (point.sum, point.count, point.bucket_counts.as_ref())
            else {
                return Err(StoreError::InvalidPoint(
                    "histogram metric must have 'sum', 'count', and 'bucket_counts'".into(),
                ));
            };
            let bucket_counts: Vec<i64> = bucket_counts.iter().map(|&c| c as i64).collect();
            sqlx::query(
                "INSERT INTO metrics_histograms (time, metric_id, sum, count, bucket_counts) \
                 VALUES (to_timestamp($1), $2, $3, $4, $5)",
            )
            .bind(ts)
            .bind(metric_id)
            .bind(sum)
            .bind(count as i64)
            .bind(&bucket_counts)
            .execute(&mut *conn)
            .await?;
        }
    }

    debug!(metric = %point.name, kind = %point.metric_type, "Metric inserted");
    Ok(())
}

/// Upsert-by-identity for descriptors. The `INSERT … ON CONFLICT DO
/// NOTHING RETURNING id` either returns the fresh id or nothing; in the
/// latter case the existing row is selected with the same three-key match.
/// Safe under concurrent inserts: both branches return a stable id.
async fn get_or_create_metric_id(
    conn: &mut PgConnection,
    point: &MetricPoint,
) -> Result<i64, StoreError> {
    // Bucket layout is part of a histogram's identity; other kinds store
    // NULL bounds that compare equal to the empty array.
    let bounds = match point.metric_type {
        MetricType::Histogram => point.explicit_bounds.as_deref(),
        _ => None,
    };
    let attributes = Value::Object(
        point
            .attributes
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    );

    let inserted: Option<(i64,)> = sqlx::query_as(
        "INSERT INTO metrics_info (name, description, unit, type, attributes, explicit_bounds) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         ON CONFLICT (name, attributes, COALESCE(explicit_bounds, '{}'::DOUBLE PRECISION[])) \
         DO NOTHING \
         RETURNING id",
    )
    .bind(&point.name)
    .bind(&point.description)
    .bind(&point.unit)
    .bind(point.metric_type.as_str())
    .bind(&attributes)
    .bind(bounds)
    .fetch_optional(&mut *conn)
    .await?;

    if let Some((id,)) = inserted {
        return Ok(id);
    }

    let existing: Option<(i64,)> = sqlx::query_as(
        "SELECT id FROM metrics_info \
         WHERE name = $1 \
           AND attributes = $2 \
           AND COALESCE(explicit_bounds, '{}'::DOUBLE PRECISION[]) = \
               COALESCE($3, '{}'::DOUBLE PRECISION[])",
    )
    .bind(&point.name)
    .bind(&attributes)
    .bind(bounds)
    .fetch_optional(&mut *conn)
    .await?;

    existing
        .map(|(id,)| id)
        .ok_or(StoreError::DescriptorResolution)
}

// ============================================================================
// Read path
// ============================================================================

/// Distinct `(name, attributes)` pairs for the given metric names.
pub async fn fetch_series(pool: &PgPool, matches: &[String]) -> sqlx::Result<Vec<SeriesRow>> {
    sqlx::query_as::<_, SeriesRow>(
        "SELECT DISTINCT name, attributes FROM metrics_info \
         WHERE name = ANY($1) \
         ORDER BY name",
    )
    .bind(matches)
    .fetch_all(pool)
    .await
}

/// Latest counter/gauge sample at or before `ts` for every descriptor
/// matching the name and label set.
pub async fn fetch_instant(
    pool: &PgPool,
    name: Option<&str>,
    labels: &Value,
    ts: f64,
) -> sqlx::Result<Vec<InstantRow>> {
    sqlx::query_as::<_, InstantRow>(
        "SELECT DISTINCT ON (i.id) i.name, i.attributes, v.value, v.time \
         FROM metrics_info i \
         JOIN metrics_values v ON v.metric_id = i.id \
         WHERE ($1::text IS NULL OR i.name = $1) \
           AND i.attributes @> $2 \
           AND i.type IN ('counter', 'gauge') \
           AND v.time <= to_timestamp($3) \
         ORDER BY i.id, v.time DESC",
    )
    .bind(name)
    .bind(labels)
    .bind(ts)
    .fetch_all(pool)
    .await
}

/// Per step-sized bucket average of gauge values over `[start, end]`.
/// Buckets are aligned to the epoch (`floor(epoch / step) * step`).
pub async fn fetch_gauge_aggregated(
    pool: &PgPool,
    name: Option<&str>,
    labels: &Value,
    start: f64,
    end: f64,
    step_secs: f64,
) -> sqlx::Result<Vec<BucketRow>> {
    sqlx::query_as::<_, BucketRow>(
        "SELECT i.id AS metric_id, i.attributes, \
                to_timestamp(floor(extract(epoch FROM v.time) / $5) * $5) AS bucket_time, \
                AVG(v.value) AS value \
         FROM metrics_info i \
         JOIN metrics_values v ON v.metric_id = i.id \
         WHERE ($1::text IS NULL OR i.name = $1) \
           AND i.attributes @> $2 \
           AND i.type = 'gauge' \
           AND v.time >= to_timestamp($3) \
           AND v.time <= to_timestamp($4) \
         GROUP BY i.id, i.attributes, bucket_time \
         ORDER BY i.id, bucket_time",
    )
    .bind(name)
    .bind(labels)
    .bind(start)
    .bind(end)
    .bind(step_secs)
    .fetch_all(pool)
    .await
}

/// Ascending raw `(time, value)` sweep for counter series; feeds the
/// reset-aware rate/increase evaluator.
pub async fn fetch_counter_raw(
    pool: &PgPool,
    name: Option<&str>,
    labels: &Value,
    start: f64,
    end: f64,
) -> sqlx::Result<Vec<RawCounterRow>> {
    sqlx::query_as::<_, RawCounterRow>(
        "SELECT i.id AS metric_id, i.attributes, v.time, v.value \
         FROM metrics_info i \
         JOIN metrics_values v ON v.metric_id = i.id \
         WHERE ($1::text IS NULL OR i.name = $1) \
           AND i.attributes @> $2 \
           AND i.type = 'counter' \
           AND v.time >= to_timestamp($3) \
           AND v.time <= to_timestamp($4) \
         ORDER BY i.id, v.time",
    )
    .bind(name)
    .bind(labels)
    .bind(start)
    .bind(end)
    .fetch_all(pool)
    .await
}

/// Union of `__name__` and every attribute key present in any descriptor,
/// sorted ascending.
pub async fn fetch_label_names(pool: &PgPool) -> sqlx::Result<Vec<String>> {
    let keys: Vec<(String,)> = sqlx::query_as(
        "SELECT DISTINCT k FROM metrics_info, LATERAL jsonb_object_keys(attributes) AS k",
    )
    .fetch_all(pool)
    .await?;

    let mut names: BTreeSet<String> = keys.into_iter().map(|(k,)| k).collect();
    names.insert("__name__".into());
    Ok(names.into_iter().collect())
}

/// Distinct values observed for one label, sorted ascending. `__name__`
/// yields the distinct metric names.
pub async fn fetch_label_values(pool: &PgPool, label: &str) -> sqlx::Result<Vec<String>> {
    let rows: Vec<(String,)> = if label == "__name__" {
        sqlx::query_as("SELECT DISTINCT name FROM metrics_info ORDER BY name")
            .fetch_all(pool)
            .await?
    } else {
        sqlx::query_as(
            "SELECT DISTINCT attributes->>$1 AS value FROM metrics_info \
             WHERE attributes ? $1 \
             ORDER BY value",
        )
        .bind(label)
        .fetch_all(pool)
        .await?
    };
    Ok(rows.into_iter().map(|(v,)| v).collect())
}

/// Peek at the stored type of the first descriptor matching name+labels,
/// used to dispatch range queries.
pub async fn metric_type(
    pool: &PgPool,
    name: Option<&str>,
    labels: &Value,
) -> Result<Option<MetricType>, StoreError> {
    let row: Option<(String,)> = sqlx::query_as(
        "SELECT type FROM metrics_info \
         WHERE ($1::text IS NULL OR name = $1) AND attributes @> $2 \
         LIMIT 1",
    )
    .bind(name)
    .bind(labels)
    .fetch_optional(pool)
    .await?;

    row.map(|(t,)| MetricType::from_str(&t).map_err(StoreError::UnknownType))
        .transpose()
}

/// Recent value and histogram samples joined with their descriptors, most
/// recent first; feeds the `/metrics` text exposition.
pub async fn fetch_recent(pool: &PgPool, lookback_minutes: i32) -> sqlx::Result<Vec<StoredMetric>> {
    let mut metrics = sqlx::query_as::<_, StoredMetric>(
        "SELECT i.name, i.description, i.unit, i.type, i.attributes, v.time, \
                v.value, \
                NULL::DOUBLE PRECISION AS sum, \
                NULL::BIGINT AS count, \
                NULL::BIGINT[] AS bucket_counts, \
                NULL::DOUBLE PRECISION[] AS explicit_bounds \
         FROM metrics_info i \
         JOIN metrics_values v ON i.id = v.metric_id \
         WHERE v.time >= NOW() - make_interval(mins => $1) \
         ORDER BY v.time DESC",
    )
    .bind(lookback_minutes)
    .fetch_all(pool)
    .await?;

    let histograms = sqlx::query_as::<_, StoredMetric>(
        "SELECT i.name, i.description, i.unit, i.type, i.attributes, h.time, \
                NULL::DOUBLE PRECISION AS value, \
                h.sum, h.count, h.bucket_counts, i.explicit_bounds \
         FROM metrics_info i \
         JOIN metrics_histograms h ON i.id = h.metric_id \
         WHERE h.time >= NOW() - make_interval(mins => $1) \
         ORDER BY h.time DESC",
    )
    .bind(lookback_minutes)
    .fetch_all(pool)
    .await?;

    metrics.extend(histograms);
    Ok(metrics)
}
