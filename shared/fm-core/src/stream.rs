//! Durable-log client over a Redis stream.
//!
//! The collector appends JSON-serialized metric points through
//! [`StreamProducer`]; the aggregator consumes them through
//! [`StreamConsumer`] under a consumer group with pending-entry recovery.
//! Every entry is a single-field map `{data: <json>}`.

use std::collections::{HashMap, VecDeque};

use fred::error::{Error as RedisError, ErrorKind as RedisErrorKind};
use fred::prelude::*;
use fred::types::streams::{XPendingArgs, XReadResponse, XID};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::RedisSettings;
use crate::metric::MetricPoint;

/// Stream-layer errors.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("redis error: {0}")]
    Redis(#[from] RedisError),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Connect a Redis client for the configured server.
pub async fn connect(settings: &RedisSettings) -> Result<Client, StreamError> {
    let config = Config::from_url(&settings.url())?;
    let client = Client::new(config, None, None, None);
    client.connect();
    client.wait_for_connect().await?;

    info!(
        host = %settings.host,
        port = settings.port,
        db = settings.db,
        "Connected to Redis"
    );
    Ok(client)
}

/// Whether an error should be absorbed by the overflow buffer rather than
/// surfaced to the caller.
fn is_transport_error(err: &RedisError) -> bool {
    matches!(
        err.kind(),
        RedisErrorKind::IO | RedisErrorKind::Timeout | RedisErrorKind::Canceled
    )
}

// ============================================================================
// Producer
// ============================================================================

/// Appends metric points to the stream, with an in-memory FIFO overflow
/// buffer for the window where Redis is unreachable.
///
/// The buffer mutex is held across the whole drain-and-send sequence, so
/// points accepted on one connection reach the stream in receive order as
/// long as the buffer does not overflow.
pub struct StreamProducer {
    client: Client,
    stream: String,
    buffer: Mutex<VecDeque<String>>,
    buffer_size: usize,
}

impl StreamProducer {
    #[must_use]
    pub fn new(client: Client, stream: impl Into<String>, buffer_size: usize) -> Self {
        Self {
            client,
            stream: stream.into(),
            buffer: Mutex::new(VecDeque::new()),
            buffer_size,
        }
    }

    async fn append(&self, payload: &str) -> Result<(), RedisError> {
        let _: String = self
            .client
            .xadd(&self.stream, false, None, "*", vec![("data", payload)])
            .await?;
        Ok(())
    }

    /// Serialize one point (with `trace_id` merged into the payload) and
    /// send it, draining any previously buffered entries first.
    ///
    /// Connection and timeout errors are absorbed: the entry that failed to
    /// send is kept (buffered entries stay at the head, the new entry goes
    /// to the tail) unless the buffer is full, in which case the new entry
    /// is dropped and logged.
    pub async fn send(
        &self,
        point: &MetricPoint,
        trace_id: Option<String>,
    ) -> Result<(), StreamError> {
        let trace_id = trace_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut payload = serde_json::to_value(point)?;
        payload["trace_id"] = serde_json::Value::String(trace_id.clone());
        let data = payload.to_string();

        let mut buffer = self.buffer.lock().await;

        // Drain buffered entries in FIFO order. A failed entry is left at
        // the head so the order survives the next reconnect.
        while let Some(front) = buffer.front() {
            match self.append(front).await {
                Ok(()) => {
                    buffer.pop_front();
                }
                Err(e) if is_transport_error(&e) => {
                    warn!(
                        trace_id = %trace_id,
                        error = %e,
                        buffer_len = buffer.len(),
                        "Redis unreachable while draining buffer"
                    );
                    Self::buffer_or_drop(&mut buffer, self.buffer_size, data, &trace_id);
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }

        match self.append(&data).await {
            Ok(()) => {
                debug!(trace_id = %trace_id, stream = %self.stream, "Point sent to stream");
                Ok(())
            }
            Err(e) if is_transport_error(&e) => {
                warn!(
                    trace_id = %trace_id,
                    error = %e,
                    buffer_len = buffer.len(),
                    buffer_size_limit = self.buffer_size,
                    "Redis connection error, buffering point"
                );
                Self::buffer_or_drop(&mut buffer, self.buffer_size, data, &trace_id);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn buffer_or_drop(
        buffer: &mut VecDeque<String>,
        capacity: usize,
        data: String,
        trace_id: &str,
    ) {
        if buffer.len() < capacity {
            buffer.push_back(data);
            debug!(trace_id = %trace_id, buffer_len = buffer.len(), "Point added to buffer");
        } else {
            warn!(trace_id = %trace_id, "Buffer overflow, dropping point");
        }
    }

    /// Number of points currently waiting for the stream to come back.
    pub async fn buffered(&self) -> usize {
        self.buffer.lock().await.len()
    }
}

// ============================================================================
// Consumer
// ============================================================================

/// Consumer-group reader providing at-least-once delivery: entries are
/// acked only by the caller after a successful insert, and entries left
/// pending by a dead consumer are reclaimed through [`Self::claim_idle`].
pub struct StreamConsumer {
    client: Client,
    stream: String,
    group: String,
    consumer: String,
}

impl StreamConsumer {
    #[must_use]
    pub fn new(
        client: Client,
        stream: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Self {
        Self {
            client,
            stream: stream.into(),
            group: group.into(),
            consumer: consumer.into(),
        }
    }

    /// Idempotently create the consumer group, reading from the beginning
    /// of the stream and auto-creating it. "Group already exists" is not
    /// an error.
    pub async fn ensure_group(&self) -> Result<(), StreamError> {
        match self
            .client
            .xgroup_create::<(), _, _, _>(&self.stream, self.group.as_str(), XID::Manual("0".into()), true)
            .await
        {
            Ok(()) => {
                info!(group = %self.group, stream = %self.stream, "Created consumer group");
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(group = %self.group, "Consumer group already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read up to `count` new entries addressed to this consumer, blocking
    /// up to `block_ms` for data. Entries whose payload does not parse are
    /// logged and skipped without an ack, so they stay pending and will be
    /// retried through [`Self::claim_idle`].
    pub async fn read(
        &self,
        count: u64,
        block_ms: u64,
    ) -> Result<Vec<(String, MetricPoint)>, StreamError> {
        let response: Option<XReadResponse<String, String, String, String>> = self
            .client
            .xreadgroup(
                self.group.as_str(),
                self.consumer.as_str(),
                Some(count),
                Some(block_ms),
                false,
                self.stream.as_str(),
                ">",
            )
            .await?;

        let mut batch = Vec::new();
        for (_stream, entries) in response.unwrap_or_default() {
            for (entry_id, fields) in entries {
                if let Some(point) = Self::parse_entry(&entry_id, fields) {
                    batch.push((entry_id, point));
                }
            }
        }
        Ok(batch)
    }

    /// Mark one entry delivered.
    pub async fn ack(&self, entry_id: &str) -> Result<(), StreamError> {
        let _: u64 = self
            .client
            .xack(&self.stream, self.group.as_str(), entry_id)
            .await?;
        Ok(())
    }

    /// Claim up to `count` entries pending for any consumer of the group
    /// for at least `min_idle_ms`, transferring ownership to this consumer.
    /// Claimed entries with an empty payload are acked and skipped.
    pub async fn claim_idle(
        &self,
        min_idle_ms: u64,
        count: u64,
    ) -> Result<Vec<(String, MetricPoint)>, StreamError> {
        let args = XPendingArgs {
            idle: Some(min_idle_ms),
            start: Some(XID::Manual("-".into())),
            end: Some(XID::Manual("+".into())),
            count: Some(count),
            consumer: None,
        };
        let pending: Vec<(String, String, u64, u64)> = self
            .client
            .xpending(&self.stream, self.group.as_str(), args)
            .await?;

        if pending.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<XID> = pending
            .into_iter()
            .map(|(id, ..)| XID::Manual(id.into()))
            .collect();

        let claimed: Vec<(String, HashMap<String, String>)> = self
            .client
            .xclaim(
                &self.stream,
                self.group.as_str(),
                self.consumer.as_str(),
                min_idle_ms,
                ids,
                None,
                None,
                None,
                false,
                false,
            )
            .await?;

        let mut batch = Vec::new();
        for (entry_id, fields) in claimed {
            let empty = fields.get("data").is_none_or(|d| d.is_empty());
            if empty {
                warn!(entry_id = %entry_id, "Empty 'data' in claimed entry, acking");
                self.ack(&entry_id).await?;
                continue;
            }
            if let Some(point) = Self::parse_entry(&entry_id, fields) {
                batch.push((entry_id, point));
            }
        }
        Ok(batch)
    }

    fn parse_entry(entry_id: &str, mut fields: HashMap<String, String>) -> Option<MetricPoint> {
        let data = match fields.remove("data") {
            Some(data) if !data.is_empty() => data,
            _ => {
                warn!(entry_id = %entry_id, "Empty 'data' field in entry");
                return None;
            }
        };
        match serde_json::from_str(&data) {
            Ok(point) => Some(point),
            Err(e) => {
                error!(entry_id = %entry_id, error = %e, "Failed to parse entry payload");
                None
            }
        }
    }
}
