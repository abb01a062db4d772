//! Aggregation worker.
//!
//! Long-running loop that reads metric points from the consumer group,
//! persists each one, and acks only after a successful insert. Empty reads
//! trigger a pending-entry recovery pass. At-least-once delivery follows
//! from ack-after-insert, idle reclaim, and the idempotent descriptor
//! upsert in the store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tracing::{debug, error, info, warn};

use fm_core::config::ConsumerSettings;
use fm_core::{MetricPoint, StreamConsumer, StreamError};
use fm_store::queries;

pub struct AggregationWorker {
    consumer: StreamConsumer,
    pool: PgPool,
    settings: ConsumerSettings,
    stop: Arc<AtomicBool>,
}

impl AggregationWorker {
    #[must_use]
    pub fn new(
        consumer: StreamConsumer,
        pool: PgPool,
        settings: ConsumerSettings,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            consumer,
            pool,
            settings,
            stop,
        }
    }

    /// Run until the stop flag is raised. The flag is checked at iteration
    /// boundaries, so one blocking read (up to `block_ms`) may still be in
    /// flight when shutdown begins.
    pub async fn run(self) {
        let mut group_ready = false;
        while !self.stop.load(Ordering::Relaxed) {
            if let Err(e) = self.tick(&mut group_ready).await {
                error!(error = %e, "Unexpected error in worker loop");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
        info!("Aggregation worker stopped");
    }

    async fn tick(&self, group_ready: &mut bool) -> Result<(), StreamError> {
        if !*group_ready {
            self.consumer.ensure_group().await?;
            *group_ready = true;
            info!("Aggregation worker started");
        }

        let batch = self
            .consumer
            .read(self.settings.batch_size, self.settings.block_ms)
            .await?;

        if batch.is_empty() {
            let claimed = self
                .consumer
                .claim_idle(self.settings.pending_idle_ms, self.settings.batch_size)
                .await?;
            self.process(claimed, true).await;
        } else {
            self.process(batch, false).await;
        }
        Ok(())
    }

    /// Insert and ack one entry at a time. Failed inserts are not acked;
    /// the entry stays pending and the next reclaim cycle retries it.
    async fn process(&self, entries: Vec<(String, MetricPoint)>, recovered: bool) {
        for (entry_id, point) in entries {
            match queries::insert_metric(&self.pool, &point).await {
                Ok(()) => match self.consumer.ack(&entry_id).await {
                    Ok(()) => {
                        debug!(
                            entry_id = %entry_id,
                            metric = %point.name,
                            recovered,
                            "Metric processed"
                        );
                    }
                    Err(e) => {
                        warn!(
                            entry_id = %entry_id,
                            error = %e,
                            "Insert succeeded but ack failed; entry will be redelivered"
                        );
                    }
                },
                Err(e) => {
                    error!(
                        entry_id = %entry_id,
                        metric = %point.name,
                        error = %e,
                        "Failed to persist metric; entry stays pending"
                    );
                }
            }
        }
    }
}
