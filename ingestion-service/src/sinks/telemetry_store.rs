use std::{collections::BTreeMap, sync::Arc, time::Duration};

use futures::StreamExt;
use ledger_client::{
    domain::{TelemetryKey, TelemetryPoint},
    LedgerStore, StoreError, UpsertStats,
};
use time::OffsetDateTime;

use crate::pipeline::{Envelope, PipelineError, PointBatch, Sink};
use crate::status::StatusTracker;

/// Successful points only, one per key; the last point of a key wins.
pub fn prepare_batch(points: &[TelemetryPoint]) -> Vec<TelemetryPoint> {
    let mut latest: BTreeMap<TelemetryKey, &TelemetryPoint> = BTreeMap::new();
    for point in points {
        if !point.success {
            tracing::warn!(
                unit = %point.unit.key,
                mode = %point.energy_mode,
                message = %point.message,
                "skipping failed reading"
            );
            continue;
        }
        latest.insert(point.key(), point);
    }
    latest.into_values().cloned().collect()
}

/// Persists telemetry through a `LedgerStore`, reconnecting and retrying on
/// link failures.
#[derive(Clone)]
pub struct TelemetryStore {
    ledger: Arc<dyn LedgerStore>,
    max_attempts: u32,
    retry_backoff: Duration,
}

impl TelemetryStore {
    pub fn new(ledger: Arc<dyn LedgerStore>, max_attempts: u32, retry_backoff: Duration) -> Self {
        Self {
            ledger,
            max_attempts: max_attempts.max(1),
            retry_backoff,
        }
    }

    pub async fn upsert_batch(&self, points: &[TelemetryPoint]) -> Result<UpsertStats, StoreError> {
        let batch = prepare_batch(points);
        if batch.is_empty() {
            return Ok(UpsertStats::default());
        }

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.ledger.upsert_telemetry(&batch).await {
                Ok(stats) => {
                    metrics::counter!("telemetry_points_persisted_total").increment(stats.total());
                    return Ok(stats);
                }
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    tracing::warn!(
                        error = %e,
                        attempt,
                        points = batch.len(),
                        "telemetry upsert failed, reconnecting and retrying with backoff"
                    );
                    metrics::counter!("telemetry_store_retries_total").increment(1);
                    if let Err(reconnect) = self.ledger.reconnect().await {
                        tracing::warn!(error = %reconnect, "storage reconnect failed");
                    }
                    tokio::time::sleep(self.retry_backoff * attempt).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, attempt, points = batch.len(), "telemetry upsert failed, dropping batch");
                    metrics::counter!("telemetry_store_errors_total").increment(1);
                    return Err(e);
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkTotals {
    pub messages: u64,
    pub failed_messages: u64,
    pub persisted: UpsertStats,
}

/// Pipeline end stage: link state first, then telemetry.
pub struct TelemetryStoreSink {
    store: TelemetryStore,
    status: Option<StatusTracker>,
}

impl TelemetryStoreSink {
    pub fn new(store: TelemetryStore, status: Option<StatusTracker>) -> Self {
        Self { store, status }
    }

    /// Persist one batch. A status-tracking failure is logged and does not
    /// stop the telemetry write.
    pub async fn persist(&self, env: &Envelope<PointBatch>) -> Result<UpsertStats, StoreError> {
        let batch = &env.payload;
        if let Some(status) = &self.status {
            let at = OffsetDateTime::from(env.received_at);
            if let Err(e) = status.observe(&batch.points, at).await {
                tracing::warn!(message_id = %batch.message_id, error = %e, "failed to record unit link state");
            }
        }

        let stats = self.store.upsert_batch(&batch.points).await?;
        tracing::debug!(
            message_id = %batch.message_id,
            created = stats.created,
            updated = stats.updated,
            "persisted message"
        );
        Ok(stats)
    }

    pub async fn drain<S>(&self, mut input: S) -> SinkTotals
    where
        S: futures::Stream<Item = Result<Envelope<PointBatch>, PipelineError>> + Send + Unpin,
    {
        let mut totals = SinkTotals::default();
        while let Some(item) = input.next().await {
            totals.messages += 1;
            let env = match item {
                Ok(env) => env,
                Err(e) => {
                    tracing::warn!(error = %e, "error in upstream pipeline for TelemetryStoreSink");
                    totals.failed_messages += 1;
                    continue;
                }
            };

            match self.persist(&env).await {
                Ok(stats) => totals.persisted += stats,
                Err(e) => {
                    tracing::error!(message_id = %env.payload.message_id, error = %e, "message not persisted");
                    totals.failed_messages += 1;
                }
            }
        }
        totals
    }
}

#[async_trait::async_trait]
impl Sink<PointBatch> for TelemetryStoreSink {
    async fn run<S>(&self, input: S) -> Result<(), PipelineError>
    where
        S: futures::Stream<Item = Result<Envelope<PointBatch>, PipelineError>> + Send + Unpin + 'static,
    {
        let totals = self.drain(input).await;
        tracing::info!(
            messages = totals.messages,
            failed = totals.failed_messages,
            created = totals.persisted.created,
            updated = totals.persisted.updated,
            "telemetry stream ended"
        );
        Ok(())
    }
}
