//! Supervised background tasks of the ingestion service.

use std::{future::Future, sync::Arc, time::Duration};

use ledger_client::LedgerStore;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::status::StatusTracker;

/// A periodic task that can be stopped and awaited.
pub struct PeriodicTask {
    name: &'static str,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    /// Run `tick` every `every`, first after one full interval.
    pub fn start<F, Fut>(name: &'static str, every: Duration, parent: &CancellationToken, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = parent.child_token();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => tick().await,
                }
            }
            tracing::debug!(task = name, "periodic task stopped");
        });
        tracing::info!(task = name, every_secs = every.as_secs(), "periodic task started");

        Self {
            name,
            cancel,
            handle: Some(handle),
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }

    /// Cancel and wait for the current tick to finish.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                tracing::warn!(task = self.name, error = %e, "periodic task ended abnormally");
            }
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// One keepalive round: ping, and reconnect if the link is gone.
pub async fn keepalive_once(ledger: &dyn LedgerStore) {
    match ledger.ping().await {
        Ok(()) => tracing::debug!("storage link alive"),
        Err(e) => {
            tracing::warn!(error = %e, "storage ping failed, reconnecting");
            metrics::counter!("storage_reconnects_total").increment(1);
            match ledger.reconnect().await {
                Ok(()) => tracing::info!("storage link re-established"),
                Err(e) => tracing::error!(error = %e, "storage reconnect failed"),
            }
        }
    }
}

/// Pings the storage link on an interval and reconnects when it is down.
pub fn start_storage_keepalive(
    ledger: Arc<dyn LedgerStore>,
    every: Duration,
    parent: &CancellationToken,
) -> PeriodicTask {
    PeriodicTask::start("storage-keepalive", every, parent, move || {
        let ledger = ledger.clone();
        async move { keepalive_once(ledger.as_ref()).await }
    })
}

/// Flips units that stopped reporting to offline.
pub fn start_status_sweep(
    tracker: StatusTracker,
    stale_after: Duration,
    every: Duration,
    parent: &CancellationToken,
) -> PeriodicTask {
    PeriodicTask::start("status-sweep", every, parent, move || {
        let tracker = tracker.clone();
        async move {
            if let Err(e) = tracker.sweep_stale(stale_after, OffsetDateTime::now_utc()).await {
                tracing::warn!(error = %e, "stale unit sweep failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use ledger_client::{MemoryLedger, StoreError};

    use super::*;

    #[tokio::test]
    async fn failed_ping_triggers_reconnect() {
        let ledger = MemoryLedger::new();
        keepalive_once(&ledger).await;
        assert_eq!(ledger.reconnects().await, 0);

        ledger.inject_faults([StoreError::Transient("gone".into())]).await;
        keepalive_once(&ledger).await;
        assert_eq!(ledger.reconnects().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn task_ticks_until_stopped() {
        let ticks = Arc::new(AtomicU32::new(0));
        let counter = ticks.clone();
        let root = CancellationToken::new();

        let mut task = PeriodicTask::start("test", Duration::from_secs(10), &root, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert!(task.is_running());

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        task.stop().await;
        assert!(!task.is_running());
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn parent_cancellation_stops_children() {
        let root = CancellationToken::new();
        let ledger: Arc<dyn LedgerStore> = Arc::new(MemoryLedger::new());
        let mut task = start_storage_keepalive(ledger, Duration::from_secs(300), &root);

        root.cancel();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!task.is_running());
        task.stop().await;
    }
}
