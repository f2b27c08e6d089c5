//! Manual repairs of the ledger, run by `ledger_repair`.

use std::sync::Arc;

use ledger_client::{LedgerStore, PurgeStats, StoreError};
use time::{Date, Duration};

pub struct LedgerRepair {
    ledger: Arc<dyn LedgerStore>,
}

impl LedgerRepair {
    pub fn new(ledger: Arc<dyn LedgerStore>) -> Self {
        Self { ledger }
    }

    /// Close every still-open stub of `day` with zero usage.
    pub async fn close_silent_day(&self, day: Date) -> Result<u64, StoreError> {
        let closed = self.ledger.close_silent_days(day).await?;
        tracing::info!(%day, closed, "closed silent day");
        Ok(closed)
    }

    /// Fill gaps in `to` with the readings of `from`, e.g. after a collector
    /// outage. Keys that already have a reading on `to` are left as is.
    pub async fn copy_day(&self, from: Date, to: Date) -> Result<u64, StoreError> {
        let copied = self.ledger.copy_telemetry(from, to).await?;
        tracing::info!(%from, %to, copied, "copied readings between days");
        Ok(copied)
    }

    /// Delete telemetry and daily rows older than `keep_days` before `today`.
    pub async fn purge_older_than(&self, today: Date, keep_days: u32) -> Result<PurgeStats, StoreError> {
        let cutoff = today
            .checked_sub(Duration::days(i64::from(keep_days)))
            .unwrap_or(Date::MIN);
        let purged = self.ledger.purge_before(cutoff).await?;
        tracing::info!(%cutoff, telemetry = purged.telemetry, daily = purged.daily, "purged old ledger rows");
        Ok(purged)
    }
}
