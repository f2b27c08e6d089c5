//! Storage layer for the usage ledger.
//!
//! `LedgerStore` is the seam every writer and rollup goes through. Each
//! mutating call is one transaction: either the whole slice is applied or
//! nothing is.

mod memory;
mod pg;

pub use memory::MemoryLedger;
pub use pg::PgLedger;

use time::{Date, OffsetDateTime};

use crate::domain::{
    DailyUsageRecord, LinkState, MonthlyUsageRecord, StatusChangeEvent, TelemetryPoint, Unit,
};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The storage link dropped or timed out; the same call may succeed after
    /// a reconnect.
    #[error("storage link unavailable: {0}")]
    Transient(String),
    /// The statement itself was rejected; retrying will not help.
    #[error("storage operation rejected: {0}")]
    Fatal(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        let transient = match &e {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => true,
            // Class 08 is "connection exception"; 57P0x covers admin/crash shutdowns.
            sqlx::Error::Database(db) => db
                .code()
                .map(|code| code.starts_with("08") || code.starts_with("57P0"))
                .unwrap_or(false),
            _ => false,
        };

        if transient {
            Self::Transient(e.to_string())
        } else {
            Self::Fatal(e.to_string())
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertStats {
    pub created: u64,
    pub updated: u64,
}

impl UpsertStats {
    pub fn total(&self) -> u64 {
        self.created + self.updated
    }
}

impl std::ops::AddAssign for UpsertStats {
    fn add_assign(&mut self, rhs: Self) {
        self.created += rhs.created;
        self.updated += rhs.updated;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeStats {
    pub telemetry: u64,
    pub daily: u64,
}

#[async_trait::async_trait]
pub trait LedgerStore: Send + Sync {
    /// Insert or overwrite telemetry rows keyed by (unit, mode, captured day).
    ///
    /// The slice must not contain the same key twice.
    async fn upsert_telemetry(&self, points: &[TelemetryPoint]) -> Result<UpsertStats, StoreError>;

    /// Successful telemetry rows captured on `day`, one per key.
    async fn telemetry_for_day(&self, day: Date) -> Result<Vec<TelemetryPoint>, StoreError>;

    /// Copy every successful reading of `from` onto `to`, keeping rows `to`
    /// already has. Returns the number of rows written.
    async fn copy_telemetry(&self, from: Date, to: Date) -> Result<u64, StoreError>;

    /// Daily rows with `start <= day < end`, ordered by unit, mode and day.
    async fn daily_between(&self, start: Date, end: Date) -> Result<Vec<DailyUsageRecord>, StoreError>;

    async fn upsert_daily(&self, records: &[DailyUsageRecord]) -> Result<UpsertStats, StoreError>;

    /// Close every stub of `day` with zero usage. Returns the number closed.
    async fn close_silent_days(&self, day: Date) -> Result<u64, StoreError>;

    async fn upsert_monthly(&self, record: &MonthlyUsageRecord) -> Result<UpsertStats, StoreError>;

    /// Delete telemetry and daily rows older than `day`.
    async fn purge_before(&self, day: Date) -> Result<PurgeStats, StoreError>;

    /// Record the latest link state of a unit. Returns the history row when
    /// the state changed (or the unit was seen for the first time).
    async fn record_link_state(
        &self,
        unit: &Unit,
        state: LinkState,
        at: OffsetDateTime,
    ) -> Result<Option<StatusChangeEvent>, StoreError>;

    /// Flip units that have been online but silent since `cutoff` to offline.
    async fn mark_stale_offline(
        &self,
        cutoff: OffsetDateTime,
        at: OffsetDateTime,
    ) -> Result<Vec<StatusChangeEvent>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;

    /// Drop the current storage link and open a fresh one.
    async fn reconnect(&self) -> Result<(), StoreError>;
}
