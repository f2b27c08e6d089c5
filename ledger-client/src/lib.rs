pub mod db;
pub mod domain;

pub use db::{LedgerStore, MemoryLedger, PgLedger, PurgeStats, StoreError, UpsertStats};
