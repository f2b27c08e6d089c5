//! Daily and monthly usage ledgers built from stored counter readings.

pub mod daily;
pub mod monthly;

use std::collections::HashMap;

use anyhow::Context;
use ledger_client::domain::Unit;
use serde::Serialize;
use time::{macros::format_description, Date, OffsetDateTime, UtcOffset};

pub use daily::DailyRollup;
pub use monthly::MonthlyRollup;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Completed,
    /// Nothing to aggregate; not an error.
    Skipped,
    Failed,
}

/// Result of one rollup run, printed by the rollup binaries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RollupStats {
    pub status: RunStatus,
    pub processed: u64,
    pub created: u64,
    pub updated: u64,
    /// Next-day stubs created or refreshed.
    pub next_day: u64,
    /// Keys or groups that could not be written.
    pub skipped: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RollupStats {
    pub fn skipped_run() -> Self {
        Self {
            status: RunStatus::Skipped,
            ..Self::default()
        }
    }

    pub fn failed(error: impl ToString) -> Self {
        Self {
            status: RunStatus::Failed,
            error: Some(error.to_string()),
            ..Self::default()
        }
    }
}

/// `YYYY-MM-DD` as given on a command line.
pub fn parse_day(raw: &str) -> anyhow::Result<Date> {
    Date::parse(raw.trim(), format_description!("[year]-[month]-[day]"))
        .with_context(|| format!("invalid day '{raw}', expected YYYY-MM-DD"))
}

/// Today on the site's calendar.
pub fn local_today(offset: UtcOffset) -> Date {
    OffsetDateTime::now_utc().to_offset(offset).date()
}

/// Parsed units by key, owned by a single rollup run.
#[derive(Debug, Default)]
pub struct UnitCache {
    units: HashMap<String, Unit>,
}

impl UnitCache {
    pub fn unit(&mut self, key: &str) -> Unit {
        self.units
            .entry(key.to_string())
            .or_insert_with(|| Unit::parse(key))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_parses_each_key_once() {
        let mut cache = UnitCache::default();
        let a = cache.unit("9-1-31-3104");
        let b = cache.unit("9-1-31-3104");
        assert_eq!(a, b);
        assert_eq!(a.room, "3104");
        assert_eq!(a.floor.as_deref(), Some("31"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn command_line_days() {
        assert_eq!(parse_day("2025-01-10").unwrap(), time::macros::date!(2025 - 01 - 10));
        assert!(parse_day("2025-1-10x").is_err());
    }

    #[test]
    fn stats_serialize_with_lowercase_status() {
        let json = serde_json::to_value(RollupStats::skipped_run()).unwrap();
        assert_eq!(json["status"], "skipped");
        assert_eq!(json["processed"], 0);
        assert!(json.get("error").is_none());
    }
}
