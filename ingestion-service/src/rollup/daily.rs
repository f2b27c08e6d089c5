use std::{collections::HashMap, sync::Arc};

use ledger_client::{
    domain::{DailyUsageRecord, TelemetryKey, TelemetryPoint},
    LedgerStore,
};
use time::Date;

use super::{RollupStats, RunStatus, UnitCache};

/// Per-day usage ledger maintained from the day's latest counter readings.
///
/// For every (unit, mode) read on `day`:
/// - no row yet: open one with zero usage at the reading.
/// - a stub or open row: close it at the reading; `initial_energy` is kept.
/// - the next day's row is seeded (or re-seeded while still a stub) with the
///   reading as its starting value.
///
/// Not safe to run concurrently for the same day.
pub struct DailyRollup {
    ledger: Arc<dyn LedgerStore>,
    batch_size: usize,
}

/// What applying one reading does to the ledger.
struct Applied {
    today: DailyUsageRecord,
    created: bool,
    next_day: Option<DailyUsageRecord>,
}

fn apply_reading(
    point: &TelemetryPoint,
    existing: &HashMap<TelemetryKey, DailyUsageRecord>,
    units: &mut UnitCache,
) -> Applied {
    let unit = units.unit(&point.unit.key);
    let value = point.raw_counter_value;

    let (today, created) = match existing.get(&point.key()) {
        Some(row) => {
            let mut row = row.clone();
            row.close_with(value);
            (row, false)
        }
        None => (
            DailyUsageRecord::opened(unit.clone(), point.energy_mode, point.captured_day, value),
            true,
        ),
    };

    let next_day = point.captured_day.next_day().and_then(|tomorrow| {
        let key = TelemetryKey { day: tomorrow, ..point.key() };
        match existing.get(&key) {
            None => Some(DailyUsageRecord::stub(unit, point.energy_mode, tomorrow, value)),
            Some(row) if row.is_stub() && row.initial_energy != value => Some(DailyUsageRecord {
                initial_energy: value,
                ..row.clone()
            }),
            Some(_) => None,
        }
    });

    Applied { today, created, next_day }
}

impl DailyRollup {
    pub fn new(ledger: Arc<dyn LedgerStore>, batch_size: usize) -> Self {
        Self {
            ledger,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn rollup_day(&self, day: Date) -> RollupStats {
        let points = match self.ledger.telemetry_for_day(day).await {
            Ok(points) => points,
            Err(e) => {
                tracing::error!(%day, error = %e, "failed to load telemetry for daily rollup");
                return RollupStats::failed(e);
            }
        };
        if points.is_empty() {
            tracing::info!(%day, "no readings for day, nothing to roll up");
            return RollupStats::skipped_run();
        }

        let window_end = day.next_day().and_then(Date::next_day).unwrap_or(Date::MAX);
        let existing: HashMap<TelemetryKey, DailyUsageRecord> = match self.ledger.daily_between(day, window_end).await {
            Ok(rows) => rows.into_iter().map(|row| (row.key(), row)).collect(),
            Err(e) => {
                tracing::error!(%day, error = %e, "failed to load daily ledger rows");
                return RollupStats::failed(e);
            }
        };

        let mut units = UnitCache::default();
        let mut stats = RollupStats::default();

        for chunk in points.chunks(self.batch_size) {
            let mut records = Vec::with_capacity(chunk.len() * 2);
            let mut created = 0;
            let mut next_day = 0;
            for point in chunk {
                let applied = apply_reading(point, &existing, &mut units);
                created += u64::from(applied.created);
                records.push(applied.today);
                if let Some(stub) = applied.next_day {
                    next_day += 1;
                    records.push(stub);
                }
            }

            match self.ledger.upsert_daily(&records).await {
                Ok(_) => {
                    stats.processed += chunk.len() as u64;
                    stats.created += created;
                    stats.updated += chunk.len() as u64 - created;
                    stats.next_day += next_day;
                    metrics::counter!("rollup_rows_written_total", "period" => "daily")
                        .increment(records.len() as u64);
                }
                Err(e) => {
                    tracing::error!(%day, keys = chunk.len(), error = %e, "daily rollup batch failed, skipping");
                    stats.skipped += chunk.len() as u64;
                    stats.error = Some(e.to_string());
                }
            }
        }

        if stats.skipped > 0 {
            stats.status = RunStatus::Failed;
        }

        tracing::info!(
            %day,
            processed = stats.processed,
            created = stats.created,
            updated = stats.updated,
            next_day = stats.next_day,
            skipped = stats.skipped,
            units = units.len(),
            "daily rollup finished"
        );
        stats
    }
}
