use std::{collections::BTreeMap, sync::Arc};

use ledger_client::{
    domain::{DailyUsageRecord, EnergyMode, MonthlyUsageRecord, UsageMonth},
    LedgerStore,
};

use super::{RollupStats, RunStatus, UnitCache};

/// Monthly summaries rebuilt from the daily ledger.
pub struct MonthlyRollup {
    ledger: Arc<dyn LedgerStore>,
}

/// Fold one (unit, mode) group of daily rows, ordered by day.
///
/// Returns `None` for an empty group.
pub fn summarize(
    month: UsageMonth,
    rows: &[DailyUsageRecord],
    units: &mut UnitCache,
) -> Option<MonthlyUsageRecord> {
    let first = rows.first()?;
    let final_energy = rows
        .iter()
        .rev()
        .find_map(|row| row.final_energy)
        .unwrap_or(first.initial_energy);

    Some(MonthlyUsageRecord {
        unit: units.unit(&first.unit.key),
        energy_mode: first.energy_mode,
        month,
        initial_energy: first.initial_energy,
        final_energy,
        usage_quantity: rows.iter().filter_map(|row| row.usage_quantity).sum(),
    })
}

impl MonthlyRollup {
    pub fn new(ledger: Arc<dyn LedgerStore>) -> Self {
        Self { ledger }
    }

    pub async fn rollup_month(&self, month: UsageMonth) -> RollupStats {
        let rows = match self.ledger.daily_between(month.first_day(), month.end_exclusive()).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::error!(%month, error = %e, "failed to load daily rows for monthly rollup");
                return RollupStats::failed(e);
            }
        };
        if rows.is_empty() {
            tracing::info!(%month, "no daily rows for month, skipping");
            return RollupStats::skipped_run();
        }

        let mut groups: BTreeMap<(String, EnergyMode), Vec<DailyUsageRecord>> = BTreeMap::new();
        for row in rows {
            groups
                .entry((row.unit.key.clone(), row.energy_mode))
                .or_default()
                .push(row);
        }

        let mut units = UnitCache::default();
        let mut stats = RollupStats::default();
        for ((unit_key, mode), mut rows) in groups {
            rows.sort_by_key(|row| row.day);
            let Some(record) = summarize(month, &rows, &mut units) else {
                continue;
            };

            stats.processed += 1;
            match self.ledger.upsert_monthly(&record).await {
                Ok(written) => {
                    stats.created += written.created;
                    stats.updated += written.updated;
                    metrics::counter!("rollup_rows_written_total", "period" => "monthly").increment(1);
                }
                Err(e) => {
                    tracing::error!(%month, unit = %unit_key, %mode, error = %e, "monthly summary failed, continuing");
                    stats.skipped += 1;
                    stats.error = Some(e.to_string());
                }
            }
        }

        if stats.skipped > 0 {
            stats.status = RunStatus::Failed;
        }

        tracing::info!(
            %month,
            processed = stats.processed,
            created = stats.created,
            updated = stats.updated,
            skipped = stats.skipped,
            "monthly rollup finished"
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use ledger_client::{domain::Unit, MemoryLedger, StoreError};
    use time::{macros::date, Date};

    use super::*;

    fn row(unit: &str, day: Date, initial: i64, fin: Option<i64>) -> DailyUsageRecord {
        DailyUsageRecord {
            unit: Unit::parse(unit),
            energy_mode: EnergyMode::Heating,
            day,
            initial_energy: initial,
            final_energy: fin,
            usage_quantity: fin.map(|f| f - initial),
        }
    }

    fn january() -> UsageMonth {
        UsageMonth::new(2025, 1).unwrap()
    }

    #[test]
    fn trailing_stub_does_not_reset_final_energy() {
        let rows = vec![
            row("9-1-3104", date!(2025 - 01 - 01), 100, Some(130)),
            row("9-1-3104", date!(2025 - 01 - 02), 130, Some(170)),
            row("9-1-3104", date!(2025 - 01 - 03), 170, None),
        ];
        let summary = summarize(january(), &rows, &mut UnitCache::default()).unwrap();
        assert_eq!(summary.initial_energy, 100);
        assert_eq!(summary.final_energy, 170);
        assert_eq!(summary.usage_quantity, 70);
    }

    #[test]
    fn stub_only_month_has_zero_usage() {
        let rows = vec![row("9-1-3104", date!(2025 - 01 - 31), 500, None)];
        let summary = summarize(january(), &rows, &mut UnitCache::default()).unwrap();
        assert_eq!((summary.initial_energy, summary.final_energy, summary.usage_quantity), (500, 500, 0));
    }

    #[tokio::test]
    async fn monthly_usage_is_the_sum_of_daily_usage() {
        let ledger = Arc::new(MemoryLedger::new());
        ledger
            .upsert_daily(&[
                row("9-1-3104", date!(2024 - 12 - 31), 90, Some(100)),
                row("9-1-3104", date!(2025 - 01 - 01), 100, Some(130)),
                row("9-1-3104", date!(2025 - 01 - 15), 130, Some(205)),
                row("9-1-3105", date!(2025 - 01 - 02), 10, Some(12)),
                row("9-1-3104", date!(2025 - 02 - 01), 205, Some(300)),
            ])
            .await
            .unwrap();

        let stats = MonthlyRollup::new(ledger.clone()).rollup_month(january()).await;
        assert_eq!(stats.status, RunStatus::Completed);
        assert_eq!((stats.processed, stats.created), (2, 2));

        let summary = ledger.monthly("9-1-3104", EnergyMode::Heating, january()).await.unwrap();
        assert_eq!(summary.usage_quantity, 30 + 75);
        assert_eq!(summary.initial_energy, 100);
        assert_eq!(summary.final_energy, 205);

        let again = MonthlyRollup::new(ledger.clone()).rollup_month(january()).await;
        assert_eq!((again.created, again.updated), (0, 2));
    }

    #[tokio::test]
    async fn load_failure_is_reported_as_error() {
        let ledger = Arc::new(MemoryLedger::new());
        ledger.inject_faults([StoreError::Transient("link reset".into())]).await;

        let stats = MonthlyRollup::new(ledger).rollup_month(january()).await;
        assert_eq!(stats.status, RunStatus::Failed);
        assert!(stats.error.unwrap().contains("link reset"));
    }

    #[tokio::test]
    async fn empty_month_is_skipped_not_failed() {
        let stats = MonthlyRollup::new(Arc::new(MemoryLedger::new()))
            .rollup_month(january())
            .await;
        assert_eq!(stats.status, RunStatus::Skipped);
        assert_eq!(stats.processed, 0);
        assert!(stats.error.is_none());
    }

    #[tokio::test]
    async fn group_failure_does_not_stop_the_run() {
        let ledger = Arc::new(MemoryLedger::new());
        ledger
            .upsert_daily(&[
                row("9-1-3104", date!(2025 - 01 - 01), 100, Some(130)),
                row("9-1-3105", date!(2025 - 01 - 01), 10, Some(12)),
            ])
            .await
            .unwrap();
        // The month load goes through; the first group's write fails.
        ledger
            .inject_faults_after(1, [StoreError::Fatal("deadlock".into())])
            .await;

        let stats = MonthlyRollup::new(ledger.clone()).rollup_month(january()).await;
        assert_eq!(stats.status, RunStatus::Failed);
        assert_eq!((stats.processed, stats.created, stats.skipped), (2, 1, 1));
        assert!(ledger.monthly("9-1-3104", EnergyMode::Heating, january()).await.is_none());
        assert!(ledger.monthly("9-1-3105", EnergyMode::Heating, january()).await.is_some());
    }
}
