use std::collections::{BTreeMap, BTreeSet, VecDeque};

use time::{Date, OffsetDateTime};
use tokio::sync::Mutex;

use super::{LedgerStore, PurgeStats, StoreError, UpsertStats};
use crate::domain::{
    ConnectionStatus, DailyUsageRecord, EnergyMode, LinkState, MonthlyUsageRecord,
    StatusChangeEvent, TelemetryKey, TelemetryPoint, Unit, UsageMonth,
};

type MonthlyKey = (String, EnergyMode, UsageMonth);

#[derive(Default)]
struct LedgerState {
    telemetry: BTreeMap<TelemetryKey, TelemetryPoint>,
    daily: BTreeMap<TelemetryKey, DailyUsageRecord>,
    monthly: BTreeMap<MonthlyKey, MonthlyUsageRecord>,
    status: BTreeMap<String, ConnectionStatus>,
    history: Vec<StatusChangeEvent>,
    /// `None` entries let a call through.
    faults: VecDeque<Option<StoreError>>,
    reconnects: u32,
}

impl LedgerState {
    /// Queued faults fire before any state is touched, so a failed call
    /// leaves the ledger unchanged.
    fn take_fault(&mut self) -> Result<(), StoreError> {
        match self.faults.pop_front() {
            Some(Some(fault)) => Err(fault),
            _ => Ok(()),
        }
    }
}

/// In-process ledger with the same transactional behavior as `PgLedger`.
///
/// Used by tests and dry runs. Faults can be queued with
/// [`MemoryLedger::inject_faults`]; each call except `reconnect` consumes one.
#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn inject_faults(&self, faults: impl IntoIterator<Item = StoreError>) {
        self.state.lock().await.faults.extend(faults.into_iter().map(Some));
    }

    /// Let the next `passes` calls succeed, then fail with `faults`.
    pub async fn inject_faults_after(&self, passes: usize, faults: impl IntoIterator<Item = StoreError>) {
        let mut state = self.state.lock().await;
        state.faults.extend(std::iter::repeat(None).take(passes));
        state.faults.extend(faults.into_iter().map(Some));
    }

    pub async fn reconnects(&self) -> u32 {
        self.state.lock().await.reconnects
    }

    pub async fn telemetry(&self, unit_key: &str, energy_mode: EnergyMode, day: Date) -> Option<TelemetryPoint> {
        let key = TelemetryKey { unit_key: unit_key.to_string(), energy_mode, day };
        self.state.lock().await.telemetry.get(&key).cloned()
    }

    pub async fn telemetry_count(&self) -> usize {
        self.state.lock().await.telemetry.len()
    }

    pub async fn daily(&self, unit_key: &str, energy_mode: EnergyMode, day: Date) -> Option<DailyUsageRecord> {
        let key = TelemetryKey { unit_key: unit_key.to_string(), energy_mode, day };
        self.state.lock().await.daily.get(&key).cloned()
    }

    pub async fn monthly(&self, unit_key: &str, energy_mode: EnergyMode, month: UsageMonth) -> Option<MonthlyUsageRecord> {
        self.state
            .lock()
            .await
            .monthly
            .get(&(unit_key.to_string(), energy_mode, month))
            .cloned()
    }

    pub async fn status(&self, unit_key: &str) -> Option<ConnectionStatus> {
        self.state.lock().await.status.get(unit_key).cloned()
    }

    pub async fn history(&self) -> Vec<StatusChangeEvent> {
        self.state.lock().await.history.clone()
    }
}

fn reject_duplicates(keys: impl Iterator<Item = TelemetryKey>) -> Result<(), StoreError> {
    let mut seen = BTreeSet::new();
    for key in keys {
        if !seen.insert(key.clone()) {
            return Err(StoreError::Fatal(format!(
                "batch contains {} / {} / {} twice",
                key.unit_key, key.energy_mode, key.day
            )));
        }
    }
    Ok(())
}

#[async_trait::async_trait]
impl LedgerStore for MemoryLedger {
    async fn upsert_telemetry(&self, points: &[TelemetryPoint]) -> Result<UpsertStats, StoreError> {
        let mut state = self.state.lock().await;
        state.take_fault()?;
        reject_duplicates(points.iter().map(TelemetryPoint::key))?;

        let mut stats = UpsertStats::default();
        for point in points {
            match state.telemetry.insert(point.key(), point.clone()) {
                Some(_) => stats.updated += 1,
                None => stats.created += 1,
            }
        }
        Ok(stats)
    }

    async fn telemetry_for_day(&self, day: Date) -> Result<Vec<TelemetryPoint>, StoreError> {
        let mut state = self.state.lock().await;
        state.take_fault()?;
        Ok(state
            .telemetry
            .values()
            .filter(|p| p.captured_day == day && p.success)
            .cloned()
            .collect())
    }

    async fn copy_telemetry(&self, from: Date, to: Date) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        state.take_fault()?;

        let copies: Vec<TelemetryPoint> = state
            .telemetry
            .values()
            .filter(|p| p.captured_day == from && p.success)
            .map(|p| TelemetryPoint { captured_day: to, ..p.clone() })
            .collect();

        let mut written = 0;
        for copy in copies {
            let key = copy.key();
            if !state.telemetry.contains_key(&key) {
                state.telemetry.insert(key, copy);
                written += 1;
            }
        }
        Ok(written)
    }

    async fn daily_between(&self, start: Date, end: Date) -> Result<Vec<DailyUsageRecord>, StoreError> {
        let mut state = self.state.lock().await;
        state.take_fault()?;
        Ok(state
            .daily
            .values()
            .filter(|r| r.day >= start && r.day < end)
            .cloned()
            .collect())
    }

    async fn upsert_daily(&self, records: &[DailyUsageRecord]) -> Result<UpsertStats, StoreError> {
        let mut state = self.state.lock().await;
        state.take_fault()?;
        reject_duplicates(records.iter().map(DailyUsageRecord::key))?;

        let mut stats = UpsertStats::default();
        for record in records {
            match state.daily.insert(record.key(), record.clone()) {
                Some(_) => stats.updated += 1,
                None => stats.created += 1,
            }
        }
        Ok(stats)
    }

    async fn close_silent_days(&self, day: Date) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        state.take_fault()?;

        let mut closed = 0;
        for record in state.daily.values_mut().filter(|r| r.day == day && r.is_stub()) {
            record.close_with(record.initial_energy);
            closed += 1;
        }
        Ok(closed)
    }

    async fn upsert_monthly(&self, record: &MonthlyUsageRecord) -> Result<UpsertStats, StoreError> {
        let mut state = self.state.lock().await;
        state.take_fault()?;

        let key = (record.unit.key.clone(), record.energy_mode, record.month);
        Ok(match state.monthly.insert(key, record.clone()) {
            Some(_) => UpsertStats { created: 0, updated: 1 },
            None => UpsertStats { created: 1, updated: 0 },
        })
    }

    async fn purge_before(&self, day: Date) -> Result<PurgeStats, StoreError> {
        let mut state = self.state.lock().await;
        state.take_fault()?;

        let telemetry_before = state.telemetry.len();
        state.telemetry.retain(|key, _| key.day >= day);
        let daily_before = state.daily.len();
        state.daily.retain(|key, _| key.day >= day);

        Ok(PurgeStats {
            telemetry: (telemetry_before - state.telemetry.len()) as u64,
            daily: (daily_before - state.daily.len()) as u64,
        })
    }

    async fn record_link_state(
        &self,
        unit: &Unit,
        state: LinkState,
        at: OffsetDateTime,
    ) -> Result<Option<StatusChangeEvent>, StoreError> {
        let mut ledger = self.state.lock().await;
        ledger.take_fault()?;

        let previous = ledger.status.get(&unit.key).cloned();
        let last_online_at = match state {
            LinkState::Online => Some(at),
            LinkState::Offline => previous.as_ref().and_then(|s| s.last_online_at),
        };
        let changed = previous.as_ref().map(|s| s.state) != Some(state);

        ledger.status.insert(
            unit.key.clone(),
            ConnectionStatus {
                unit: unit.clone(),
                state,
                last_online_at,
                updated_at: at,
            },
        );

        if !changed {
            return Ok(None);
        }
        let event = StatusChangeEvent { unit: unit.clone(), state, changed_at: at };
        ledger.history.push(event.clone());
        Ok(Some(event))
    }

    async fn mark_stale_offline(
        &self,
        cutoff: OffsetDateTime,
        at: OffsetDateTime,
    ) -> Result<Vec<StatusChangeEvent>, StoreError> {
        let mut ledger = self.state.lock().await;
        ledger.take_fault()?;

        let mut events = Vec::new();
        for status in ledger.status.values_mut() {
            let stale = status.state == LinkState::Online
                && status.last_online_at.map(|t| t < cutoff).unwrap_or(false);
            if stale {
                status.state = LinkState::Offline;
                status.updated_at = at;
                events.push(StatusChangeEvent {
                    unit: status.unit.clone(),
                    state: LinkState::Offline,
                    changed_at: at,
                });
            }
        }
        ledger.history.extend(events.iter().cloned());
        Ok(events)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.state.lock().await.take_fault()
    }

    async fn reconnect(&self) -> Result<(), StoreError> {
        self.state.lock().await.reconnects += 1;
        Ok(())
    }
}
