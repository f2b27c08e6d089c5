//! Online/offline tracking of units, derived from ingestion outcomes.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use ledger_client::{
    domain::{LinkState, StatusChangeEvent, TelemetryPoint, Unit},
    LedgerStore, StoreError,
};
use time::OffsetDateTime;

#[derive(Clone)]
pub struct StatusTracker {
    ledger: Arc<dyn LedgerStore>,
}

/// A unit is online when at least one of its points in the message succeeded.
pub fn link_states(points: &[TelemetryPoint]) -> BTreeMap<&str, (&Unit, LinkState)> {
    let mut states: BTreeMap<&str, (&Unit, LinkState)> = BTreeMap::new();
    for point in points {
        let entry = states
            .entry(point.unit.key.as_str())
            .or_insert((&point.unit, LinkState::Offline));
        if point.success {
            entry.1 = LinkState::Online;
        }
    }
    states
}

impl StatusTracker {
    pub fn new(ledger: Arc<dyn LedgerStore>) -> Self {
        Self { ledger }
    }

    /// Record the link state of every unit in one message.
    pub async fn observe(
        &self,
        points: &[TelemetryPoint],
        at: OffsetDateTime,
    ) -> Result<Vec<StatusChangeEvent>, StoreError> {
        let mut changes = Vec::new();
        for (key, (unit, state)) in link_states(points) {
            if let Some(event) = self.ledger.record_link_state(unit, state, at).await? {
                tracing::info!(unit = key, state = %event.state, "unit link state changed");
                metrics::counter!("unit_status_changes_total", "state" => state.as_str()).increment(1);
                changes.push(event);
            }
        }
        Ok(changes)
    }

    /// Mark units silent for longer than `stale_after` as offline.
    pub async fn sweep_stale(
        &self,
        stale_after: Duration,
        now: OffsetDateTime,
    ) -> Result<Vec<StatusChangeEvent>, StoreError> {
        let changes = self.ledger.mark_stale_offline(now - stale_after, now).await?;
        for event in &changes {
            tracing::info!(unit = %event.unit.key, "unit went silent, marked offline");
        }
        if !changes.is_empty() {
            metrics::counter!("unit_status_changes_total", "state" => LinkState::Offline.as_str())
                .increment(changes.len() as u64);
        }
        Ok(changes)
    }
}

#[cfg(test)]
mod tests {
    use ledger_client::{domain::EnergyMode, MemoryLedger};
    use time::macros::{date, datetime};

    use super::*;

    fn point(unit: &str, mode: EnergyMode, success: bool) -> TelemetryPoint {
        TelemetryPoint {
            unit: Unit::parse(unit),
            energy_mode: mode,
            raw_counter_value: 1,
            source_address: None,
            captured_day: date!(2025 - 01 - 10),
            success,
            message: String::new(),
        }
    }

    #[test]
    fn one_success_is_enough_to_be_online() {
        let points = vec![
            point("9-1-3104", EnergyMode::Heating, false),
            point("9-1-3104", EnergyMode::Cooling, true),
            point("9-1-3105", EnergyMode::Heating, false),
        ];
        let states = link_states(&points);
        assert_eq!(states["9-1-3104"].1, LinkState::Online);
        assert_eq!(states["9-1-3105"].1, LinkState::Offline);
    }

    #[tokio::test]
    async fn history_grows_only_on_transitions() {
        let ledger = Arc::new(MemoryLedger::new());
        let tracker = StatusTracker::new(ledger.clone());
        let t0 = datetime!(2025-01-10 08:00:00 UTC);

        let up = vec![point("9-1-3104", EnergyMode::Heating, true)];
        let down = vec![point("9-1-3104", EnergyMode::Heating, false)];

        assert_eq!(tracker.observe(&up, t0).await.unwrap().len(), 1);
        assert!(tracker.observe(&up, t0 + Duration::from_secs(60)).await.unwrap().is_empty());
        assert_eq!(tracker.observe(&down, t0 + Duration::from_secs(120)).await.unwrap().len(), 1);

        let history = ledger.history().await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].state, LinkState::Offline);
    }

    #[tokio::test]
    async fn silent_units_are_swept_offline() {
        let ledger = Arc::new(MemoryLedger::new());
        let tracker = StatusTracker::new(ledger.clone());
        let t0 = datetime!(2025-01-10 08:00:00 UTC);

        tracker
            .observe(&[point("9-1-3104", EnergyMode::Heating, true)], t0)
            .await
            .unwrap();

        let early = tracker
            .sweep_stale(Duration::from_secs(600), t0 + Duration::from_secs(300))
            .await
            .unwrap();
        assert!(early.is_empty());

        let late = tracker
            .sweep_stale(Duration::from_secs(600), t0 + Duration::from_secs(900))
            .await
            .unwrap();
        assert_eq!(late.len(), 1);
        let status = ledger.status("9-1-3104").await.unwrap();
        assert_eq!(status.state, LinkState::Offline);
        assert_eq!(status.last_online_at, Some(t0));
    }
}
