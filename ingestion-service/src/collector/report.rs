use std::collections::BTreeMap;

use ledger_client::domain::{EnergyMode, TelemetryPoint};
use serde_json::{json, Map, Value};
use time::{macros::format_description, Date, OffsetDateTime};

use super::{DeviceOutcome, Roster, CONTROLLER_IP_FIELD};

/// Build the canonical bus payload for one collection run:
///
/// ```json
/// { "9-1-3104": { "PLC IP地址": "…", "data": { "total_hot_quantity": {
///     "value": 10100, "success": true, "message": "read ok", "timestamp": "2025-01-10 08:00:00" } } } }
/// ```
///
/// Roster attributes ride along so downstream consumers see the same device
/// record the collector was given.
pub fn outcomes_to_report(outcomes: &[DeviceOutcome], roster: &Roster, captured_at: OffsetDateTime) -> Value {
    let stamp = captured_at
        .format(format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"))
        .unwrap_or_default();

    let mut devices: BTreeMap<String, Map<String, Value>> = roster
        .entries
        .iter()
        .map(|entry| {
            let mut device = entry.attributes.clone();
            device.insert("data".to_string(), Value::Object(Map::new()));
            (entry.unit.key.clone(), device)
        })
        .collect();

    for outcome in outcomes {
        let device = devices.entry(outcome.unit.key.clone()).or_default();
        device
            .entry(CONTROLLER_IP_FIELD)
            .or_insert_with(|| Value::String(outcome.address.clone()));
        let data = device
            .entry("data")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(data) = data {
            data.insert(
                outcome.parameter.clone(),
                json!({
                    "value": outcome.value,
                    "success": outcome.success,
                    "message": outcome.message,
                    "timestamp": stamp,
                }),
            );
        }
    }

    Value::Object(
        devices
            .into_iter()
            .map(|(key, device)| (key, Value::Object(device)))
            .collect(),
    )
}

/// Counter outcomes as telemetry points for `captured_day`.
///
/// Parameters that are not energy counters are ignored. An outcome without a
/// value becomes a failed point.
pub fn outcomes_to_points(outcomes: &[DeviceOutcome], captured_day: Date) -> Vec<TelemetryPoint> {
    outcomes
        .iter()
        .filter_map(|outcome| {
            let energy_mode = EnergyMode::from_metric_key(&outcome.parameter)?;
            let (success, raw_counter_value) = match outcome.value {
                Some(value) if outcome.success => (true, value.to_counter()),
                _ => (false, 0),
            };
            Some(TelemetryPoint {
                unit: outcome.unit.clone(),
                energy_mode,
                raw_counter_value,
                source_address: Some(outcome.address.clone()),
                captured_day,
                success,
                message: outcome.message.clone(),
            })
        })
        .collect()
}
