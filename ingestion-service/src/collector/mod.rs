//! Pull-path collection: roster and parameter catalog loading, the
//! per-endpoint device scheduler and controller mode writes.

pub mod mode;
pub mod report;
pub mod scheduler;
mod session;

use std::{collections::BTreeMap, path::Path};

use anyhow::Context;
use ledger_client::domain::Unit;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::config::CollectorConfig;
use crate::s7::{DeviceAddress, S7Connector, ValueType};

pub use mode::{ModeTargets, SystemMode, WriteTarget};
pub use report::{outcomes_to_points, outcomes_to_report};
pub use scheduler::DeviceScheduler;
pub use session::DeviceOutcome;

pub const CONTROLLER_IP_FIELD: &str = "PLC IP地址";
pub const DEVICE_IP_FIELD: &str = "IP地址";

/// Where one parameter lives inside a controller's data blocks.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ParameterSpec {
    #[serde(alias = "db_num")]
    pub block: u16,
    pub offset: u32,
    pub length: u32,
    #[serde(rename = "type", alias = "data_type")]
    pub value_type: ValueType,
    #[serde(default)]
    pub description: String,
}

/// Parameters read from every unit, iterated in key order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct ParameterCatalog {
    params: BTreeMap<String, ParameterSpec>,
}

impl ParameterCatalog {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read parameter catalog {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("invalid parameter catalog {}", path.display()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParameterSpec)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

/// A unit bound to the controller that serves it.
#[derive(Debug, Clone, PartialEq)]
pub struct RosterEntry {
    pub unit: Unit,
    pub address: DeviceAddress,
    /// Descriptive fields carried through to published payloads.
    pub attributes: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Roster {
    pub entries: Vec<RosterEntry>,
}

impl Roster {
    /// Parse a roster document: unit key → device attributes.
    ///
    /// The controller IP wins over the device IP. Units with neither are
    /// skipped. `rack`/`slot` fields are honoured when present.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        let doc: BTreeMap<String, Map<String, Value>> = serde_json::from_str(raw)?;
        let mut entries = Vec::with_capacity(doc.len());

        for (key, attributes) in doc {
            let ip = [CONTROLLER_IP_FIELD, DEVICE_IP_FIELD]
                .iter()
                .filter_map(|field| attributes.get(*field).and_then(Value::as_str))
                .map(str::trim)
                .find(|ip| !ip.is_empty());
            let Some(ip) = ip else {
                tracing::warn!(unit = %key, "roster entry has no controller or device IP, skipping");
                continue;
            };

            let mut address = DeviceAddress::new(ip);
            if let Some(rack) = small_field(&key, &attributes, "rack") {
                address.rack = rack;
            }
            if let Some(slot) = small_field(&key, &attributes, "slot") {
                address.slot = slot;
            }

            entries.push(RosterEntry {
                unit: Unit::parse(&key),
                address,
                attributes,
            });
        }

        Ok(Self { entries })
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read roster {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("invalid roster {}", path.display()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A rack or slot number. Values that do not fit a byte keep the default.
fn small_field(unit: &str, attributes: &Map<String, Value>, field: &str) -> Option<u8> {
    let raw = attributes.get(field).and_then(Value::as_u64)?;
    match u8::try_from(raw) {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(unit, field, value = raw, "roster value out of range, keeping default");
            None
        }
    }
}

impl DeviceScheduler<S7Connector> {
    pub fn from_config(cfg: &CollectorConfig) -> Self {
        Self::new(
            S7Connector::new(cfg.connect_timeout(), cfg.request_timeout()),
            cfg.workers,
            cfg.session_timeout(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_accepts_both_field_spellings() {
        let catalog = ParameterCatalog::from_json(
            r#"{
                "total_hot_quantity": {"db_num": 1, "offset": 4, "length": 4, "data_type": "uint32", "description": "heat"},
                "total_cold_quantity": {"block": 1, "offset": 8, "length": 4, "type": "float"}
            }"#,
        )
        .unwrap();

        let keys: Vec<&str> = catalog.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["total_cold_quantity", "total_hot_quantity"]);
        let (_, cold) = catalog.iter().next().unwrap();
        assert_eq!(cold.value_type, ValueType::Float32);
        assert_eq!(cold.offset, 8);
    }

    #[test]
    fn roster_prefers_controller_ip_and_skips_unaddressed_units() {
        let roster = Roster::from_json(
            r#"{
                "9-1-3104": {"PLC IP地址": "192.168.1.10", "IP地址": "192.168.9.9"},
                "9-1-3105": {"PLC IP地址": "", "IP地址": "192.168.9.10", "slot": 2},
                "9-1-3106": {"户号": "3106"}
            }"#,
        )
        .unwrap();

        assert_eq!(roster.len(), 2);
        assert_eq!(roster.entries[0].address.ip, "192.168.1.10");
        assert_eq!(roster.entries[1].address.ip, "192.168.9.10");
        assert_eq!(roster.entries[1].address.slot, 2);
        assert_eq!(roster.entries[1].address.rack, 0);
    }

    #[test]
    fn out_of_range_rack_and_slot_keep_defaults() {
        let roster = Roster::from_json(
            r#"{"9-1-3104": {"PLC IP地址": "192.168.1.10", "rack": 300, "slot": 257}}"#,
        )
        .unwrap();

        let address = &roster.entries[0].address;
        assert_eq!(address.rack, 0);
        assert_eq!(address.slot, 1);
    }
}
