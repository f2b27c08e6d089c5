//! Building-wide system mode: written into every controller of a roster and
//! announced on the bus as a device-write command.

use std::{collections::BTreeMap, fmt, path::Path, str::FromStr, sync::Arc};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::{
    session::{fan_out, Action, DeviceOutcome, Step},
    DeviceScheduler, Roster,
};
use crate::config::ModeConfig;
use crate::s7::{DeviceConnector, Scalar, ValueType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemMode {
    Cooling,
    Heating,
    Ventilation,
}

impl SystemMode {
    /// Value stored in the controller's mode word.
    pub fn code(self) -> i64 {
        match self {
            Self::Cooling => 1,
            Self::Heating => 2,
            Self::Ventilation => 3,
        }
    }

    /// Value carried by the bus command.
    pub fn bus_value(self) -> &'static str {
        match self {
            Self::Cooling => "cold",
            Self::Heating => "hot",
            Self::Ventilation => "wind",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cooling => "cooling",
            Self::Heating => "heating",
            Self::Ventilation => "ventilation",
        }
    }
}

impl fmt::Display for SystemMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SystemMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cooling" | "cold" | "1" => Ok(Self::Cooling),
            "heating" | "hot" | "2" => Ok(Self::Heating),
            "ventilation" | "wind" | "3" => Ok(Self::Ventilation),
            other => anyhow::bail!("unknown system mode '{other}' (expected cooling, heating or ventilation)"),
        }
    }
}

/// A word the mode is written into.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WriteTarget {
    #[serde(alias = "db_num")]
    pub block: u16,
    pub offset: u32,
    #[serde(rename = "type", alias = "data_type")]
    pub value_type: ValueType,
}

/// Every word that receives the mode value, in key order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModeTargets {
    targets: BTreeMap<String, WriteTarget>,
}

impl ModeTargets {
    /// Accepts either a bare map of targets or one wrapped in `"parameters"`.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        let mut doc: Value = serde_json::from_str(raw)?;
        let targets = match doc.get_mut("parameters") {
            Some(inner) => serde_json::from_value(inner.take())?,
            None => serde_json::from_value(doc)?,
        };
        Ok(Self { targets })
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read mode targets {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("invalid mode targets {}", path.display()))
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    fn plan(&self, mode: SystemMode) -> Vec<Step> {
        self.targets
            .iter()
            .map(|(key, target)| Step {
                parameter: key.clone(),
                action: Action::Write {
                    target: target.clone(),
                    value: Scalar::Int(mode.code()),
                },
            })
            .collect()
    }
}

impl<C> DeviceScheduler<C>
where
    C: DeviceConnector + 'static,
{
    /// Write `mode` into every target of every roster unit, one session per
    /// endpoint. Failures come back as unsuccessful outcomes.
    pub async fn write_mode(&self, roster: &Roster, targets: &ModeTargets, mode: SystemMode) -> Vec<DeviceOutcome> {
        tracing::info!(
            %mode,
            units = roster.len(),
            targets = targets.len(),
            "writing system mode"
        );

        let outcomes = fan_out(
            self.connector.clone(),
            roster,
            Arc::new(targets.plan(mode)),
            self.workers,
            self.session_timeout,
        )
        .await;

        let ok = outcomes.iter().filter(|o| o.success).count();
        tracing::info!(%mode, ok, failed = outcomes.len() - ok, "system mode write finished");
        outcomes
    }
}

/// Outcomes grouped per unit and target:
/// `{ unit: { "address": ip, "results": { target: { success, message, value } } } }`.
pub fn outcomes_by_unit(outcomes: &[DeviceOutcome]) -> Value {
    let mut units: BTreeMap<&str, Map<String, Value>> = BTreeMap::new();
    for outcome in outcomes {
        let unit = units.entry(outcome.unit.key.as_str()).or_insert_with(|| {
            let mut unit = Map::new();
            unit.insert("address".to_string(), Value::String(outcome.address.clone()));
            unit.insert("results".to_string(), Value::Object(Map::new()));
            unit
        });
        if let Some(Value::Object(results)) = unit.get_mut("results") {
            results.insert(
                outcome.parameter.clone(),
                json!({
                    "success": outcome.success,
                    "message": outcome.message,
                    "value": outcome.value,
                }),
            );
        }
    }

    Value::Object(
        units
            .into_iter()
            .map(|(key, unit)| (key.to_string(), Value::Object(unit)))
            .collect(),
    )
}

/// Bus topic for mode commands addressed to the configured screen.
pub fn command_topic(cfg: &ModeConfig) -> String {
    format!("{}/{}", cfg.topic.trim_end_matches('/'), cfg.screen_mac)
}

/// Device-write command announcing `mode` to the building's screen.
pub fn mode_command(mode: SystemMode, message_id: u64, cfg: &ModeConfig) -> Value {
    json!({
        "header": {
            "ackCode": "0",
            "messageId": message_id.to_string(),
            "name": "DeviceWrite",
            "screenMac": cfg.screen_mac,
        },
        "payload": {
            "data": {
                "deviceSn": cfg.device_sn,
                "items": [{
                    "attrConstraint": 1,
                    "attrTag": cfg.attr_tag,
                    "attrValue": mode.bus_value(),
                }],
                "productCode": cfg.product_code,
                "systemFlag": 2,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::Ordering, time::Duration};

    use ledger_client::domain::Unit;
    use tokio::net::TcpListener;

    use super::*;
    use crate::collector::RosterEntry;
    use crate::s7::{simulator::SimulatedDevice, DeviceAddress, S7Connector};

    fn targets() -> ModeTargets {
        ModeTargets::from_json(
            r#"{"parameters": {
                "mode": {"db_num": 1, "offset": 2, "data_type": "uint16"},
                "central_energy_supply": {"db_num": 1, "offset": 6, "data_type": "uint16"}
            }}"#,
        )
        .unwrap()
    }

    fn roster(units: &[(&str, &DeviceAddress)]) -> Roster {
        Roster {
            entries: units
                .iter()
                .map(|(key, address)| RosterEntry {
                    unit: Unit::parse(key),
                    address: (*address).clone(),
                    attributes: Map::new(),
                })
                .collect(),
        }
    }

    fn scheduler() -> DeviceScheduler<S7Connector> {
        DeviceScheduler::new(
            S7Connector::new(Duration::from_secs(2), Duration::from_secs(2)),
            4,
            Duration::from_secs(5),
        )
    }

    #[test]
    fn modes_parse_from_names_and_codes() {
        assert_eq!("Cooling".parse::<SystemMode>().unwrap(), SystemMode::Cooling);
        assert_eq!("hot".parse::<SystemMode>().unwrap(), SystemMode::Heating);
        assert_eq!("3".parse::<SystemMode>().unwrap(), SystemMode::Ventilation);
        assert!("dehumidify".parse::<SystemMode>().is_err());
        assert_eq!(SystemMode::Heating.code(), 2);
    }

    #[test]
    fn targets_accept_bare_and_wrapped_documents() {
        let bare = ModeTargets::from_json(r#"{"mode": {"block": 1, "offset": 2, "type": "int16"}}"#).unwrap();
        assert_eq!(bare.len(), 1);
        assert_eq!(targets().len(), 2);
        assert!(ModeTargets::from_json(r#"{"parameters": {"mode": {"offset": 2}}}"#).is_err());
    }

    #[tokio::test]
    async fn mode_is_written_to_every_target_of_every_unit() {
        let device = SimulatedDevice::spawn(vec![0u8; 16], 480).await;

        let outcomes = scheduler()
            .write_mode(
                &roster(&[("9-1-3104", &device.address), ("9-1-3105", &device.address)]),
                &targets(),
                SystemMode::Heating,
            )
            .await;

        assert_eq!(outcomes.len(), 4);
        assert!(outcomes
            .iter()
            .all(|o| o.success && o.message == "write ok" && o.value == Some(Scalar::Int(2))));
        let image = device.image();
        assert_eq!(&image[2..4], &[0x00, 0x02]);
        assert_eq!(&image[6..8], &[0x00, 0x02]);
        // Units behind one controller share a session.
        assert_eq!(device.connections.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unreachable_controller_fails_only_its_units() {
        let device = SimulatedDevice::spawn(vec![0u8; 16], 480).await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = DeviceAddress {
            port: listener.local_addr().unwrap().port(),
            ..DeviceAddress::new("127.0.0.2")
        };
        drop(listener);

        let outcomes = scheduler()
            .write_mode(
                &roster(&[("9-1-3104", &device.address), ("9-1-3201", &dead)]),
                &targets(),
                SystemMode::Cooling,
            )
            .await;

        let by_unit = outcomes_by_unit(&outcomes);
        assert_eq!(by_unit["9-1-3104"]["results"]["mode"]["success"], true);
        assert_eq!(by_unit["9-1-3104"]["results"]["mode"]["value"], 1);
        assert_eq!(by_unit["9-1-3201"]["results"]["mode"]["success"], false);
        assert_eq!(by_unit["9-1-3201"]["results"]["central_energy_supply"]["success"], false);
        assert_eq!(by_unit["9-1-3201"]["address"], "127.0.0.2");
    }

    #[tokio::test]
    async fn a_rejected_target_does_not_stop_its_siblings() {
        let device = SimulatedDevice::spawn(vec![0u8; 4], 480).await;

        let outcomes = scheduler()
            .write_mode(&roster(&[("9-1-3104", &device.address)]), &targets(), SystemMode::Ventilation)
            .await;

        let by_unit = outcomes_by_unit(&outcomes);
        let results = &by_unit["9-1-3104"]["results"];
        assert_eq!(results["mode"]["success"], true);
        assert_eq!(results["central_energy_supply"]["success"], false);
        assert!(results["central_energy_supply"]["message"]
            .as_str()
            .unwrap()
            .starts_with("write failed"));
        assert_eq!(&device.image()[2..4], &[0x00, 0x03]);
    }

    #[test]
    fn bus_command_carries_the_mode_value() {
        let cfg = ModeConfig {
            screen_mac: "9e1f3fca84e43404".to_string(),
            ..ModeConfig::default()
        };

        let command = mode_command(SystemMode::Ventilation, 7, &cfg);
        assert_eq!(command["header"]["messageId"], "7");
        assert_eq!(command["header"]["name"], "DeviceWrite");
        assert_eq!(command["header"]["screenMac"], "9e1f3fca84e43404");
        let data = &command["payload"]["data"];
        assert_eq!(data["deviceSn"], 21_996);
        assert_eq!(data["items"][0]["attrTag"], "mode");
        assert_eq!(data["items"][0]["attrValue"], "wind");
        assert_eq!(command_topic(&cfg), "/system/mode/9e1f3fca84e43404");
    }
}
