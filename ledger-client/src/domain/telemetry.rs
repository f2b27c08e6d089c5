use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use time::Date;

use super::Unit;

/// Energy usage channel tracked independently per unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnergyMode {
    Heating,
    Cooling,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown energy mode '{0}'")]
pub struct UnknownEnergyMode(pub String);

impl EnergyMode {
    pub const ALL: [EnergyMode; 2] = [EnergyMode::Heating, EnergyMode::Cooling];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Heating => "heating",
            Self::Cooling => "cooling",
        }
    }

    /// Metric key used by field controllers for this mode's cumulative counter.
    pub fn metric_key(self) -> &'static str {
        match self {
            Self::Heating => "total_hot_quantity",
            Self::Cooling => "total_cold_quantity",
        }
    }

    /// Map a metric key or mode label (English or Chinese) to a mode.
    pub fn from_metric_key(key: &str) -> Option<Self> {
        match key.trim() {
            "total_hot_quantity" | "heating" | "制热" => Some(Self::Heating),
            "total_cold_quantity" | "cooling" | "制冷" => Some(Self::Cooling),
            _ => None,
        }
    }
}

impl fmt::Display for EnergyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnergyMode {
    type Err = UnknownEnergyMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_metric_key(s).ok_or_else(|| UnknownEnergyMode(s.to_string()))
    }
}

/// Unique key of a telemetry row and of a daily ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TelemetryKey {
    pub unit_key: String,
    pub energy_mode: EnergyMode,
    pub day: Date,
}

/// One cumulative counter reading for a unit and energy mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPoint {
    pub unit: Unit,
    pub energy_mode: EnergyMode,
    pub raw_counter_value: i64,
    pub source_address: Option<String>,
    pub captured_day: Date,
    pub success: bool,
    pub message: String,
}

impl TelemetryPoint {
    pub fn key(&self) -> TelemetryKey {
        TelemetryKey {
            unit_key: self.unit.key.clone(),
            energy_mode: self.energy_mode,
            day: self.captured_day,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_keys_and_labels_map_to_modes() {
        assert_eq!(EnergyMode::from_metric_key("total_hot_quantity"), Some(EnergyMode::Heating));
        assert_eq!(EnergyMode::from_metric_key("制冷"), Some(EnergyMode::Cooling));
        assert_eq!(EnergyMode::from_metric_key("cooling"), Some(EnergyMode::Cooling));
        assert_eq!(EnergyMode::from_metric_key("room_temperature"), None);
        assert!("humidity".parse::<EnergyMode>().is_err());
    }
}
