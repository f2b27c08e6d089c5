mod status;
mod telemetry;
mod unit;
mod usage;

pub use status::{ConnectionStatus, LinkState, StatusChangeEvent};
pub use telemetry::{EnergyMode, TelemetryKey, TelemetryPoint, UnknownEnergyMode};
pub use unit::Unit;
pub use usage::{DailyUsageRecord, InvalidMonth, MonthlyUsageRecord, UsageMonth};
