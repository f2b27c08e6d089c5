use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use time::{Date, Duration, Month};

use super::{EnergyMode, TelemetryKey, Unit};

/// Per-day usage ledger row for one unit and energy mode.
///
/// `final_energy`/`usage_quantity` stay `None` while the row is a stub seeded
/// from the previous day. Whenever both are set,
/// `usage_quantity == final_energy - initial_energy`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyUsageRecord {
    pub unit: Unit,
    pub energy_mode: EnergyMode,
    pub day: Date,
    pub initial_energy: i64,
    pub final_energy: Option<i64>,
    pub usage_quantity: Option<i64>,
}

impl DailyUsageRecord {
    /// First reading of a day: opens the row with zero usage.
    pub fn opened(unit: Unit, energy_mode: EnergyMode, day: Date, value: i64) -> Self {
        Self {
            unit,
            energy_mode,
            day,
            initial_energy: value,
            final_energy: Some(value),
            usage_quantity: Some(0),
        }
    }

    /// Carry-over row for a day that has no reading of its own yet.
    pub fn stub(unit: Unit, energy_mode: EnergyMode, day: Date, initial_energy: i64) -> Self {
        Self {
            unit,
            energy_mode,
            day,
            initial_energy,
            final_energy: None,
            usage_quantity: None,
        }
    }

    pub fn is_stub(&self) -> bool {
        self.final_energy.is_none()
    }

    /// Set the closing counter value; the starting value never moves.
    pub fn close_with(&mut self, value: i64) {
        self.final_energy = Some(value);
        self.usage_quantity = Some(value - self.initial_energy);
    }

    pub fn key(&self) -> TelemetryKey {
        TelemetryKey {
            unit_key: self.unit.key.clone(),
            energy_mode: self.energy_mode,
            day: self.day,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid month '{0}', expected YYYY-MM")]
pub struct InvalidMonth(pub String);

/// A calendar month, rendered as `YYYY-MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UsageMonth {
    year: i32,
    month: u8,
}

impl UsageMonth {
    pub fn new(year: i32, month: u8) -> Result<Self, InvalidMonth> {
        let candidate = Self { year, month };
        Month::try_from(month).map_err(|_| InvalidMonth(candidate.to_string()))?;
        Date::from_calendar_date(year, Month::January, 1)
            .map_err(|_| InvalidMonth(candidate.to_string()))?;
        Ok(candidate)
    }

    pub fn of(day: Date) -> Self {
        Self {
            year: day.year(),
            month: day.month() as u8,
        }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u8 {
        self.month
    }

    pub fn first_day(&self) -> Date {
        let month = Month::try_from(self.month).unwrap_or(Month::January);
        Date::from_calendar_date(self.year, month, 1).unwrap_or(Date::MIN)
    }

    /// First day of the following month (exclusive upper bound).
    pub fn end_exclusive(&self) -> Date {
        let first = self.first_day();
        first + Duration::days(i64::from(first.month().length(self.year)))
    }

    pub fn previous(&self) -> Self {
        if self.month == 1 {
            Self { year: self.year - 1, month: 12 }
        } else {
            Self { year: self.year, month: self.month - 1 }
        }
    }

    pub fn contains(&self, day: Date) -> bool {
        day >= self.first_day() && day < self.end_exclusive()
    }
}

impl fmt::Display for UsageMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for UsageMonth {
    type Err = InvalidMonth;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidMonth(s.to_string());
        let (year, month) = s.trim().split_once('-').ok_or_else(invalid)?;
        let year: i32 = year.parse().map_err(|_| invalid())?;
        let month: u8 = month.parse().map_err(|_| invalid())?;
        Self::new(year, month).map_err(|_| invalid())
    }
}

impl TryFrom<String> for UsageMonth {
    type Error = InvalidMonth;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<UsageMonth> for String {
    fn from(value: UsageMonth) -> Self {
        value.to_string()
    }
}

/// Monthly summary rebuilt from the daily ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthlyUsageRecord {
    pub unit: Unit,
    pub energy_mode: EnergyMode,
    pub month: UsageMonth,
    pub initial_energy: i64,
    pub final_energy: i64,
    pub usage_quantity: i64,
}
