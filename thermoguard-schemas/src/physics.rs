//! Temperature constraints
//!
//! Two bands per site profile:
//!
//! ```text
//!  absolute_min        typical_min          typical_max        absolute_max
//!  ─────┼──────────────────┼────────────────────┼──────────────────┼─────
//!   err │      warning     │        ok          │     warning      │ err
//! ```
//!
//! Values outside the absolute band are physically implausible for the
//! probes deployed and are errors; values outside the typical band are
//! reported as warnings and still ingested. The absolute band is also what
//! the core validator enforces once a profile is applied to its config.

use serde::{Deserialize, Serialize};

use thermoguard_core::time::rate_per_second;
use thermoguard_core::{Timestamp, Unit, ValidatorConfig};

use crate::validation::{IssueType, ValidationReport};

/// Absolute zero in Celsius
pub const ABSOLUTE_ZERO_C: f64 = -273.15;

/// Constraint set for one site profile, all values in Celsius
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemperatureConstraints {
    pub absolute_min: f64,
    pub absolute_max: f64,
    pub typical_min: f64,
    pub typical_max: f64,
    /// Fastest believable change in °C per second
    pub max_rate_per_sec: Option<f64>,
}

impl TemperatureConstraints {
    /// General purpose probes (industrial thermistors)
    pub fn general() -> Self {
        Self {
            absolute_min: -50.0,
            absolute_max: 150.0,
            typical_min: -20.0,
            typical_max: 85.0,
            max_rate_per_sec: Some(10.0),
        }
    }

    /// Data hall, ASHRAE A1 allowable envelope as the typical band
    pub fn data_hall() -> Self {
        Self {
            absolute_min: -10.0,
            absolute_max: 80.0,
            typical_min: 15.0,
            typical_max: 32.0,
            max_rate_per_sec: Some(1.0),
        }
    }

    /// Cold rooms and freezers
    pub fn cold_storage() -> Self {
        Self {
            absolute_min: -60.0,
            absolute_max: 40.0,
            typical_min: -30.0,
            typical_max: 8.0,
            max_rate_per_sec: Some(0.5),
        }
    }

    /// Constraints matching a validator's physical range
    pub fn from_validator(config: &ValidatorConfig) -> Self {
        Self {
            absolute_min: config.min_celsius,
            absolute_max: config.max_celsius,
            typical_min: config.min_celsius,
            typical_max: config.max_celsius,
            max_rate_per_sec: None,
        }
    }

    /// Copy the absolute band into a validator config
    pub fn apply_to(&self, config: &mut ValidatorConfig) {
        config.min_celsius = self.absolute_min;
        config.max_celsius = self.absolute_max;
    }

    pub fn is_consistent(&self) -> bool {
        self.absolute_min >= ABSOLUTE_ZERO_C
            && self.absolute_min <= self.typical_min
            && self.typical_min <= self.typical_max
            && self.typical_max <= self.absolute_max
    }

    /// Check a Celsius value against both bands
    pub fn check(&self, celsius: f64, report: &mut ValidationReport) {
        if celsius < self.absolute_min || celsius > self.absolute_max {
            report.error(
                IssueType::PhysicsViolation,
                "value",
                format!(
                    "{:.2} °C outside absolute limits [{}, {}]",
                    celsius, self.absolute_min, self.absolute_max
                ),
            );
        } else {
            self.check_typical(celsius, report);
        }
    }

    /// Warn when a value leaves the typical band, never errors
    pub fn check_typical(&self, celsius: f64, report: &mut ValidationReport) {
        if celsius < self.typical_min || celsius > self.typical_max {
            report.warn(
                IssueType::UnusualValue,
                "value",
                format!(
                    "{:.2} °C outside typical band [{}, {}]",
                    celsius, self.typical_min, self.typical_max
                ),
            );
        }
    }

    /// Check the change from a previous reading of the same sensor
    pub fn check_rate(
        &self,
        previous: (Timestamp, f64),
        current: (Timestamp, f64),
        report: &mut ValidationReport,
    ) {
        let Some(limit) = self.max_rate_per_sec else {
            return;
        };
        let dt = current.0 - previous.0;
        if dt <= 0 {
            return;
        }
        let rate = rate_per_second(current.1 - previous.1, dt);
        if rate.abs() > limit {
            report.warn(
                IssueType::RateOfChange,
                "value",
                format!("{:.3} °C/s exceeds {} °C/s", rate, limit),
            );
        }
    }
}

impl Default for TemperatureConstraints {
    fn default() -> Self {
        Self::general()
    }
}

/// Convert a value in a wire unit name to Celsius
pub fn to_celsius(value: f64, unit: &str) -> Option<f64> {
    Unit::parse(unit).map(|u| u.to_celsius(value))
}
