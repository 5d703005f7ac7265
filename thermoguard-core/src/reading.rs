//! Sensor readings and positions
//!
//! A [`Reading`] is the unit of ingestion. It is produced by an external
//! collaborator, normalized by the validator (unit converted to Celsius,
//! quality clamped) and is immutable from then on: every downstream stage
//! receives its own clone or a shared reference.

use serde::{Deserialize, Serialize};

use crate::time::Timestamp;

/// Position of a sensor in the field's coordinate frame
///
/// The triangulation is planar over `(x, y)`; `z` travels with the reading for
/// consumers that want 2.5D context but is not used for interpolation.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub z: f64,
}

impl Position {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Planar position, `z = 0`
    pub const fn planar(x: f64, y: f64) -> Self {
        Self { x, y, z: 0.0 }
    }

    /// Euclidean distance in the plane
    pub fn planar_distance(&self, other: &Position) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        libm::sqrt(dx * dx + dy * dy)
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

/// Temperature unit as reported by the sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Unit {
    Celsius,
    Fahrenheit,
    Kelvin,
}

impl Unit {
    /// Parse the wire name of a unit
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "celsius" | "c" | "°c" => Some(Unit::Celsius),
            "fahrenheit" | "f" | "°f" => Some(Unit::Fahrenheit),
            "kelvin" | "k" => Some(Unit::Kelvin),
            _ => None,
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Unit::Celsius => "celsius",
            Unit::Fahrenheit => "fahrenheit",
            Unit::Kelvin => "kelvin",
        }
    }

    /// Convert a value in this unit to Celsius
    pub fn to_celsius(&self, value: f64) -> f64 {
        match self {
            Unit::Celsius => value,
            Unit::Fahrenheit => (value - 32.0) * 5.0 / 9.0,
            Unit::Kelvin => value - 273.15,
        }
    }
}

/// A raw reading as handed over by the ingestion boundary
///
/// Fields are optional because the wire format is not trusted; the validator
/// turns missing or malformed fields into `InvalidSchema`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawReading {
    pub sensor_id: Option<String>,
    pub timestamp: Option<Timestamp>,
    pub value: Option<f64>,
    pub unit: Option<String>,
    pub quality: Option<f64>,
    pub zone_id: Option<String>,
    pub position: Option<Position>,
}

/// Validated, normalized temperature reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    pub sensor_id: String,
    /// Milliseconds since epoch
    pub timestamp: Timestamp,
    /// Temperature in Celsius
    pub value: f64,
    /// Always Celsius after validation
    pub unit: Unit,
    /// Sensor self-reported quality, 0.0 = bad, 1.0 = perfect
    pub quality: f64,
    /// Registered position of the sensor
    pub position: Position,
    pub zone_id: String,
}

impl Reading {
    /// Convenience constructor for already-normalized readings
    pub fn celsius(
        sensor_id: impl Into<String>,
        zone_id: impl Into<String>,
        position: Position,
        timestamp: Timestamp,
        value: f64,
    ) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            timestamp,
            value,
            unit: Unit::Celsius,
            quality: 1.0,
            position,
            zone_id: zone_id.into(),
        }
    }
}

impl From<&Reading> for RawReading {
    fn from(reading: &Reading) -> Self {
        Self {
            sensor_id: Some(reading.sensor_id.clone()),
            timestamp: Some(reading.timestamp),
            value: Some(reading.value),
            unit: Some(reading.unit.name().to_string()),
            quality: Some(reading.quality),
            zone_id: Some(reading.zone_id.clone()),
            position: Some(reading.position),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_conversion() {
        assert_eq!(Unit::Celsius.to_celsius(21.5), 21.5);
        assert!((Unit::Fahrenheit.to_celsius(212.0) - 100.0).abs() < 1e-9);
        assert!((Unit::Kelvin.to_celsius(273.15)).abs() < 1e-9);
    }

    #[test]
    fn unit_parsing_is_lenient_on_case() {
        assert_eq!(Unit::parse("Celsius"), Some(Unit::Celsius));
        assert_eq!(Unit::parse(" kelvin "), Some(Unit::Kelvin));
        assert_eq!(Unit::parse("rankine"), None);
    }

    #[test]
    fn planar_distance_ignores_height() {
        let a = Position::new(0.0, 0.0, 5.0);
        let b = Position::new(3.0, 4.0, -2.0);
        assert_eq!(a.planar_distance(&b), 5.0);
    }
}
