//! Ingestion message format
//!
//! One JSON object per reading:
//!
//! ```text
//! { "sensorId": "rack-07-top", "timestamp": 1718000000000, "value": 24.6,
//!   "unit": "celsius", "zoneId": "cold-aisle-2",
//!   "position": { "x": 12.5, "y": 3.0, "z": 2.1 }, "quality": 0.98 }
//! ```
//!
//! `quality` and `position` are optional (`position` is only needed to
//! auto-register a sensor, `z` defaults to 0). Decoding walks the object
//! field by field so one message yields every structural problem at once;
//! any error turns the whole message into [`SchemaError::Invalid`]. Range,
//! duplicate and sensor checks stay with the core validator.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use thermoguard_core::{Position, RawReading, Timestamp, Unit};

use crate::physics::TemperatureConstraints;
use crate::validation::{IssueType, Level, ValidationIssue, ValidationReport};
use crate::SchemaError;

const KNOWN_FIELDS: [&str; 7] = [
    "sensorId", "timestamp", "value", "unit", "quality", "zoneId", "position",
];

/// Producer-side view of an ingestion message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestMessage {
    pub sensor_id: String,
    pub timestamp: Timestamp,
    pub value: f64,
    pub unit: String,
    pub zone_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<f64>,
}

impl IngestMessage {
    /// Celsius reading without position
    pub fn celsius(
        sensor_id: impl Into<String>,
        zone_id: impl Into<String>,
        timestamp: Timestamp,
        value: f64,
    ) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            timestamp,
            value,
            unit: Unit::Celsius.name().to_string(),
            zone_id: zone_id.into(),
            position: None,
            quality: None,
        }
    }

    pub fn at(mut self, position: Position) -> Self {
        self.position = Some(position);
        self
    }

    pub fn to_json(&self) -> Result<String, SchemaError> {
        serde_json::to_string(self).map_err(|e| SchemaError::Encode(e.to_string()))
    }
}

impl From<IngestMessage> for RawReading {
    fn from(msg: IngestMessage) -> Self {
        RawReading {
            sensor_id: Some(msg.sensor_id),
            timestamp: Some(msg.timestamp),
            value: Some(msg.value),
            unit: Some(msg.unit),
            quality: msg.quality,
            zone_id: Some(msg.zone_id),
            position: msg.position,
        }
    }
}

/// A structurally valid reading plus advisory issues
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub reading: RawReading,
    /// Warnings and info only; errors never reach a `Decoded`
    pub report: ValidationReport,
}

/// Ingestion message decoder
///
/// With constraints attached the decoder also annotates readings that leave
/// the typical band or change faster than the profile allows. Those are
/// warnings; the reading is still handed on.
#[derive(Debug, Default)]
pub struct IngestDecoder {
    constraints: Option<TemperatureConstraints>,
    last_seen: Mutex<HashMap<String, (Timestamp, f64)>>,
}

impl IngestDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_constraints(mut self, constraints: TemperatureConstraints) -> Self {
        self.constraints = Some(constraints);
        self
    }

    pub fn constraints(&self) -> Option<&TemperatureConstraints> {
        self.constraints.as_ref()
    }

    /// Decode one message
    pub fn decode_str(&self, json: &str) -> Result<Decoded, SchemaError> {
        let value: Value =
            serde_json::from_str(json).map_err(|e| SchemaError::Parse(e.to_string()))?;
        self.decode_value(&value)
    }

    /// Decode a single object or an array of objects
    ///
    /// A syntax error fails the whole batch; structural errors only fail
    /// their own element.
    pub fn decode_batch(&self, json: &str) -> Result<Vec<Result<Decoded, SchemaError>>, SchemaError> {
        let value: Value =
            serde_json::from_str(json).map_err(|e| SchemaError::Parse(e.to_string()))?;
        Ok(match &value {
            Value::Array(items) => items.iter().map(|item| self.decode_value(item)).collect(),
            other => vec![self.decode_value(other)],
        })
    }

    pub fn decode_value(&self, value: &Value) -> Result<Decoded, SchemaError> {
        let (reading, report) = self.inspect(value);
        if !report.is_valid() {
            log::debug!("Ingestion message rejected: {}", report);
            return Err(SchemaError::Invalid(report));
        }
        Ok(Decoded { reading, report })
    }

    /// Extract whatever is usable and report everything that is not
    pub fn inspect(&self, value: &Value) -> (RawReading, ValidationReport) {
        let mut report = ValidationReport::new();
        let mut raw = RawReading::default();

        let Value::Object(obj) = value else {
            report.add_error(ValidationIssue::new(
                IssueType::NotAnObject,
                None,
                "message must be a JSON object",
                Level::Error,
            ));
            return (raw, report);
        };

        raw.sensor_id = required_string(obj, "sensorId", &mut report);
        raw.zone_id = required_string(obj, "zoneId", &mut report);
        raw.timestamp = timestamp(obj, &mut report);
        raw.value = number(obj, "value", true, &mut report);
        raw.quality = number(obj, "quality", false, &mut report);
        raw.position = position(obj, &mut report);

        raw.unit = required_string(obj, "unit", &mut report);
        let unit = raw.unit.as_deref().and_then(|name| {
            let parsed = Unit::parse(name);
            if parsed.is_none() {
                report.error(
                    IssueType::UnknownUnit,
                    "unit",
                    format!("unsupported unit '{}'", name),
                );
            }
            parsed
        });

        if let Some(q) = raw.quality {
            if !(0.0..=1.0).contains(&q) {
                report.error(IssueType::MalformedField, "quality", "must be within [0, 1]");
            }
        }

        for key in obj.keys() {
            if !KNOWN_FIELDS.contains(&key.as_str()) {
                report.add_info(ValidationIssue::new(
                    IssueType::UnknownField,
                    Some(key),
                    "ignored",
                    Level::Info,
                ));
            }
        }

        if report.is_valid() {
            if let (Some(constraints), Some(unit), Some(v)) = (&self.constraints, unit, raw.value) {
                let celsius = unit.to_celsius(v);
                constraints.check_typical(celsius, &mut report);
                if let (Some(id), Some(ts)) = (&raw.sensor_id, raw.timestamp) {
                    self.check_rate(constraints, id, ts, celsius, &mut report);
                }
            }
        }

        (raw, report)
    }

    fn check_rate(
        &self,
        constraints: &TemperatureConstraints,
        sensor_id: &str,
        ts: Timestamp,
        celsius: f64,
        report: &mut ValidationReport,
    ) {
        if constraints.max_rate_per_sec.is_none() {
            return;
        }
        let mut last_seen = self
            .last_seen
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match last_seen.get(sensor_id) {
            Some(&(prev_ts, prev)) if ts > prev_ts => {
                constraints.check_rate((prev_ts, prev), (ts, celsius), report);
                last_seen.insert(sensor_id.to_string(), (ts, celsius));
            }
            Some(_) => {}
            None => {
                last_seen.insert(sensor_id.to_string(), (ts, celsius));
            }
        }
    }
}

fn required_string(obj: &Map<String, Value>, field: &str, report: &mut ValidationReport) -> Option<String> {
    match obj.get(field) {
        None | Some(Value::Null) => {
            report.error(IssueType::MissingField, field, "required");
            None
        }
        Some(Value::String(s)) if s.trim().is_empty() => {
            report.error(IssueType::MalformedField, field, "must not be empty");
            None
        }
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => {
            report.error(
                IssueType::TypeMismatch,
                field,
                format!("expected string, got {}", type_name(other)),
            );
            None
        }
    }
}

fn timestamp(obj: &Map<String, Value>, report: &mut ValidationReport) -> Option<Timestamp> {
    match obj.get("timestamp") {
        None | Some(Value::Null) => {
            report.error(IssueType::MissingField, "timestamp", "required");
            None
        }
        Some(Value::Number(n)) => match n.as_i64() {
            Some(ts) => Some(ts),
            None => {
                report.error(
                    IssueType::TypeMismatch,
                    "timestamp",
                    "expected integer milliseconds",
                );
                None
            }
        },
        Some(other) => {
            report.error(
                IssueType::TypeMismatch,
                "timestamp",
                format!("expected integer, got {}", type_name(other)),
            );
            None
        }
    }
}

fn number(
    obj: &Map<String, Value>,
    field: &str,
    required: bool,
    report: &mut ValidationReport,
) -> Option<f64> {
    match obj.get(field) {
        None | Some(Value::Null) => {
            if required {
                report.error(IssueType::MissingField, field, "required");
            }
            None
        }
        Some(Value::Number(n)) => match n.as_f64() {
            Some(v) if v.is_finite() => Some(v),
            _ => {
                report.error(IssueType::MalformedField, field, "not a finite number");
                None
            }
        },
        Some(other) => {
            report.error(
                IssueType::TypeMismatch,
                field,
                format!("expected number, got {}", type_name(other)),
            );
            None
        }
    }
}

fn position(obj: &Map<String, Value>, report: &mut ValidationReport) -> Option<Position> {
    let inner = match obj.get("position") {
        None | Some(Value::Null) => return None,
        Some(Value::Object(inner)) => inner,
        Some(other) => {
            report.error(
                IssueType::TypeMismatch,
                "position",
                format!("expected object, got {}", type_name(other)),
            );
            return None;
        }
    };

    let mut coord = |axis: &str, required: bool| -> Option<f64> {
        let mut local = ValidationReport::new();
        let v = number(inner, axis, required, &mut local);
        for mut issue in local.errors {
            issue.field = Some(format!("position.{}", axis));
            report.add_error(issue);
        }
        v
    };
    let x = coord("x", true);
    let y = coord("y", true);
    let z = coord("z", false).unwrap_or(0.0);
    Some(Position::new(x?, y?, z))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
