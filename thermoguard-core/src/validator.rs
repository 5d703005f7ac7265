//! Reading validator
//!
//! First stage of the pipeline. Turns an untrusted [`RawReading`] into a
//! normalized [`Reading`] or rejects it with a counted reason.
//!
//! ## Validation Layers
//!
//! ### 1. Schema
//! Required fields present and well-formed: non-empty `sensorId` and
//! `zoneId`, a timestamp, a finite value, a known unit, quality in `[0, 1]`.
//!
//! ### 2. Range
//! After conversion to Celsius the value must lie inside the configured
//! physical bounds (default −50…150 °C, wide enough for any HVAC or storage
//! deployment, narrow enough to catch a disconnected probe reading −127).
//!
//! ### 3. Registration
//! The sensor must have a registered position. With `auto_register` enabled
//! the first reading of a new sensor registers it from its reported position.
//!
//! ### 4. Idempotency
//! A reading with the same sensor id and timestamp as a recent one is
//! dropped silently (counted as a duplicate, not as a rejection).

use std::sync::Arc;

use crate::config::ValidatorConfig;
use crate::errors::{TelemetryError, TelemetryResult};
use crate::metrics::PipelineMetrics;
use crate::reading::{RawReading, Reading, Unit};
use crate::sensor::{RecordOutcome, SensorRegistry, SensorState};

/// Result of a successful validation call
#[derive(Debug, Clone, PartialEq)]
pub enum Validation {
    /// Forward downstream
    Accepted {
        reading: Reading,
        /// Sensor statistics after this reading
        state: SensorState,
    },
    /// Already seen; nothing to forward
    Duplicate,
}

/// Validates and normalizes incoming readings
#[derive(Debug, Clone)]
pub struct ReadingValidator {
    /// Minimum valid temperature in Celsius
    min_celsius: f64,

    /// Maximum valid temperature in Celsius
    max_celsius: f64,

    /// Register unknown sensors on first sight
    auto_register: bool,

    registry: Arc<SensorRegistry>,
    metrics: Arc<PipelineMetrics>,
}

impl ReadingValidator {
    pub fn new(
        config: &ValidatorConfig,
        registry: Arc<SensorRegistry>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        // Sanity check: can't have min > max
        let (min, max) = if config.min_celsius > config.max_celsius {
            (config.max_celsius, config.min_celsius)
        } else {
            (config.min_celsius, config.max_celsius)
        };

        Self {
            min_celsius: min.max(-273.15), // Can't go below absolute zero
            max_celsius: max,
            auto_register: config.auto_register,
            registry,
            metrics,
        }
    }

    pub fn registry(&self) -> &Arc<SensorRegistry> {
        &self.registry
    }

    /// Validate, normalize and record a raw reading
    ///
    /// Every rejection is counted by reason and logged before it is returned.
    pub fn validate(&self, raw: RawReading) -> TelemetryResult<Validation> {
        let outcome = self
            .normalize(raw)
            .and_then(|reading| self.record(reading));

        match &outcome {
            Ok(Validation::Accepted { .. }) => self.metrics.record_accepted(),
            Ok(Validation::Duplicate) => self.metrics.record_duplicate(),
            Err(err) => {
                self.metrics.record_rejection(err.reason());
                log::warn!("Rejected reading: {}", err);
            }
        }
        outcome
    }

    fn normalize(&self, raw: RawReading) -> TelemetryResult<Reading> {
        let sensor_id = raw
            .sensor_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| TelemetryError::schema("missing sensorId"))?;
        let timestamp = raw
            .timestamp
            .ok_or_else(|| TelemetryError::schema("missing timestamp"))?;
        let value = raw
            .value
            .ok_or_else(|| TelemetryError::schema("missing value"))?;
        if !value.is_finite() {
            return Err(TelemetryError::schema("value is not a finite number"));
        }

        let unit_name = raw.unit.ok_or_else(|| TelemetryError::schema("missing unit"))?;
        let unit = Unit::parse(&unit_name)
            .ok_or_else(|| TelemetryError::schema(format!("unsupported unit '{}'", unit_name)))?;

        let zone_id = raw
            .zone_id
            .filter(|z| !z.trim().is_empty())
            .ok_or_else(|| TelemetryError::schema("missing zoneId"))?;

        let quality = raw.quality.unwrap_or(1.0);
        if !(0.0..=1.0).contains(&quality) {
            return Err(TelemetryError::schema("quality must be within [0, 1]"));
        }

        if let Some(position) = raw.position {
            if !position.is_finite() {
                return Err(TelemetryError::schema("position is not finite"));
            }
        }

        let celsius = unit.to_celsius(value);
        if celsius < self.min_celsius || celsius > self.max_celsius {
            return Err(TelemetryError::OutOfRange {
                value: celsius,
                min: self.min_celsius,
                max: self.max_celsius,
            });
        }

        let position = match self.registry.position(&sensor_id) {
            Some(registered) => {
                if let Some(reported) = raw.position {
                    if reported != registered {
                        log::debug!(
                            "Sensor {} reported ({}, {}) but is registered at ({}, {})",
                            sensor_id, reported.x, reported.y, registered.x, registered.y
                        );
                    }
                }
                registered
            }
            None => match raw.position {
                Some(reported) if self.auto_register => {
                    self.registry.register(&sensor_id, &zone_id, reported);
                    reported
                }
                _ => return Err(TelemetryError::UnknownSensor { sensor_id }),
            },
        };

        Ok(Reading {
            sensor_id,
            timestamp,
            value: celsius,
            unit: Unit::Celsius,
            quality,
            position,
            zone_id,
        })
    }

    fn record(&self, reading: Reading) -> TelemetryResult<Validation> {
        match self.registry.record(&reading)? {
            RecordOutcome::Accepted(state) => Ok(Validation::Accepted { reading, state }),
            RecordOutcome::Duplicate => {
                log::debug!(
                    "Dropped duplicate reading {}@{}",
                    reading.sensor_id, reading.timestamp
                );
                Ok(Validation::Duplicate)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::RejectReason;
    use crate::reading::Position;

    fn setup(config: ValidatorConfig) -> (ReadingValidator, Arc<PipelineMetrics>) {
        let registry = Arc::new(SensorRegistry::new(&config));
        registry.register("rack-01", "cold-aisle-1", Position::planar(1.0, 2.0));
        let metrics = Arc::new(PipelineMetrics::new());
        (ReadingValidator::new(&config, registry, metrics.clone()), metrics)
    }

    fn raw(sensor: &str, ts: i64, value: f64, unit: &str) -> RawReading {
        RawReading {
            sensor_id: Some(sensor.into()),
            timestamp: Some(ts),
            value: Some(value),
            unit: Some(unit.into()),
            quality: None,
            zone_id: Some("cold-aisle-1".into()),
            position: Some(Position::planar(1.0, 2.0)),
        }
    }

    #[test]
    fn valid_reading_is_normalized() {
        let (validator, metrics) = setup(ValidatorConfig::default());

        let result = validator.validate(raw("rack-01", 1000, 71.6, "fahrenheit")).unwrap();
        match result {
            Validation::Accepted { reading, state } => {
                assert!((reading.value - 22.0).abs() < 1e-9);
                assert_eq!(reading.unit, Unit::Celsius);
                assert_eq!(reading.quality, 1.0);
                assert_eq!(state.samples, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(metrics.accepted(), 1);
    }

    #[test]
    fn missing_fields_are_schema_errors() {
        let (validator, metrics) = setup(ValidatorConfig::default());

        let mut no_id = raw("rack-01", 1000, 20.0, "celsius");
        no_id.sensor_id = None;
        assert!(matches!(validator.validate(no_id), Err(TelemetryError::InvalidSchema { .. })));

        let mut nan = raw("rack-01", 1000, 20.0, "celsius");
        nan.value = Some(f64::NAN);
        assert!(matches!(validator.validate(nan), Err(TelemetryError::InvalidSchema { .. })));

        let unit = raw("rack-01", 1000, 20.0, "rankine");
        assert!(matches!(validator.validate(unit), Err(TelemetryError::InvalidSchema { .. })));

        assert_eq!(metrics.rejections(RejectReason::InvalidSchema), 3);
    }

    #[test]
    fn temperature_out_of_range() {
        let (validator, metrics) = setup(ValidatorConfig::default());

        // Disconnected DS18B20 probes report -127
        let err = validator.validate(raw("rack-01", 1000, -127.0, "celsius")).unwrap_err();
        assert!(matches!(err, TelemetryError::OutOfRange { min, max, .. } if min == -50.0 && max == 150.0));

        assert!(validator.validate(raw("rack-01", 1000, 150.0, "celsius")).is_ok());
        assert_eq!(metrics.rejections(RejectReason::OutOfRange), 1);
    }

    #[test]
    fn unknown_sensor_rejected_unless_auto_register() {
        let (validator, metrics) = setup(ValidatorConfig::default());
        let err = validator.validate(raw("rack-99", 1000, 20.0, "celsius")).unwrap_err();
        assert!(matches!(err, TelemetryError::UnknownSensor { .. }));
        assert_eq!(metrics.rejections(RejectReason::UnknownSensor), 1);

        let (auto, _) = setup(ValidatorConfig {
            auto_register: true,
            ..ValidatorConfig::default()
        });
        assert!(auto.validate(raw("rack-99", 1000, 20.0, "celsius")).is_ok());
        assert!(auto.registry().contains("rack-99"));
    }

    #[test]
    fn duplicate_is_idempotent() {
        let (validator, metrics) = setup(ValidatorConfig::default());

        assert!(matches!(
            validator.validate(raw("rack-01", 5000, 20.0, "celsius")).unwrap(),
            Validation::Accepted { .. }
        ));
        assert_eq!(
            validator.validate(raw("rack-01", 5000, 20.0, "celsius")).unwrap(),
            Validation::Duplicate
        );
        assert_eq!(metrics.accepted(), 1);
        assert_eq!(metrics.snapshot().duplicates, 1);
    }

    #[test]
    fn registered_position_wins() {
        let (validator, _) = setup(ValidatorConfig::default());
        let mut moved = raw("rack-01", 1000, 20.0, "celsius");
        moved.position = Some(Position::planar(50.0, 50.0));

        match validator.validate(moved).unwrap() {
            Validation::Accepted { reading, .. } => {
                assert_eq!(reading.position, Position::planar(1.0, 2.0))
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
