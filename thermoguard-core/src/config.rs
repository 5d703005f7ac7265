//! Pipeline configuration
//!
//! Every tunable lives in one explicit [`PipelineConfig`] tree that is passed
//! to each component at construction. Nothing reads ambient global state.
//!
//! All structs deserialize from JSON with per-field defaults, so a deployment
//! file only needs to mention what it changes:
//!
//! ```rust
//! use thermoguard_core::config::PipelineConfig;
//!
//! let config = PipelineConfig::from_json_str(r#"{
//!     "window": { "durationMs": 30000 },
//!     "alerts": { "highTemperature": { "warning": 27.0, "critical": 32.0 } }
//! }"#).unwrap();
//!
//! assert_eq!(config.window.duration_ms, 30_000);
//! assert_eq!(config.validator.max_celsius, 150.0);
//! ```
//!
//! Presets follow the deployment profiles we see most often
//! ([`PipelineConfig::data_center`], [`PipelineConfig::cold_storage`]).

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{TelemetryError, TelemetryResult};

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PipelineConfig {
    pub validator: ValidatorConfig,
    pub mesh: MeshConfig,
    pub window: WindowConfig,
    pub anomaly: AnomalyConfig,
    pub alerts: AlertConfig,
    pub fanout: FanoutConfig,
    pub queues: QueueConfig,
}

/// Reading validator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ValidatorConfig {
    /// Lowest physically plausible temperature (°C)
    pub min_celsius: f64,
    /// Highest physically plausible temperature (°C)
    pub max_celsius: f64,
    /// Register unknown sensors from the position in their first reading
    pub auto_register: bool,
    /// Recent timestamps remembered per sensor for duplicate detection
    pub duplicate_memory: usize,
    /// Smoothing factor of the per-sensor rolling mean/stddev
    pub ewma_alpha: f64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            min_celsius: -50.0,
            max_celsius: 150.0,
            auto_register: false,
            duplicate_memory: 32,
            ewma_alpha: 0.1,
        }
    }
}

/// Mesh and interpolation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MeshConfig {
    /// Nearest vertices used by the outside-hull fallback
    pub idw_neighbors: usize,
    /// Inverse distance weighting exponent
    pub idw_power: f64,
    /// Confidence reported for extrapolated (outside hull) estimates
    pub extrapolated_confidence: f64,
    /// Confidence reported for nearest-neighbor degraded estimates
    pub degraded_confidence: f64,
    /// Positions closer than this are treated as the same vertex
    pub coincident_epsilon: f64,
    /// Rasterization worker threads, 0 = one per CPU
    pub raster_workers: usize,
    /// Largest column or row count a raster request is served at
    pub max_raster_resolution: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            idw_neighbors: 3,
            idw_power: 2.0,
            extrapolated_confidence: 0.5,
            degraded_confidence: 0.1,
            coincident_epsilon: 1e-9,
            raster_workers: 0,
            max_raster_resolution: 1024,
        }
    }
}

/// Tumbling window settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WindowConfig {
    /// Bucket length in milliseconds
    pub duration_ms: i64,
    /// Extra processing time a bucket stays open after its end
    pub grace_ms: i64,
    /// Also aggregate per sensor, not only per zone
    pub per_sensor: bool,
    /// Cap on consecutive empty buckets emitted for an idle key
    pub max_empty_buckets: usize,
    /// Background ticker period
    pub tick_interval_ms: u64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            duration_ms: 60_000,
            grace_ms: 0,
            per_sensor: false,
            max_empty_buckets: 60,
            tick_interval_ms: 1_000,
        }
    }
}

/// Anomaly and pattern detector settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AnomalyConfig {
    /// Score above which a reading is a statistical anomaly
    pub warning_score: f64,
    /// Score above which an anomaly is critical-grade
    pub critical_score: f64,
    /// Floor for the standard deviation in the score denominator
    pub epsilon: f64,
    /// Trailing horizon of the per-sensor baseline
    pub baseline_horizon_ms: i64,
    /// Number of sub-buckets the horizon is split into
    pub baseline_buckets: usize,
    /// Samples required before a baseline is trusted
    pub min_baseline_samples: u64,
    pub oscillation: OscillationConfig,
    pub gradual_rise: GradualRiseConfig,
    pub correlation: CorrelationConfig,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            warning_score: 2.0,
            critical_score: 3.0,
            epsilon: 1e-6,
            baseline_horizon_ms: 24 * 60 * 60 * 1000,
            baseline_buckets: 24,
            min_baseline_samples: 10,
            oscillation: OscillationConfig::default(),
            gradual_rise: GradualRiseConfig::default(),
            correlation: CorrelationConfig::default(),
        }
    }
}

/// Oscillation matcher settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OscillationConfig {
    pub enabled: bool,
    /// Look-back window in milliseconds
    pub window_ms: i64,
    /// Minimum sign changes of the first derivative
    pub min_sign_changes: usize,
    /// Minimum peak-to-peak amplitude (°C)
    pub amplitude_floor: f64,
}

impl Default for OscillationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_ms: 5 * 60 * 1000,
            min_sign_changes: 3,
            amplitude_floor: 0.5,
        }
    }
}

/// Gradual rise matcher settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GradualRiseConfig {
    pub enabled: bool,
    /// Sliding window for the linear fit
    pub window_ms: i64,
    /// Minimum samples inside the window
    pub min_samples: usize,
    /// Minimum sustained slope in °C per minute
    pub rate_floor_per_min: f64,
}

impl Default for GradualRiseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_ms: 15 * 60 * 1000,
            min_samples: 5,
            rate_floor_per_min: 0.2,
        }
    }
}

/// Neighbor correlation matcher settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CorrelationConfig {
    pub enabled: bool,
    /// Sensors within this planar distance are neighbors
    pub radius: f64,
    /// Samples compared per series
    pub min_samples: usize,
    /// Mean neighbor correlation below which the sensor is flagged
    pub min_correlation: f64,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            radius: 5.0,
            min_samples: 8,
            min_correlation: 0.3,
        }
    }
}

/// Direction in which a metric is considered bad
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Condition holds when the metric is at or above the threshold
    Above,
    /// Condition holds when the metric is at or below the threshold
    Below,
}

/// Thresholds and timings for one alert kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AlertRule {
    pub enabled: bool,
    pub direction: Direction,
    /// Entry threshold for Warning
    pub warning: f64,
    /// Entry threshold for Critical
    pub critical: f64,
    /// Width of the band the metric must clear before recovery starts
    pub hysteresis: f64,
    /// How long the warning condition must hold before entering Warning
    pub warning_dwell_ms: i64,
    /// How long the critical condition must hold before entering Critical
    pub critical_dwell_ms: i64,
    /// How long the condition must stay absent before stepping down
    pub recovery_dwell_ms: i64,
    /// Suppress repeat notifications of the same level inside this window
    pub cooldown_ms: i64,
}

impl Default for AlertRule {
    fn default() -> Self {
        Self {
            enabled: true,
            direction: Direction::Above,
            warning: 30.0,
            critical: 35.0,
            hysteresis: 0.5,
            warning_dwell_ms: 30_000,
            critical_dwell_ms: 30_000,
            recovery_dwell_ms: 60_000,
            cooldown_ms: 5 * 60 * 1000,
        }
    }
}

impl AlertRule {
    /// Rule on a `[0, 1]` confidence metric
    pub fn confidence() -> Self {
        Self {
            warning: 0.6,
            critical: 0.9,
            hysteresis: 0.1,
            warning_dwell_ms: 0,
            critical_dwell_ms: 0,
            ..Self::default()
        }
    }

    /// Rule on an anomaly score
    pub fn score() -> Self {
        Self {
            warning: 2.0,
            critical: 3.0,
            hysteresis: 0.5,
            warning_dwell_ms: 10_000,
            critical_dwell_ms: 10_000,
            ..Self::default()
        }
    }

    fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    fn check(&self) -> TelemetryResult<()> {
        let ordered = match self.direction {
            Direction::Above => self.warning <= self.critical,
            Direction::Below => self.warning >= self.critical,
        };
        if !ordered {
            return Err(TelemetryError::InvalidConfig(
                "alert critical threshold must be stricter than warning",
            ));
        }
        if self.hysteresis < 0.0 {
            return Err(TelemetryError::InvalidConfig("alert hysteresis must be >= 0"));
        }
        if self.warning_dwell_ms < 0
            || self.critical_dwell_ms < 0
            || self.recovery_dwell_ms < 0
            || self.cooldown_ms < 0
        {
            return Err(TelemetryError::InvalidConfig("alert timings must be >= 0"));
        }
        Ok(())
    }
}

/// Per-kind alert rules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AlertConfig {
    pub high_temperature: AlertRule,
    pub low_temperature: AlertRule,
    pub anomaly_score: AlertRule,
    pub oscillation: AlertRule,
    pub gradual_rise: AlertRule,
    pub correlation: AlertRule,
    /// Parallel alert evaluation shards
    pub shards: usize,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            high_temperature: AlertRule::default(),
            low_temperature: AlertRule::disabled(),
            anomaly_score: AlertRule::score(),
            oscillation: AlertRule::confidence(),
            gradual_rise: AlertRule::confidence(),
            correlation: AlertRule::confidence(),
            shards: 4,
        }
    }
}

/// Subscription fan-out settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FanoutConfig {
    /// Bounded outbound queue per client
    pub client_queue_capacity: usize,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            client_queue_capacity: 256,
        }
    }
}

/// Inter-stage queue settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueueConfig {
    /// Capacity of every inter-stage queue
    pub capacity: usize,
    /// Bounded wait for a put before the message is dropped and counted
    pub put_timeout_ms: u64,
    /// Readings folded into one published value vector
    pub value_batch: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            put_timeout_ms: 50,
            value_batch: 64,
        }
    }
}

impl PipelineConfig {
    /// Data hall profile (ASHRAE A1 recommended envelope)
    pub fn data_center() -> Self {
        let mut config = Self::default();
        config.validator.min_celsius = -10.0;
        config.validator.max_celsius = 80.0;
        config.alerts.high_temperature.warning = 27.0;
        config.alerts.high_temperature.critical = 32.0;
        config
    }

    /// Refrigerated storage profile (2-8 °C band)
    pub fn cold_storage() -> Self {
        let mut config = Self::default();
        config.validator.min_celsius = -40.0;
        config.validator.max_celsius = 50.0;
        config.alerts.high_temperature.warning = 8.0;
        config.alerts.high_temperature.critical = 12.0;
        config.alerts.high_temperature.hysteresis = 0.1;
        config.alerts.low_temperature = AlertRule {
            direction: Direction::Below,
            warning: 2.0,
            critical: -0.5,
            hysteresis: 0.1,
            ..AlertRule::default()
        };
        config
    }

    /// Parse from a JSON document
    pub fn from_json_str(json: &str) -> TelemetryResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| TelemetryError::schema(format!("config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> TelemetryResult<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            TelemetryError::schema(format!("config {}: {}", path.as_ref().display(), e))
        })?;
        let config = Self::from_json_str(&content)?;
        log::info!("Loaded pipeline configuration from {}", path.as_ref().display());
        Ok(config)
    }

    /// Check internal consistency
    pub fn validate(&self) -> TelemetryResult<()> {
        let v = &self.validator;
        if !(v.min_celsius < v.max_celsius) {
            return Err(TelemetryError::InvalidConfig("validator min must be below max"));
        }
        if !(v.ewma_alpha > 0.0 && v.ewma_alpha <= 1.0) {
            return Err(TelemetryError::InvalidConfig("ewma alpha must be in (0, 1]"));
        }
        if v.duplicate_memory == 0 {
            return Err(TelemetryError::InvalidConfig("duplicate memory must be > 0"));
        }

        let m = &self.mesh;
        if m.idw_neighbors == 0 || !(m.idw_power > 0.0) {
            return Err(TelemetryError::InvalidConfig("idw needs neighbors > 0 and power > 0"));
        }
        if m.max_raster_resolution == 0
            || m.max_raster_resolution.checked_mul(m.max_raster_resolution).is_none()
        {
            return Err(TelemetryError::InvalidConfig("max raster resolution out of range"));
        }

        let w = &self.window;
        if w.duration_ms <= 0 || w.grace_ms < 0 || w.tick_interval_ms == 0 {
            return Err(TelemetryError::InvalidConfig("window timings must be positive"));
        }

        let a = &self.anomaly;
        if !(a.warning_score <= a.critical_score) || !(a.epsilon > 0.0) {
            return Err(TelemetryError::InvalidConfig("anomaly thresholds inconsistent"));
        }
        if a.baseline_buckets == 0 || a.baseline_horizon_ms < a.baseline_buckets as i64 {
            return Err(TelemetryError::InvalidConfig("baseline horizon too short"));
        }

        for rule in [
            &self.alerts.high_temperature,
            &self.alerts.low_temperature,
            &self.alerts.anomaly_score,
            &self.alerts.oscillation,
            &self.alerts.gradual_rise,
            &self.alerts.correlation,
        ] {
            rule.check()?;
        }
        if self.alerts.shards == 0 {
            return Err(TelemetryError::InvalidConfig("alert shards must be > 0"));
        }

        if self.fanout.client_queue_capacity == 0
            || self.queues.capacity == 0
            || self.queues.value_batch == 0
        {
            return Err(TelemetryError::InvalidConfig("queue capacities must be > 0"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        assert!(PipelineConfig::default().validate().is_ok());
        assert!(PipelineConfig::data_center().validate().is_ok());
        assert!(PipelineConfig::cold_storage().validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = PipelineConfig::from_json_str(r#"{"fanout": {"clientQueueCapacity": 8}}"#)
            .unwrap();
        assert_eq!(config.fanout.client_queue_capacity, 8);
        assert_eq!(config.window, WindowConfig::default());
    }

    #[test]
    fn inverted_bounds_rejected() {
        let mut config = PipelineConfig::default();
        config.validator.min_celsius = 200.0;
        assert!(matches!(config.validate(), Err(TelemetryError::InvalidConfig(_))));
    }

    #[test]
    fn raster_resolution_must_be_bounded() {
        let mut config = PipelineConfig::default();
        config.mesh.max_raster_resolution = 0;
        assert!(config.validate().is_err());

        config.mesh.max_raster_resolution = usize::MAX;
        assert!(config.validate().is_err());

        let config =
            PipelineConfig::from_json_str(r#"{"mesh": {"maxRasterResolution": 256}}"#).unwrap();
        assert_eq!(config.mesh.max_raster_resolution, 256);
    }

    #[test]
    fn below_rule_must_be_descending() {
        let mut config = PipelineConfig::cold_storage();
        config.alerts.low_temperature.critical = 5.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"window": {{"durationMs": 5000, "perSensor": true}}}}"#).unwrap();

        let config = PipelineConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.window.duration_ms, 5000);
        assert!(config.window.per_sensor);
    }

    #[test]
    fn malformed_file_is_schema_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();

        let err = PipelineConfig::from_json_file(file.path()).unwrap_err();
        assert!(matches!(err, TelemetryError::InvalidSchema { .. }));
    }
}
