//! Anomaly Detector stage
//!
//! ## Overview
//!
//! Owns every per-sensor and per-zone baseline and history and turns the
//! validated reading stream (and closed zone windows) into two outputs:
//!
//! - [`Anomaly`] events for observers, one per firing detector
//! - [`Observation`]s for the alert state machines, one per alert kind on
//!   every in-order reading, firing or not, so machines can also see a
//!   condition go away
//!
//! ```text
//!   Reading ──→ score vs baseline ──→ update baseline ──→ push history
//!                    │                                        │
//!                    ▼                                        ▼
//!              Statistical                  Oscillation / GradualRise / Correlation
//!                    │                                        │
//!                    └──────────────┬─────────────────────────┘
//!                                   ▼
//!                     Detection { anomalies, observations }
//! ```
//!
//! ## Observation metrics
//!
//! | Alert kind | Metric |
//! |------------|--------|
//! | `HighTemperature`, `LowTemperature` | reading value (zone: window mean) |
//! | `AnomalyScore` | point score, 0 while the baseline is immature |
//! | `Oscillation`, `GradualRise`, `Correlation` | matcher confidence, 0 when not firing or not evaluable |
//!
//! ## Two baselines
//!
//! Scores are computed against this detector's [`TrailingBaseline`]: a
//! time-bounded mean and deviation over the last `baseline_horizon_ms`,
//! read *before* the scored value is folded in. The `rollingMean` and
//! `rollingStdDev` on a registry `SensorState` are a separate
//! exponentially weighted summary for dashboards; they already include the
//! newest reading and never feed a score. [`AnomalyDetector::baseline`]
//! exposes the scoring baseline, and every statistical [`Anomaly`] carries
//! its mean as `expected`.
//!
//! Out-of-order readings still feed the baseline but produce no pattern
//! evaluation and no observations: alert dwell runs on event time, and a
//! step backwards in time would corrupt it.
//!
//! The detector is a single-owner stage; it is not shared between tasks.

use std::collections::HashMap;
use std::sync::Arc;

use thermoguard_core::{
    AlertKind, Anomaly, AnomalyConfig, AnomalyKind, Entity, Observation, PipelineMetrics, Reading,
    SensorRegistry, Severity, Timestamp, Window,
};

use crate::baseline::{BaselineStats, TrailingBaseline};
use crate::history::{History, Sample};
use crate::patterns::{
    correlation, GradualRiseMatcher, OscillationMatcher, SeriesMatcher, FIRING_CONFIDENCE,
};
use crate::scoring::{self, PointScore};

/// Matcher confidence at which a pattern anomaly is critical-grade
pub const CRITICAL_CONFIDENCE: f64 = 0.9;

/// What one input produced
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Detection {
    pub anomalies: Vec<Anomaly>,
    pub observations: Vec<Observation>,
}

impl Detection {
    pub fn is_empty(&self) -> bool {
        self.anomalies.is_empty() && self.observations.is_empty()
    }
}

#[derive(Debug, Clone)]
struct SensorTrack {
    baseline: TrailingBaseline,
    history: History,
}

/// Per-sensor and per-zone anomaly detection
#[derive(Debug)]
pub struct AnomalyDetector {
    config: AnomalyConfig,
    oscillation: OscillationMatcher,
    gradual_rise: GradualRiseMatcher,

    registry: Arc<SensorRegistry>,
    metrics: Arc<PipelineMetrics>,

    sensors: HashMap<String, SensorTrack>,
    zones: HashMap<String, TrailingBaseline>,

    /// Neighbour lists, valid for `geometry_seen`
    neighbors: HashMap<String, Vec<String>>,
    geometry_seen: u64,
}

/// Statistical confidence from a score
///
/// Chebyshev: at most `1/k²` of any distribution lies `k` standard
/// deviations from its mean.
fn statistical_confidence(score: f64) -> f64 {
    if score <= 1.0 {
        0.0
    } else {
        (1.0 - 1.0 / (score * score)).clamp(0.0, 1.0)
    }
}

fn pattern_severity(confidence: f64) -> Severity {
    if confidence >= CRITICAL_CONFIDENCE {
        Severity::Critical
    } else {
        Severity::Warning
    }
}

impl AnomalyDetector {
    pub fn new(
        config: &AnomalyConfig,
        registry: Arc<SensorRegistry>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            config: config.clone(),
            oscillation: OscillationMatcher::new(&config.oscillation),
            gradual_rise: GradualRiseMatcher::new(&config.gradual_rise),
            geometry_seen: registry.geometry_version(),
            registry,
            metrics,
            sensors: HashMap::new(),
            zones: HashMap::new(),
            neighbors: HashMap::new(),
        }
    }

    pub fn config(&self) -> &AnomalyConfig {
        &self.config
    }

    /// Baseline the next reading of `sensor_id` will be scored against
    pub fn baseline(&self, sensor_id: &str) -> Option<BaselineStats> {
        self.sensors.get(sensor_id).map(|track| track.baseline.stats())
    }

    fn new_baseline(&self) -> TrailingBaseline {
        TrailingBaseline::new(self.config.baseline_horizon_ms, self.config.baseline_buckets)
    }

    /// Score, update and pattern-match one validated reading
    pub fn observe_reading(&mut self, reading: &Reading) -> Detection {
        let now = reading.timestamp;
        let entity = Entity::sensor(reading.sensor_id.as_str(), reading.zone_id.as_str());
        let neighbors = if self.config.correlation.enabled {
            self.neighbors_of(&reading.sensor_id)
        } else {
            Vec::new()
        };

        let fresh = self.new_baseline();
        let track = self
            .sensors
            .entry(reading.sensor_id.clone())
            .or_insert_with(|| SensorTrack {
                baseline: fresh,
                history: History::new(),
            });

        let baseline = track.baseline.stats();
        let point = scoring::score(reading.value, &baseline, &self.config);
        track.baseline.observe(now, reading.value);
        let in_order = track.history.push(Sample::new(now, reading.value));

        let mut detection = Detection::default();
        if let Some(point) = point {
            if let Some(anomaly) = self.statistical(&entity, &point, reading.value, now) {
                detection.anomalies.push(anomaly);
            }
        }
        if !in_order {
            log::debug!(
                "Out-of-order reading {}@{}: baseline only",
                reading.sensor_id,
                now
            );
            self.record(&detection);
            return detection;
        }

        let expected = point.map(|p| p.expected);
        let track = &self.sensors[&reading.sensor_id];

        let oscillation = self
            .config
            .oscillation
            .enabled
            .then(|| self.oscillation.evaluate(&track.history, now))
            .flatten();
        let gradual_rise = self
            .config
            .gradual_rise
            .enabled
            .then(|| self.gradual_rise.evaluate(&track.history, now))
            .flatten();
        let correlated = self
            .config
            .correlation
            .enabled
            .then(|| {
                correlation(
                    &self.config.correlation,
                    &track.history,
                    neighbors
                        .iter()
                        .filter_map(|id| self.sensors.get(id))
                        .map(|t| &t.history),
                )
            })
            .flatten()
            .map(|m| m.confidence);

        for (kind, confidence) in [
            (AnomalyKind::Oscillation, oscillation),
            (AnomalyKind::GradualRise, gradual_rise),
            (AnomalyKind::Correlation, correlated),
        ] {
            if let Some(confidence) = confidence.filter(|&c| c >= FIRING_CONFIDENCE) {
                detection.anomalies.push(Anomaly {
                    entity: entity.clone(),
                    kind,
                    severity: pattern_severity(confidence),
                    score: confidence,
                    confidence,
                    value: reading.value,
                    expected,
                    timestamp: now,
                });
            }
        }

        let metrics = [
            (AlertKind::HighTemperature, reading.value),
            (AlertKind::LowTemperature, reading.value),
            (AlertKind::AnomalyScore, point.map_or(0.0, |p| p.score)),
            (AlertKind::Oscillation, oscillation.unwrap_or(0.0)),
            (AlertKind::GradualRise, gradual_rise.unwrap_or(0.0)),
            (AlertKind::Correlation, correlated.unwrap_or(0.0)),
        ];
        detection.observations = metrics
            .into_iter()
            .map(|(kind, metric)| Observation::new(entity.clone(), kind, metric, now))
            .collect();

        self.record(&detection);
        detection
    }

    /// Score a closed zone window's mean against the zone baseline
    ///
    /// Sensor windows and empty windows produce nothing; an empty window is
    /// missing data, not a reading of zero.
    pub fn observe_window(&mut self, window: &Window) -> Detection {
        let mean = match (window.sensor_id.as_ref(), window.mean()) {
            (None, Some(mean)) => mean,
            _ => return Detection::default(),
        };
        let now = window.bucket_end();
        let entity = Entity::zone(window.zone_id.as_str());

        let fresh = self.new_baseline();
        let baseline = self.zones.entry(window.zone_id.clone()).or_insert(fresh);
        let point = scoring::score(mean, &baseline.stats(), &self.config);
        baseline.observe(window.bucket_start, mean);

        let mut detection = Detection::default();
        if let Some(anomaly) = point.and_then(|p| self.statistical(&entity, &p, mean, now)) {
            detection.anomalies.push(anomaly);
        }
        detection.observations = vec![
            Observation::new(entity.clone(), AlertKind::HighTemperature, mean, now),
            Observation::new(entity.clone(), AlertKind::LowTemperature, mean, now),
            Observation::new(entity, AlertKind::AnomalyScore, point.map_or(0.0, |p| p.score), now),
        ];

        self.record(&detection);
        detection
    }

    fn statistical(
        &self,
        entity: &Entity,
        point: &PointScore,
        value: f64,
        now: Timestamp,
    ) -> Option<Anomaly> {
        let severity = point.grade(&self.config)?;
        Some(Anomaly {
            entity: entity.clone(),
            kind: AnomalyKind::Statistical,
            severity,
            score: point.score,
            confidence: statistical_confidence(point.score),
            value,
            expected: Some(point.expected),
            timestamp: now,
        })
    }

    fn record(&self, detection: &Detection) {
        for anomaly in &detection.anomalies {
            self.metrics.record_anomaly();
            log::debug!(
                "{} anomaly {} on {}: value {:.2} score {:.2}",
                anomaly.severity,
                anomaly.kind.name(),
                anomaly.entity,
                anomaly.value,
                anomaly.score
            );
        }
    }

    /// Neighbour ids within the correlation radius, cached per geometry
    fn neighbors_of(&mut self, sensor_id: &str) -> Vec<String> {
        let geometry = self.registry.geometry_version();
        if geometry != self.geometry_seen {
            self.neighbors.clear();
            self.geometry_seen = geometry;
        }
        if let Some(ids) = self.neighbors.get(sensor_id) {
            return ids.clone();
        }
        let ids = self
            .registry
            .neighbors_within(sensor_id, self.config.correlation.radius);
        self.neighbors.insert(sensor_id.to_string(), ids.clone());
        ids
    }

    /// Drop all state kept for a sensor
    pub fn forget_sensor(&mut self, sensor_id: &str) -> bool {
        self.neighbors.remove(sensor_id);
        self.sensors.remove(sensor_id).is_some()
    }

    pub fn tracked_sensors(&self) -> usize {
        self.sensors.len()
    }

    pub fn tracked_zones(&self) -> usize {
        self.zones.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use thermoguard_core::{Position, ValidatorConfig};

    fn setup() -> (AnomalyDetector, Arc<PipelineMetrics>) {
        setup_with(&AnomalyConfig::default())
    }

    fn setup_with(config: &AnomalyConfig) -> (AnomalyDetector, Arc<PipelineMetrics>) {
        let registry = Arc::new(SensorRegistry::new(&ValidatorConfig::default()));
        registry.register("a", "z", Position::planar(0.0, 0.0));
        registry.register("b", "z", Position::planar(1.0, 0.0));
        registry.register("c", "z", Position::planar(0.0, 1.0));
        registry.register("far", "z", Position::planar(100.0, 100.0));
        let metrics = Arc::new(PipelineMetrics::new());
        (
            AnomalyDetector::new(config, registry, metrics.clone()),
            metrics,
        )
    }

    fn reading(id: &str, ts: Timestamp, value: f64) -> Reading {
        Reading::celsius(id, "z", Position::planar(0.0, 0.0), ts, value)
    }

    fn metric(detection: &Detection, kind: AlertKind) -> f64 {
        detection
            .observations
            .iter()
            .find(|o| o.kind == kind)
            .map(|o| o.metric)
            .unwrap()
    }

    #[test]
    fn spike_after_stable_baseline_is_critical() {
        let mut config = AnomalyConfig::default();
        config.oscillation.enabled = false;
        config.gradual_rise.enabled = false;
        let (mut detector, metrics) = setup_with(&config);
        // Baseline alternating 21/23: mean 22, std dev 1
        for i in 0..20 {
            let v = if i % 2 == 0 { 21.0 } else { 23.0 };
            let d = detector.observe_reading(&reading("far", i * 1000, v));
            assert!(d.anomalies.is_empty(), "unexpected anomaly at {}", i);
        }

        let d = detector.observe_reading(&reading("far", 20_000, 26.0));
        let anomaly = d
            .anomalies
            .iter()
            .find(|a| a.kind == AnomalyKind::Statistical)
            .unwrap();
        assert!((anomaly.score - 4.0).abs() < 1e-9);
        assert_eq!(anomaly.severity, Severity::Critical);
        assert!((anomaly.expected.unwrap() - 22.0).abs() < 1e-9);
        assert!(anomaly.confidence > 0.9);
        assert!((metric(&d, AlertKind::AnomalyScore) - 4.0).abs() < 1e-9);
        assert!(metrics.snapshot().anomalies >= 1);
    }

    #[test]
    fn score_uses_trailing_baseline_before_the_scored_value() {
        let mut config = AnomalyConfig::default();
        config.oscillation.enabled = false;
        config.gradual_rise.enabled = false;
        let (mut detector, _) = setup_with(&config);
        assert!(detector.baseline("far").is_none());

        for i in 0..20 {
            let v = if i % 2 == 0 { 21.0 } else { 23.0 };
            detector.observe_reading(&reading("far", i * 1000, v));
        }
        let before = detector.baseline("far").unwrap();
        assert_eq!(before.samples, 20);

        let d = detector.observe_reading(&reading("far", 20_000, 30.0));
        let anomaly = d
            .anomalies
            .iter()
            .find(|a| a.kind == AnomalyKind::Statistical)
            .unwrap();
        assert_eq!(anomaly.expected, Some(before.mean));
        assert!((anomaly.score - (30.0 - before.mean) / before.std_dev).abs() < 1e-9);

        // The spike is folded in only after scoring
        let after = detector.baseline("far").unwrap();
        assert_eq!(after.samples, 21);
        assert!(after.mean > before.mean);
    }

    #[test]
    fn every_reading_observes_all_kinds() {
        let (mut detector, _) = setup();
        let d = detector.observe_reading(&reading("a", 0, 24.5));
        assert_eq!(d.observations.len(), AlertKind::ALL.len());
        assert_eq!(metric(&d, AlertKind::HighTemperature), 24.5);
        assert_eq!(metric(&d, AlertKind::AnomalyScore), 0.0);
        assert_eq!(metric(&d, AlertKind::Oscillation), 0.0);
    }

    #[test]
    fn out_of_order_reading_is_baseline_only() {
        let (mut detector, _) = setup();
        detector.observe_reading(&reading("a", 10_000, 22.0));
        let d = detector.observe_reading(&reading("a", 5_000, 22.0));
        assert!(d.observations.is_empty());
    }

    #[test]
    fn oscillating_sensor_is_flagged() {
        let (mut detector, _) = setup();
        let mut last = Detection::default();
        for i in 0..8 {
            let v = if i % 2 == 0 { 20.0 } else { 23.0 };
            last = detector.observe_reading(&reading("far", i * 10_000, v));
        }
        assert!(last.anomalies.iter().any(|a| a.kind == AnomalyKind::Oscillation));
        assert!(metric(&last, AlertKind::Oscillation) >= FIRING_CONFIDENCE);
    }

    #[test]
    fn diverging_neighbor_is_flagged() {
        let (mut detector, _) = setup();
        let mut last = Detection::default();
        for i in 0..10 {
            let t = i * 60_000;
            detector.observe_reading(&reading("b", t, 20.0 + i as f64 * 0.5));
            detector.observe_reading(&reading("c", t, 20.0 + i as f64 * 0.5));
            last = detector.observe_reading(&reading("a", t, 25.0 - i as f64 * 0.5));
        }
        assert!(last.anomalies.iter().any(|a| a.kind == AnomalyKind::Correlation));
        assert_eq!(metric(&last, AlertKind::Correlation), 1.0);
    }

    #[test]
    fn zone_windows_skip_empty_and_sensor_windows() {
        let (mut detector, _) = setup();
        let mut window = Window {
            zone_id: "z".to_string(),
            sensor_id: None,
            bucket_start: 0,
            bucket_duration: 60_000,
            count: 0,
            sum: 0.0,
            max: None,
            min: None,
        };
        assert!(detector.observe_window(&window).is_empty());

        window.count = 2;
        window.sum = 44.0;
        window.max = Some(23.0);
        window.min = Some(21.0);
        let d = detector.observe_window(&window);
        assert_eq!(d.observations.len(), 3);
        assert_eq!(d.observations[0].entity, Entity::zone("z"));
        assert_eq!(d.observations[0].metric, 22.0);
        assert_eq!(d.observations[0].timestamp, 60_000);

        window.sensor_id = Some("a".to_string());
        assert!(detector.observe_window(&window).is_empty());
        assert_eq!(detector.tracked_zones(), 1);
    }
}
