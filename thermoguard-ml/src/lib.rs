//! Anomaly and Pattern Detection for ThermoGuard
//!
//! ## Overview
//!
//! Hard limits (the validator's physical range, the alert thresholds) catch
//! values that are plainly wrong. This crate catches values that are
//! *unusual for this sensor*: a reading four standard deviations from its
//! own 24 h history, a probe that has started hunting, a room that warms a
//! fraction of a degree every minute, a sensor that no longer moves with its
//! neighbours.
//!
//! ## Detectors
//!
//! | Detector | Input | Output |
//! |----------|-------|--------|
//! | Point score | one reading vs trailing baseline | `Statistical` anomaly, `AnomalyScore` metric |
//! | Oscillation | last few minutes of one sensor | `Oscillation` anomaly + confidence |
//! | Gradual rise | last quarter hour of one sensor | `GradualRise` anomaly + confidence |
//! | Correlation | one sensor vs neighbours within a radius | `Correlation` anomaly + confidence |
//! | Zone score | closed zone window mean vs zone baseline | zone `Statistical` anomaly |
//!
//! ## Memory Model
//!
//! Nothing here keeps full history:
//! ```text
//! Per sensor:  baseline  24 Welford buckets × 24 bytes  ≈ 0.6 KB
//!              history   128 samples × 16 bytes         ≈ 2 KB
//! Per zone:    baseline  24 Welford buckets             ≈ 0.6 KB
//! ```
//!
//! ## Integration
//!
//! [`AnomalyDetector`] is one pipeline stage. It consumes validated readings
//! and closed windows and hands back a [`Detection`]: anomaly events for
//! observers, and per-kind observations the alert state machines debounce.
//!
//! ```no_run
//! use std::sync::Arc;
//! use thermoguard_core::{AnomalyConfig, PipelineMetrics, Position, Reading, SensorRegistry, ValidatorConfig};
//! use thermoguard_ml::AnomalyDetector;
//!
//! let registry = Arc::new(SensorRegistry::new(&ValidatorConfig::default()));
//! let mut detector = AnomalyDetector::new(
//!     &AnomalyConfig::default(),
//!     registry,
//!     Arc::new(PipelineMetrics::new()),
//! );
//!
//! let reading = Reading::celsius("rack-01", "hall-a", Position::planar(0.0, 0.0), 0, 22.4);
//! for anomaly in detector.observe_reading(&reading).anomalies {
//!     println!("{} {}", anomaly.kind.name(), anomaly.score);
//! }
//! ```

#![deny(unsafe_code)]

pub mod baseline;
pub mod detector;
pub mod history;
pub mod patterns;
pub mod scoring;

pub use baseline::{BaselineStats, TrailingBaseline, Welford};
pub use detector::{AnomalyDetector, Detection};
pub use history::{History, Sample};
pub use patterns::{GradualRiseMatcher, OscillationMatcher, SeriesMatcher};
pub use scoring::{anomaly_score, PointScore};
