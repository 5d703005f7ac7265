//! Core telemetry engine for ThermoGuard
//!
//! Turns a stream of geolocated temperature readings into a live thermal
//! field, tumbling-window rollups and debounced alerts.
//!
//! Components, leaves first:
//! - [`validator`]: schema, range and registration checks, sensor statistics
//! - [`mesh`]: Delaunay triangulation of sensor positions
//! - [`interpolation`]: snapshot-published field, point queries, rasterization
//! - [`window`]: tumbling window aggregation
//! - [`alerts`]: per-entity alert state machines
//! - [`events`]: the derived events every stage publishes
//!
//! The async runtime wiring these together lives in `thermoguard-connectors`;
//! anomaly detection in `thermoguard-ml`.
//!
//! ```no_run
//! use std::sync::Arc;
//! use thermoguard_core::{InterpolationEngine, MeshConfig, PipelineMetrics, Position};
//!
//! let engine = InterpolationEngine::new(&MeshConfig::default(), Arc::new(PipelineMetrics::new()));
//! engine
//!     .rebuild_mesh(&[
//!         ("rack-01".to_string(), Position::planar(0.0, 0.0)),
//!         ("rack-02".to_string(), Position::planar(10.0, 0.0)),
//!         ("rack-03".to_string(), Position::planar(0.0, 10.0)),
//!     ])
//!     .ok();
//!
//! let estimate = engine.interpolate(5.0, 5.0);
//! println!("{:?} (confidence {})", estimate.value, estimate.confidence);
//! ```

#![deny(unsafe_code)]

pub mod alerts;
pub mod config;
pub mod errors;
pub mod events;
pub mod interpolation;
pub mod mesh;
pub mod metrics;
pub mod queue;
pub mod reading;
pub mod sensor;
pub mod shard;
pub mod time;
pub mod validator;
pub mod window;

// Public API
pub use alerts::{AlertEngine, AlertEvent, AlertKind, AlertLevel, AlertState, Observation, Transition};
pub use config::{
    AlertConfig, AlertRule, AnomalyConfig, Direction, FanoutConfig, MeshConfig, PipelineConfig,
    QueueConfig, ValidatorConfig, WindowConfig,
};
pub use errors::{RejectReason, TelemetryError, TelemetryResult};
pub use events::{Anomaly, AnomalyKind, DerivedEvent, Entity, Severity, Topic};
pub use interpolation::{Estimate, EstimateMethod, FieldSnapshot, GridSpec, InterpolationEngine, Raster};
pub use mesh::{Bounds, Mesh, Point};
pub use metrics::{MetricsSnapshot, PipelineMetrics, Stage};
pub use queue::DropOldestQueue;
pub use reading::{Position, RawReading, Reading, Unit};
pub use sensor::{SensorRegistry, SensorState};
pub use time::{ManualClock, SystemTime, TimeSource, Timestamp};
pub use validator::{ReadingValidator, Validation};
pub use window::{Window, WindowAggregator, WindowKey};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_exists() {
        assert!(!VERSION.is_empty());
    }
}
