//! Sensor registry and per-sensor rolling state
//!
//! The registry owns one [`SensorState`] per registered sensor. It is the
//! authority on sensor positions: the validator rejects readings from sensors
//! it does not know, and the interpolation engine rebuilds its mesh whenever
//! [`SensorRegistry::geometry_version`] moves.
//!
//! State is sharded by sensor id (see [`crate::shard`]) so readings from
//! different sensors update concurrently without contention.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::config::ValidatorConfig;
use crate::errors::{TelemetryError, TelemetryResult};
use crate::reading::{Position, Reading};
use crate::shard::Sharded;
use crate::time::Timestamp;

/// Default shard count for the registry
pub const DEFAULT_SHARDS: usize = 16;

/// Live statistics of one sensor
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorState {
    pub sensor_id: String,
    pub zone_id: String,
    pub position: Position,
    pub last_value: Option<f64>,
    pub last_timestamp: Option<Timestamp>,
    /// Exponentially weighted mean, including the newest reading
    ///
    /// Reporting only; anomaly scores use the detector's trailing baseline.
    pub rolling_mean: f64,
    /// Exponentially weighted standard deviation
    pub rolling_std_dev: f64,
    /// Accepted readings since registration
    pub samples: u64,
}

impl SensorState {
    fn new(sensor_id: String, zone_id: String, position: Position) -> Self {
        Self {
            sensor_id,
            zone_id,
            position,
            last_value: None,
            last_timestamp: None,
            rolling_mean: 0.0,
            rolling_std_dev: 0.0,
            samples: 0,
        }
    }
}

/// Exponentially weighted mean and variance
///
/// Incremental form (West 1979), O(1) per sample:
/// ```text
/// diff  = x - mean
/// incr  = α · diff
/// mean' = mean + incr
/// var'  = (1 - α) · (var + diff · incr)
/// ```
#[derive(Debug, Clone, Copy, Default)]
struct Ewma {
    mean: f64,
    variance: f64,
    initialized: bool,
}

impl Ewma {
    fn update(&mut self, alpha: f64, x: f64) {
        if !self.initialized {
            self.mean = x;
            self.variance = 0.0;
            self.initialized = true;
            return;
        }
        let diff = x - self.mean;
        let incr = alpha * diff;
        self.mean += incr;
        self.variance = (1.0 - alpha) * (self.variance + diff * incr);
    }

    fn std_dev(&self) -> f64 {
        libm::sqrt(self.variance.max(0.0))
    }
}

#[derive(Debug)]
struct SensorEntry {
    state: SensorState,
    ewma: Ewma,
    /// Recently accepted timestamps, oldest first
    recent: VecDeque<Timestamp>,
}

/// Outcome of recording a reading
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    /// Reading accepted; state after the update
    Accepted(SensorState),
    /// Same sensor and timestamp seen before; dropped
    Duplicate,
}

/// Registry of sensors, sharded by id
#[derive(Debug)]
pub struct SensorRegistry {
    sensors: Sharded<String, SensorEntry>,
    geometry_version: AtomicU64,
    alpha: f64,
    duplicate_memory: usize,
}

impl SensorRegistry {
    pub fn new(config: &ValidatorConfig) -> Self {
        Self::with_shards(config, DEFAULT_SHARDS)
    }

    pub fn with_shards(config: &ValidatorConfig, shards: usize) -> Self {
        Self {
            sensors: Sharded::new(shards),
            geometry_version: AtomicU64::new(0),
            alpha: config.ewma_alpha,
            duplicate_memory: config.duplicate_memory.max(1),
        }
    }

    /// Register or update a sensor
    ///
    /// Returns `true` when the sensor set's geometry changed (new sensor or
    /// moved sensor), which invalidates the current mesh.
    pub fn register(&self, sensor_id: &str, zone_id: &str, position: Position) -> bool {
        let mut shard = self.sensors.lock_for(sensor_id);
        let changed = match shard.get_mut(sensor_id) {
            Some(entry) => {
                entry.state.zone_id = zone_id.to_string();
                if entry.state.position != position {
                    entry.state.position = position;
                    true
                } else {
                    false
                }
            }
            None => {
                shard.insert(
                    sensor_id.to_string(),
                    SensorEntry {
                        state: SensorState::new(
                            sensor_id.to_string(),
                            zone_id.to_string(),
                            position,
                        ),
                        ewma: Ewma::default(),
                        recent: VecDeque::with_capacity(self.duplicate_memory),
                    },
                );
                true
            }
        };
        drop(shard);

        if changed {
            self.geometry_version.fetch_add(1, Ordering::SeqCst);
            log::info!(
                "Sensor {} registered at ({}, {}) in zone {}",
                sensor_id, position.x, position.y, zone_id
            );
        }
        changed
    }

    /// Remove a sensor; returns whether it existed
    pub fn deregister(&self, sensor_id: &str) -> bool {
        let removed = self.sensors.lock_for(sensor_id).remove(sensor_id).is_some();
        if removed {
            self.geometry_version.fetch_add(1, Ordering::SeqCst);
            log::info!("Sensor {} deregistered", sensor_id);
        }
        removed
    }

    /// Move a registered sensor
    pub fn relocate(&self, sensor_id: &str, position: Position) -> TelemetryResult<()> {
        let mut shard = self.sensors.lock_for(sensor_id);
        let entry = shard
            .get_mut(sensor_id)
            .ok_or_else(|| TelemetryError::UnknownSensor {
                sensor_id: sensor_id.to_string(),
            })?;
        if entry.state.position != position {
            entry.state.position = position;
            drop(shard);
            self.geometry_version.fetch_add(1, Ordering::SeqCst);
            log::info!("Sensor {} moved to ({}, {})", sensor_id, position.x, position.y);
        }
        Ok(())
    }

    pub fn contains(&self, sensor_id: &str) -> bool {
        self.sensors.lock_for(sensor_id).contains_key(sensor_id)
    }

    pub fn position(&self, sensor_id: &str) -> Option<Position> {
        self.sensors
            .lock_for(sensor_id)
            .get(sensor_id)
            .map(|e| e.state.position)
    }

    pub fn state(&self, sensor_id: &str) -> Option<SensorState> {
        self.sensors
            .lock_for(sensor_id)
            .get(sensor_id)
            .map(|e| e.state.clone())
    }

    /// Monotonic counter bumped on every add/remove/move
    pub fn geometry_version(&self) -> u64 {
        self.geometry_version.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }

    /// All sensor positions, sorted by id for deterministic mesh builds
    pub fn positions(&self) -> Vec<(String, Position)> {
        let mut out = Vec::new();
        self.sensors.for_each_shard(|shard| {
            out.extend(shard.values().map(|e| (e.state.sensor_id.clone(), e.state.position)));
        });
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Sensors within `radius` of `sensor_id`, excluding itself
    pub fn neighbors_within(&self, sensor_id: &str, radius: f64) -> Vec<String> {
        let Some(origin) = self.position(sensor_id) else {
            return Vec::new();
        };
        self.positions()
            .into_iter()
            .filter(|(id, pos)| id != sensor_id && origin.planar_distance(pos) <= radius)
            .map(|(id, _)| id)
            .collect()
    }

    /// Record an accepted reading
    ///
    /// The reading must already be validated. Duplicates (same sensor and
    /// timestamp as one of the last `duplicate_memory` readings) are dropped
    /// without touching the statistics.
    pub fn record(&self, reading: &Reading) -> TelemetryResult<RecordOutcome> {
        let mut shard = self.sensors.lock_for(reading.sensor_id.as_str());
        let entry = shard
            .get_mut(reading.sensor_id.as_str())
            .ok_or_else(|| TelemetryError::UnknownSensor {
                sensor_id: reading.sensor_id.clone(),
            })?;

        if entry.recent.contains(&reading.timestamp) {
            return Ok(RecordOutcome::Duplicate);
        }
        if entry.recent.len() == self.duplicate_memory {
            entry.recent.pop_front();
        }
        entry.recent.push_back(reading.timestamp);

        entry.ewma.update(self.alpha, reading.value);

        let state = &mut entry.state;
        // Out-of-order readings update statistics but not "last"
        if state.last_timestamp.map_or(true, |t| reading.timestamp >= t) {
            state.last_value = Some(reading.value);
            state.last_timestamp = Some(reading.timestamp);
        }
        state.rolling_mean = entry.ewma.mean;
        state.rolling_std_dev = entry.ewma.std_dev();
        state.samples += 1;

        Ok(RecordOutcome::Accepted(state.clone()))
    }
}
