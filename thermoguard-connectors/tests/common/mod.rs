//! Common test utilities for runtime tests
//!
//! - Pipeline builders on a manual clock with a pre-registered layout
//! - Sinks that fail or count
//! - Envelope collection with a bounded wait

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use thermoguard_connectors::{ClientSink, PipelineHandle, SinkError};
use thermoguard_core::{ManualClock, PipelineConfig, Position, RawReading, SensorRegistry, Timestamp};
use thermoguard_schemas::EventEnvelope;

/// Three sensors around a 10 m triangle in one zone
pub fn triangle(zone: &str) -> Vec<(String, Position, String)> {
    vec![
        ("a".to_string(), Position::planar(0.0, 0.0), zone.to_string()),
        ("b".to_string(), Position::planar(10.0, 0.0), zone.to_string()),
        ("c".to_string(), Position::planar(0.0, 10.0), zone.to_string()),
    ]
}

/// Config with only the high temperature alert enabled
pub fn threshold_only_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.alerts.anomaly_score.enabled = false;
    config.alerts.oscillation.enabled = false;
    config.alerts.gradual_rise.enabled = false;
    config.alerts.correlation.enabled = false;
    config
}

/// Running pipeline on a clock parked at zero
///
/// Windows then close on event time only, which keeps scenarios
/// deterministic.
pub fn start(config: PipelineConfig, sensors: &[(String, Position, String)]) -> PipelineHandle {
    let registry = Arc::new(SensorRegistry::new(&config.validator));
    for (id, position, zone) in sensors {
        registry.register(id, zone, *position);
    }
    PipelineHandle::start_with_registry(config, registry, Arc::new(ManualClock::new(0)))
        .expect("valid config")
}

pub fn raw(sensor_id: &str, zone_id: &str, timestamp: Timestamp, value: f64) -> RawReading {
    RawReading {
        sensor_id: Some(sensor_id.to_string()),
        timestamp: Some(timestamp),
        value: Some(value),
        unit: Some("celsius".to_string()),
        quality: None,
        zone_id: Some(zone_id.to_string()),
        position: None,
    }
}

/// Everything a receiver yields until it closes or goes quiet
pub async fn collect(rx: &mut mpsc::Receiver<EventEnvelope>, quiet: Duration) -> Vec<EventEnvelope> {
    let mut out = Vec::new();
    while let Ok(Some(envelope)) = tokio::time::timeout(quiet, rx.recv()).await {
        out.push(envelope);
    }
    out
}

/// Poll `condition` until it holds or `limit` passes
pub async fn eventually<F: Fn() -> bool>(condition: F, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Accepts `ok_for` envelopes, then fails every delivery
pub struct FailingSink {
    ok_for: usize,
    pub delivered: Arc<AtomicUsize>,
}

impl FailingSink {
    pub fn new(ok_for: usize) -> Self {
        Self {
            ok_for,
            delivered: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl ClientSink for FailingSink {
    async fn deliver(&mut self, _envelope: &EventEnvelope) -> Result<(), SinkError> {
        if self.delivered.load(Ordering::SeqCst) >= self.ok_for {
            return Err(SinkError::Transport("connection reset".into()));
        }
        self.delivered.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
