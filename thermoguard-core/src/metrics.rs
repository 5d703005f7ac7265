//! Pipeline Metrics
//!
//! ## Overview
//!
//! Every component reports into one shared [`PipelineMetrics`] instance made
//! of plain atomics. Updating a counter never takes a lock and never blocks
//! the hot path; reading them is a poll that produces a serializable
//! [`MetricsSnapshot`].
//!
//! ## Memory Ordering
//!
//! Counters are statistics, not synchronization: all updates use `Relaxed`.
//! A snapshot is therefore not a single consistent cut across counters, but
//! each individual counter is exact.
//!
//! ## Exposed Metrics
//!
//! | Metric | Source |
//! |--------|--------|
//! | ingest rate | accepted readings over uptime |
//! | rejections by reason | validator, aggregator, ingestion boundary |
//! | queue depth per stage | runtime stage loops |
//! | mesh rebuild count/duration | interpolation engine |
//! | per-client dropped messages | fan-out hub (merged by the runtime) |
//! | active alerts by severity | alert state machine |

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::alerts::AlertLevel;
use crate::errors::RejectReason;

/// Pipeline stages with an input queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Stage {
    Ingest = 0,
    Interpolation = 1,
    Aggregator = 2,
    Detector = 3,
    Alerts = 4,
}

impl Stage {
    pub const COUNT: usize = 5;

    pub const ALL: [Stage; Self::COUNT] = [
        Stage::Ingest,
        Stage::Interpolation,
        Stage::Aggregator,
        Stage::Detector,
        Stage::Alerts,
    ];

    pub const fn name(&self) -> &'static str {
        match self {
            Stage::Ingest => "ingest",
            Stage::Interpolation => "interpolation",
            Stage::Aggregator => "aggregator",
            Stage::Detector => "detector",
            Stage::Alerts => "alerts",
        }
    }
}

/// Queue statistics for one stage
#[derive(Debug, Default)]
pub struct StageStats {
    /// Current queue depth
    depth: AtomicUsize,
    /// Maximum queue depth seen
    max_depth: AtomicUsize,
    /// Messages dropped after a bounded wait
    dropped: AtomicU64,
}

impl StageStats {
    /// Record the current depth, keeping the high watermark
    pub fn set_depth(&self, current: usize) {
        self.depth.store(current, Ordering::Relaxed);

        let mut max = self.max_depth.load(Ordering::Relaxed);
        while current > max {
            match self.max_depth.compare_exchange_weak(
                max,
                current,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => max = actual,
            }
        }
    }

    pub fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self, stage: Stage) -> StageSnapshot {
        StageSnapshot {
            stage: stage.name(),
            depth: self.depth.load(Ordering::Relaxed),
            max_depth: self.max_depth.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Shared counters for the whole pipeline
#[derive(Debug)]
pub struct PipelineMetrics {
    started: Instant,
    accepted: AtomicU64,
    duplicates: AtomicU64,
    rejections: [AtomicU64; RejectReason::COUNT],
    stages: [StageStats; Stage::COUNT],
    mesh_rebuilds: AtomicU64,
    mesh_rebuild_last_us: AtomicU64,
    mesh_rebuild_total_us: AtomicU64,
    value_publishes: AtomicU64,
    degraded_queries: AtomicU64,
    windows_emitted: AtomicU64,
    anomalies: AtomicU64,
    alert_events: AtomicU64,
    suppressed_notifications: AtomicU64,
    active_warning: AtomicI64,
    active_critical: AtomicI64,
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            accepted: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            rejections: Default::default(),
            stages: Default::default(),
            mesh_rebuilds: AtomicU64::new(0),
            mesh_rebuild_last_us: AtomicU64::new(0),
            mesh_rebuild_total_us: AtomicU64::new(0),
            value_publishes: AtomicU64::new(0),
            degraded_queries: AtomicU64::new(0),
            windows_emitted: AtomicU64::new(0),
            anomalies: AtomicU64::new(0),
            alert_events: AtomicU64::new(0),
            suppressed_notifications: AtomicU64::new(0),
            active_warning: AtomicI64::new(0),
            active_critical: AtomicI64::new(0),
        }
    }

    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejection(&self, reason: RejectReason) {
        self.rejections[reason.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn rejections(&self, reason: RejectReason) -> u64 {
        self.rejections[reason.index()].load(Ordering::Relaxed)
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn stage(&self, stage: Stage) -> &StageStats {
        &self.stages[stage as usize]
    }

    pub fn record_mesh_rebuild(&self, took: Duration) {
        let micros = took.as_micros() as u64;
        self.mesh_rebuilds.fetch_add(1, Ordering::Relaxed);
        self.mesh_rebuild_last_us.store(micros, Ordering::Relaxed);
        self.mesh_rebuild_total_us.fetch_add(micros, Ordering::Relaxed);
    }

    pub fn mesh_rebuilds(&self) -> u64 {
        self.mesh_rebuilds.load(Ordering::Relaxed)
    }

    pub fn record_value_publish(&self) {
        self.value_publishes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_degraded_query(&self) {
        self.degraded_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_windows(&self, count: usize) {
        self.windows_emitted.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_anomaly(&self) {
        self.anomalies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_alert_event(&self) {
        self.alert_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_suppressed_notification(&self) {
        self.suppressed_notifications.fetch_add(1, Ordering::Relaxed);
    }

    /// Move one active alert from `from` to `to`
    pub fn record_level_change(&self, from: AlertLevel, to: AlertLevel) {
        if let Some(gauge) = self.level_gauge(from) {
            gauge.fetch_sub(1, Ordering::Relaxed);
        }
        if let Some(gauge) = self.level_gauge(to) {
            gauge.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn active_alerts(&self, level: AlertLevel) -> i64 {
        self.level_gauge(level)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn level_gauge(&self, level: AlertLevel) -> Option<&AtomicI64> {
        match level {
            AlertLevel::Normal => None,
            AlertLevel::Warning => Some(&self.active_warning),
            AlertLevel::Critical => Some(&self.active_critical),
        }
    }

    /// Poll all counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        let uptime = self.started.elapsed();
        let accepted = self.accepted.load(Ordering::Relaxed);
        let secs = uptime.as_secs_f64();

        MetricsSnapshot {
            uptime_ms: uptime.as_millis() as u64,
            accepted,
            ingest_rate_per_sec: if secs > 0.0 { accepted as f64 / secs } else { 0.0 },
            duplicates: self.duplicates.load(Ordering::Relaxed),
            rejections: RejectReason::ALL
                .iter()
                .map(|r| (r.as_str(), self.rejections(*r)))
                .collect(),
            stages: Stage::ALL
                .iter()
                .map(|s| self.stages[*s as usize].snapshot(*s))
                .collect(),
            mesh_rebuilds: self.mesh_rebuilds(),
            mesh_rebuild_last_us: self.mesh_rebuild_last_us.load(Ordering::Relaxed),
            mesh_rebuild_total_us: self.mesh_rebuild_total_us.load(Ordering::Relaxed),
            value_publishes: self.value_publishes.load(Ordering::Relaxed),
            degraded_queries: self.degraded_queries.load(Ordering::Relaxed),
            windows_emitted: self.windows_emitted.load(Ordering::Relaxed),
            anomalies: self.anomalies.load(Ordering::Relaxed),
            alert_events: self.alert_events.load(Ordering::Relaxed),
            suppressed_notifications: self.suppressed_notifications.load(Ordering::Relaxed),
            active_warning: self.active_warning.load(Ordering::Relaxed).max(0) as u64,
            active_critical: self.active_critical.load(Ordering::Relaxed).max(0) as u64,
            client_dropped: BTreeMap::new(),
        }
    }
}

/// Per-stage queue figures
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageSnapshot {
    pub stage: &'static str,
    pub depth: usize,
    pub max_depth: usize,
    pub dropped: u64,
}

/// Point-in-time copy of every counter
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub uptime_ms: u64,
    pub accepted: u64,
    pub ingest_rate_per_sec: f64,
    pub duplicates: u64,
    pub rejections: BTreeMap<&'static str, u64>,
    pub stages: Vec<StageSnapshot>,
    pub mesh_rebuilds: u64,
    pub mesh_rebuild_last_us: u64,
    pub mesh_rebuild_total_us: u64,
    pub value_publishes: u64,
    pub degraded_queries: u64,
    pub windows_emitted: u64,
    pub anomalies: u64,
    pub alert_events: u64,
    pub suppressed_notifications: u64,
    pub active_warning: u64,
    pub active_critical: u64,
    /// Filled in by the fan-out hub owner
    pub client_dropped: BTreeMap<String, u64>,
}

impl MetricsSnapshot {
    pub fn rejection(&self, reason: RejectReason) -> u64 {
        self.rejections.get(reason.as_str()).copied().unwrap_or(0)
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageSnapshot> {
        self.stages.iter().find(|s| s.stage == stage.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejections_counted_per_reason() {
        let metrics = PipelineMetrics::new();
        metrics.record_rejection(RejectReason::OutOfRange);
        metrics.record_rejection(RejectReason::OutOfRange);
        metrics.record_rejection(RejectReason::UnknownSensor);

        let snap = metrics.snapshot();
        assert_eq!(snap.rejection(RejectReason::OutOfRange), 2);
        assert_eq!(snap.rejection(RejectReason::UnknownSensor), 1);
        assert_eq!(snap.rejection(RejectReason::InvalidSchema), 0);
    }

    #[test]
    fn stage_depth_keeps_high_watermark() {
        let metrics = PipelineMetrics::new();
        let stats = metrics.stage(Stage::Detector);
        stats.set_depth(7);
        stats.set_depth(3);

        let snap = metrics.snapshot();
        let detector = snap.stage(Stage::Detector).unwrap();
        assert_eq!(detector.depth, 3);
        assert_eq!(detector.max_depth, 7);
    }

    #[test]
    fn active_alert_gauges_follow_transitions() {
        let metrics = PipelineMetrics::new();
        metrics.record_level_change(AlertLevel::Normal, AlertLevel::Warning);
        metrics.record_level_change(AlertLevel::Warning, AlertLevel::Critical);
        assert_eq!(metrics.active_alerts(AlertLevel::Warning), 0);
        assert_eq!(metrics.active_alerts(AlertLevel::Critical), 1);

        metrics.record_level_change(AlertLevel::Critical, AlertLevel::Normal);
        assert_eq!(metrics.active_alerts(AlertLevel::Critical), 0);
    }

    #[test]
    fn mesh_rebuild_durations_accumulate() {
        let metrics = PipelineMetrics::new();
        metrics.record_mesh_rebuild(Duration::from_micros(150));
        metrics.record_mesh_rebuild(Duration::from_micros(50));

        let snap = metrics.snapshot();
        assert_eq!(snap.mesh_rebuilds, 2);
        assert_eq!(snap.mesh_rebuild_last_us, 50);
        assert_eq!(snap.mesh_rebuild_total_us, 200);
    }
}
