//! Derived events
//!
//! ## Overview
//!
//! Everything the pipeline produces for observers is a [`DerivedEvent`]:
//!
//! ```text
//!   Validator ──────────→ Reading  ┐
//!   Window Aggregator ──→ Window   ├──→ Fan-out ──→ subscribers
//!   Anomaly Detector ───→ Anomaly  │
//!   Alert State Machine → Alert    ┘
//! ```
//!
//! Each event knows its topic, the zone and sensor it concerns (if any) and
//! its severity, which is all the fan-out needs to evaluate subscription
//! filters without looking inside the payload.
//!
//! ## Severity
//!
//! Severities are ordered `Info < Warning < Critical` so a subscription's
//! `minSeverity` is a plain comparison.

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::alerts::AlertEvent;
use crate::reading::Reading;
use crate::time::Timestamp;
use crate::window::Window;

/// Event severity, ordered
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "info" => Some(Severity::Info),
            "warning" => Some(Severity::Warning),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Subscription topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topic {
    Readings,
    Windows,
    Anomalies,
    Alerts,
}

impl Topic {
    pub const ALL: [Topic; 4] = [Topic::Readings, Topic::Windows, Topic::Anomalies, Topic::Alerts];

    /// Accepts both the topic name and the event type name
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "readings" | "reading" => Some(Topic::Readings),
            "windows" | "window" => Some(Topic::Windows),
            "anomalies" | "anomaly" => Some(Topic::Anomalies),
            "alerts" | "alert" => Some(Topic::Alerts),
            _ => None,
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Topic::Readings => "readings",
            Topic::Windows => "windows",
            Topic::Anomalies => "anomalies",
            Topic::Alerts => "alerts",
        }
    }

    /// Event `type` carried on this topic
    pub const fn event_type(&self) -> &'static str {
        match self {
            Topic::Readings => "reading",
            Topic::Windows => "window",
            Topic::Anomalies => "anomaly",
            Topic::Alerts => "alert",
        }
    }
}

/// The thing an anomaly or alert is about
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Entity {
    #[serde(rename_all = "camelCase")]
    Sensor { sensor_id: String, zone_id: String },
    #[serde(rename_all = "camelCase")]
    Zone { zone_id: String },
}

impl Entity {
    pub fn sensor(sensor_id: impl Into<String>, zone_id: impl Into<String>) -> Self {
        Entity::Sensor {
            sensor_id: sensor_id.into(),
            zone_id: zone_id.into(),
        }
    }

    pub fn zone(zone_id: impl Into<String>) -> Self {
        Entity::Zone {
            zone_id: zone_id.into(),
        }
    }

    pub fn zone_id(&self) -> &str {
        match self {
            Entity::Sensor { zone_id, .. } | Entity::Zone { zone_id } => zone_id,
        }
    }

    pub fn sensor_id(&self) -> Option<&str> {
        match self {
            Entity::Sensor { sensor_id, .. } => Some(sensor_id),
            Entity::Zone { .. } => None,
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entity::Sensor { sensor_id, .. } => write!(f, "sensor:{}", sensor_id),
            Entity::Zone { zone_id } => write!(f, "zone:{}", zone_id),
        }
    }
}

/// Which detector flagged an anomaly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AnomalyKind {
    /// Point deviation from the trailing baseline
    Statistical,
    /// Repeated direction changes with significant amplitude
    Oscillation,
    /// Sustained positive trend
    GradualRise,
    /// Series no longer tracking its spatial neighbours
    Correlation,
}

impl AnomalyKind {
    pub const fn name(&self) -> &'static str {
        match self {
            AnomalyKind::Statistical => "statistical",
            AnomalyKind::Oscillation => "oscillation",
            AnomalyKind::GradualRise => "gradual_rise",
            AnomalyKind::Correlation => "correlation",
        }
    }
}

/// A flagged deviation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Anomaly {
    pub entity: Entity,
    pub kind: AnomalyKind,
    pub severity: Severity,
    /// Anomaly score for statistical anomalies, matcher confidence otherwise
    pub score: f64,
    /// In `[0, 1]`
    pub confidence: f64,
    /// Observed value (reading or window mean)
    pub value: f64,
    /// Baseline mean the value was compared against, when there is one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<f64>,
    pub timestamp: Timestamp,
}

/// Anything published to subscribers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DerivedEvent {
    Reading(Reading),
    Window(Window),
    Anomaly(Anomaly),
    Alert(AlertEvent),
}

impl DerivedEvent {
    pub fn topic(&self) -> Topic {
        match self {
            DerivedEvent::Reading(_) => Topic::Readings,
            DerivedEvent::Window(_) => Topic::Windows,
            DerivedEvent::Anomaly(_) => Topic::Anomalies,
            DerivedEvent::Alert(_) => Topic::Alerts,
        }
    }

    /// Event time: reading time, window end, detection time
    pub fn timestamp(&self) -> Timestamp {
        match self {
            DerivedEvent::Reading(r) => r.timestamp,
            DerivedEvent::Window(w) => w.bucket_end(),
            DerivedEvent::Anomaly(a) => a.timestamp,
            DerivedEvent::Alert(a) => a.timestamp,
        }
    }

    pub fn zone_id(&self) -> Option<&str> {
        match self {
            DerivedEvent::Reading(r) => Some(&r.zone_id),
            DerivedEvent::Window(w) => Some(&w.zone_id),
            DerivedEvent::Anomaly(a) => Some(a.entity.zone_id()),
            DerivedEvent::Alert(a) => Some(a.entity.zone_id()),
        }
    }

    pub fn sensor_id(&self) -> Option<&str> {
        match self {
            DerivedEvent::Reading(r) => Some(&r.sensor_id),
            DerivedEvent::Window(w) => w.sensor_id.as_deref(),
            DerivedEvent::Anomaly(a) => a.entity.sensor_id(),
            DerivedEvent::Alert(a) => a.entity.sensor_id(),
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            DerivedEvent::Reading(_) | DerivedEvent::Window(_) => Severity::Info,
            DerivedEvent::Anomaly(a) => a.severity,
            DerivedEvent::Alert(a) => a.severity(),
        }
    }
}

impl From<Reading> for DerivedEvent {
    fn from(reading: Reading) -> Self {
        DerivedEvent::Reading(reading)
    }
}

impl From<Window> for DerivedEvent {
    fn from(window: Window) -> Self {
        DerivedEvent::Window(window)
    }
}

impl From<Anomaly> for DerivedEvent {
    fn from(anomaly: Anomaly) -> Self {
        DerivedEvent::Anomaly(anomaly)
    }
}

impl From<AlertEvent> for DerivedEvent {
    fn from(alert: AlertEvent) -> Self {
        DerivedEvent::Alert(alert)
    }
}
