//! Subscription control messages
//!
//! ```text
//! { "action": "subscribe", "topics": ["alerts", "anomalies"],
//!   "filters": { "zones": ["cold-aisle-2"], "minSeverity": "warning" } }
//! ```
//!
//! A [`ControlMessage`] is the wire form; [`SubscriptionFilter`] is the
//! checked form the fan-out evaluates per event. An event passes when its
//! topic is subscribed and every present filter holds:
//!
//! | Filter | Passes when |
//! |--------|-------------|
//! | `zones` | event has a zone and it is listed |
//! | `sensorIds` | event has a sensor and it is listed |
//! | `minSeverity` | event severity ≥ minimum |
//!
//! Zone-level windows, anomalies and alerts carry no sensor id, so a
//! `sensorIds` filter excludes them. An empty `topics` list subscribes to
//! every topic.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use thermoguard_core::{DerivedEvent, Severity, Topic};

use crate::SchemaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Subscribe,
    Unsubscribe,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Filters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zones: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_severity: Option<String>,
}

/// Wire form of a subscribe or unsubscribe request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlMessage {
    pub action: ControlAction,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub filters: Filters,
}

impl ControlMessage {
    pub fn subscribe(topics: &[Topic]) -> Self {
        Self {
            action: ControlAction::Subscribe,
            topics: topics.iter().map(|t| t.name().to_string()).collect(),
            filters: Filters::default(),
        }
    }

    pub fn unsubscribe() -> Self {
        Self {
            action: ControlAction::Unsubscribe,
            topics: Vec::new(),
            filters: Filters::default(),
        }
    }

    pub fn with_zones<I, S>(mut self, zones: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filters.zones = Some(zones.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_sensors<I, S>(mut self, sensors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filters.sensor_ids = Some(sensors.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_min_severity(mut self, severity: Severity) -> Self {
        self.filters.min_severity = Some(severity.name().to_string());
        self
    }

    pub fn parse(json: &str) -> Result<Self, SchemaError> {
        serde_json::from_str(json).map_err(|e| SchemaError::Parse(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, SchemaError> {
        serde_json::to_string(self).map_err(|e| SchemaError::Encode(e.to_string()))
    }

    /// Checked filter for a subscribe request
    pub fn subscription(&self) -> Result<SubscriptionFilter, SchemaError> {
        let topics = if self.topics.is_empty() {
            Topic::ALL.into_iter().collect()
        } else {
            self.topics
                .iter()
                .map(|name| Topic::parse(name).ok_or_else(|| SchemaError::UnknownTopic(name.clone())))
                .collect::<Result<BTreeSet<_>, _>>()?
        };

        let min_severity = match &self.filters.min_severity {
            Some(name) => {
                Severity::parse(name).ok_or_else(|| SchemaError::UnknownSeverity(name.clone()))?
            }
            None => Severity::Info,
        };

        Ok(SubscriptionFilter {
            topics,
            zones: self.filters.zones.as_ref().map(|z| z.iter().cloned().collect()),
            sensor_ids: self.filters.sensor_ids.as_ref().map(|s| s.iter().cloned().collect()),
            min_severity,
        })
    }
}

/// Checked subscription predicate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionFilter {
    pub topics: BTreeSet<Topic>,
    pub zones: Option<BTreeSet<String>>,
    pub sensor_ids: Option<BTreeSet<String>>,
    pub min_severity: Severity,
}

impl SubscriptionFilter {
    /// Every topic, no filters
    pub fn all() -> Self {
        Self::topics(&Topic::ALL)
    }

    pub fn topics(topics: &[Topic]) -> Self {
        Self {
            topics: topics.iter().copied().collect(),
            zones: None,
            sensor_ids: None,
            min_severity: Severity::Info,
        }
    }

    pub fn with_zones<I, S>(mut self, zones: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.zones = Some(zones.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_sensors<I, S>(mut self, sensors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sensor_ids = Some(sensors.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_min_severity(mut self, severity: Severity) -> Self {
        self.min_severity = severity;
        self
    }

    pub fn matches(&self, event: &DerivedEvent) -> bool {
        if !self.topics.contains(&event.topic()) {
            return false;
        }
        if event.severity() < self.min_severity {
            return false;
        }
        if let Some(zones) = &self.zones {
            match event.zone_id() {
                Some(zone) if zones.contains(zone) => {}
                _ => return false,
            }
        }
        if let Some(sensors) = &self.sensor_ids {
            match event.sensor_id() {
                Some(sensor) if sensors.contains(sensor) => {}
                _ => return false,
            }
        }
        true
    }
}

impl Default for SubscriptionFilter {
    fn default() -> Self {
        Self::all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use thermoguard_core::{Anomaly, AnomalyKind, Entity, Position, Reading};

    fn reading(sensor: &str, zone: &str) -> DerivedEvent {
        Reading::celsius(sensor, zone, Position::planar(0.0, 0.0), 0, 22.0).into()
    }

    fn zone_anomaly(zone: &str, severity: Severity) -> DerivedEvent {
        Anomaly {
            entity: Entity::zone(zone),
            kind: AnomalyKind::Statistical,
            severity,
            score: 3.5,
            confidence: 0.9,
            value: 30.0,
            expected: Some(22.0),
            timestamp: 0,
        }
        .into()
    }

    #[test]
    fn parses_wire_message() {
        let json = r#"{"action":"subscribe","topics":["alerts","anomalies"],
            "filters":{"zones":["cold-aisle-2"],"minSeverity":"warning"}}"#;
        let msg = ControlMessage::parse(json).unwrap();
        assert_eq!(msg.action, ControlAction::Subscribe);

        let filter = msg.subscription().unwrap();
        assert_eq!(filter.topics.len(), 2);
        assert!(filter.topics.contains(&Topic::Alerts));
        assert_eq!(filter.min_severity, Severity::Warning);
        assert_eq!(filter.sensor_ids, None);
    }

    #[test]
    fn unknown_names_are_errors() {
        let bad_topic = ControlMessage::parse(r#"{"action":"subscribe","topics":["weather"]}"#).unwrap();
        assert_eq!(
            bad_topic.subscription().unwrap_err(),
            SchemaError::UnknownTopic("weather".into())
        );

        let mut bad_severity = ControlMessage::subscribe(&[Topic::Alerts]);
        bad_severity.filters.min_severity = Some("fatal".into());
        assert!(matches!(bad_severity.subscription(), Err(SchemaError::UnknownSeverity(_))));

        assert!(ControlMessage::parse(r#"{"action":"pause"}"#).is_err());
    }

    #[test]
    fn empty_topic_list_means_everything() {
        let filter = ControlMessage::parse(r#"{"action":"subscribe"}"#)
            .unwrap()
            .subscription()
            .unwrap();
        assert_eq!(filter, SubscriptionFilter::all());
    }

    #[test]
    fn zone_and_topic_filters() {
        let filter = SubscriptionFilter::topics(&[Topic::Readings]).with_zones(["hall-a"]);
        assert!(filter.matches(&reading("s1", "hall-a")));
        assert!(!filter.matches(&reading("s1", "hall-b")));
        assert!(!filter.matches(&zone_anomaly("hall-a", Severity::Critical)));
    }

    #[test]
    fn sensor_filter_excludes_zone_level_events() {
        let filter = SubscriptionFilter::all().with_sensors(["s1"]);
        assert!(filter.matches(&reading("s1", "hall-a")));
        assert!(!filter.matches(&reading("s2", "hall-a")));
        assert!(!filter.matches(&zone_anomaly("hall-a", Severity::Critical)));
    }

    #[test]
    fn min_severity_is_ordinal() {
        let filter = SubscriptionFilter::all().with_min_severity(Severity::Warning);
        assert!(!filter.matches(&reading("s1", "hall-a")));
        assert!(filter.matches(&zone_anomaly("hall-a", Severity::Warning)));
        assert!(filter.matches(&zone_anomaly("hall-a", Severity::Critical)));
    }

    #[test]
    fn builder_round_trips_through_json() {
        let msg = ControlMessage::subscribe(&[Topic::Windows])
            .with_zones(["z1"])
            .with_sensors(["s1", "s2"])
            .with_min_severity(Severity::Critical);
        let parsed = ControlMessage::parse(&msg.to_json().unwrap()).unwrap();
        assert_eq!(parsed, msg);
        let filter = parsed.subscription().unwrap();
        assert_eq!(filter.sensor_ids.map(|s| s.len()), Some(2));
    }
}
