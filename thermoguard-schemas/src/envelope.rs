//! Derived event envelope
//!
//! ```text
//! { "type": "alert", "timestamp": 1718000060000, "topic": "alerts",
//!   "payload": { ...event specific... } }
//! ```
//!
//! `type` is the singular event name, `topic` the subscription topic it is
//! published on, `timestamp` the event time (reading time, window end or
//! detection time).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use thermoguard_core::{DerivedEvent, Timestamp, Topic};

use crate::SchemaError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: Timestamp,
    pub topic: String,
    pub payload: Value,
}

impl EventEnvelope {
    pub fn from_event(event: &DerivedEvent) -> Result<Self, SchemaError> {
        let payload =
            serde_json::to_value(event).map_err(|e| SchemaError::Encode(e.to_string()))?;

        let topic = event.topic();
        Ok(Self {
            event_type: topic.event_type().to_string(),
            timestamp: event.timestamp(),
            topic: topic.name().to_string(),
            payload,
        })
    }

    pub fn topic(&self) -> Option<Topic> {
        Topic::parse(&self.topic)
    }

    pub fn to_json(&self) -> Result<String, SchemaError> {
        serde_json::to_string(self).map_err(|e| SchemaError::Encode(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, SchemaError> {
        serde_json::from_str(json).map_err(|e| SchemaError::Parse(e.to_string()))
    }
}
