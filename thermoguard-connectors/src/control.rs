//! Control message handling
//!
//! Clients steer their own subscription with JSON control messages on the
//! same connection they receive envelopes on. A malformed message is
//! rejected and counted as `InvalidSchema`; the client's existing
//! subscription is left untouched.

use thermoguard_core::{PipelineMetrics, RejectReason};
use thermoguard_schemas::{ControlAction, ControlMessage};

use crate::fanout::FanoutHub;
use crate::ConnectorError;

/// Apply one control message on behalf of `client_id`
pub fn apply_control(
    hub: &FanoutHub,
    client_id: &str,
    message: &ControlMessage,
) -> Result<(), ConnectorError> {
    match message.action {
        ControlAction::Subscribe => {
            let filter = message.subscription()?;
            hub.subscribe(client_id, filter)
        }
        ControlAction::Unsubscribe => hub.unsubscribe(client_id).map(|_| ()),
    }
}

/// Parse and apply a raw control message, counting failures
pub fn apply_control_json(
    hub: &FanoutHub,
    metrics: &PipelineMetrics,
    client_id: &str,
    json: &str,
) -> Result<(), ConnectorError> {
    let outcome = ControlMessage::parse(json)
        .map_err(ConnectorError::from)
        .and_then(|message| apply_control(hub, client_id, &message));

    if let Err(err) = &outcome {
        if !matches!(err, ConnectorError::UnknownClient(_)) {
            metrics.record_rejection(RejectReason::InvalidSchema);
        }
        log::warn!("Rejected control message from {}: {}", client_id, err);
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::sink::ChannelSink;
    use thermoguard_core::{Position, Reading, Severity, Topic};

    #[tokio::test]
    async fn subscribe_then_unsubscribe() {
        let metrics = Arc::new(PipelineMetrics::new());
        let hub = FanoutHub::new(4, metrics.clone());
        let (sink, _rx) = ChannelSink::pair(4);
        hub.connect("a", Box::new(sink));

        let subscribe = ControlMessage::subscribe(&[Topic::Alerts, Topic::Anomalies])
            .with_min_severity(Severity::Warning);
        apply_control(&hub, "a", &subscribe).unwrap();
        let stats = hub.client_stats("a").unwrap();
        assert!(stats.subscribed);

        let reading = Reading::celsius("s", "z", Position::planar(0.0, 0.0), 0, 22.0).into();
        assert_eq!(hub.publish(&reading), 0);

        apply_control(&hub, "a", &ControlMessage::unsubscribe()).unwrap();
        assert!(!hub.client_stats("a").unwrap().subscribed);
    }

    #[tokio::test]
    async fn bad_messages_are_counted_and_leave_subscription_alone() {
        let metrics = Arc::new(PipelineMetrics::new());
        let hub = FanoutHub::new(4, metrics.clone());
        let (sink, _rx) = ChannelSink::pair(4);
        hub.connect("a", Box::new(sink));
        apply_control_json(&hub, &metrics, "a", r#"{"action":"subscribe","topics":["alerts"]}"#)
            .unwrap();

        assert!(apply_control_json(&hub, &metrics, "a", "not json").is_err());
        assert!(apply_control_json(
            &hub,
            &metrics,
            "a",
            r#"{"action":"subscribe","topics":["weather"]}"#
        )
        .is_err());

        assert_eq!(metrics.rejections(RejectReason::InvalidSchema), 2);
        assert!(hub.client_stats("a").unwrap().subscribed);
    }
}
