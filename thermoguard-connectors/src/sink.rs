//! Client delivery transports
//!
//! A [`ClientSink`] is whatever carries envelopes to one subscriber: a
//! websocket, a message bus producer, an in-process channel. The fan-out hub
//! owns one sink per client and drives it from that client's delivery task,
//! so a sink may take as long as it likes without holding up anyone else.
//! Any error is treated as a disconnect.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use thermoguard_schemas::EventEnvelope;

/// Delivery failures
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SinkError {
    #[error("Peer disconnected")]
    Disconnected,

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Transport to one subscriber
#[async_trait]
pub trait ClientSink: Send {
    /// Deliver one envelope, waiting as long as the transport needs
    async fn deliver(&mut self, envelope: &EventEnvelope) -> Result<(), SinkError>;

    /// Called once when the client is torn down after a graceful drain
    async fn close(&mut self) {}
}

/// In-process sink backed by a bounded tokio channel
///
/// A full channel makes `deliver` wait, which is how a slow consumer shows
/// up to the hub: its outbound queue grows and then drops oldest.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<EventEnvelope>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<EventEnvelope>) -> Self {
        Self { tx }
    }

    /// Sink plus the receiving end
    pub fn pair(capacity: usize) -> (Self, mpsc::Receiver<EventEnvelope>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ClientSink for ChannelSink {
    async fn deliver(&mut self, envelope: &EventEnvelope) -> Result<(), SinkError> {
        self.tx
            .send(envelope.clone())
            .await
            .map_err(|_| SinkError::Disconnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(ts: i64) -> EventEnvelope {
        EventEnvelope {
            event_type: "reading".into(),
            timestamp: ts,
            topic: "readings".into(),
            payload: json!({ "value": 21.0 }),
        }
    }

    #[tokio::test]
    async fn channel_sink_delivers_in_order() {
        let (mut sink, mut rx) = ChannelSink::pair(4);
        sink.deliver(&envelope(1)).await.unwrap();
        sink.deliver(&envelope(2)).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().timestamp, 1);
        assert_eq!(rx.recv().await.unwrap().timestamp, 2);
    }

    #[tokio::test]
    async fn dropped_receiver_is_a_disconnect() {
        let (mut sink, rx) = ChannelSink::pair(1);
        drop(rx);
        assert_eq!(sink.deliver(&envelope(1)).await, Err(SinkError::Disconnected));
    }
}
