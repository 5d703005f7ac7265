//! Subscription Fan-out
//!
//! ## Overview
//!
//! Every derived event is published once; the hub decides who gets it.
//!
//! ```text
//!                       ┌──────────────┐   ┌──────────────┐
//!                  ┌───→│ client A     │──→│ delivery task│──→ sink A
//!                  │    │ filter queue │   └──────────────┘
//!  publish(event) ─┤    └──────────────┘
//!                  │    ┌──────────────┐   ┌──────────────┐
//!                  └───→│ client B     │──→│ delivery task│──→ sink B
//!                       │ filter queue │   └──────────────┘
//!                       └──────────────┘
//! ```
//!
//! `publish` is synchronous and never waits on a client. Under the client
//! map's read lock it evaluates each subscription filter and pushes the
//! envelope onto the matching clients' bounded [`DropOldestQueue`]s, then
//! wakes their delivery tasks. Nothing under that lock does I/O.
//!
//! ## Overload
//!
//! A client that reads slower than events arrive fills its queue; from then
//! on each push evicts the oldest undelivered envelope and counts a
//! `ClientOverloaded` rejection, both globally and for that client. Other
//! clients are unaffected.
//!
//! ## Teardown
//!
//! | Trigger | Effect |
//! |---------|--------|
//! | `disconnect` | subscription, queue and delivery task dropped immediately |
//! | sink error | that client only is disconnected |
//! | `shutdown` | every delivery task drains its queue, closes its sink, exits |
//!
//! The envelope is serialized once per event and shared between recipients.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use thermoguard_core::{DerivedEvent, DropOldestQueue, PipelineMetrics, RejectReason};
use thermoguard_schemas::{EventEnvelope, SubscriptionFilter};

use crate::sink::ClientSink;
use crate::ConnectorError;

type ClientMap = RwLock<HashMap<String, Arc<Client>>>;

/// Per-client delivery figures
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientStats {
    pub client_id: String,
    pub subscribed: bool,
    /// Envelopes waiting for the delivery task
    pub queued: usize,
    pub delivered: u64,
    /// Envelopes evicted by overload
    pub dropped: u64,
}

struct Client {
    id: String,
    filter: RwLock<Option<SubscriptionFilter>>,
    queue: DropOldestQueue<Arc<EventEnvelope>>,
    notify: Notify,
    closing: AtomicBool,
    delivered: AtomicU64,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    fn stats(&self) -> ClientStats {
        ClientStats {
            client_id: self.id.clone(),
            subscribed: read(&self.filter).is_some(),
            queued: self.queue.len(),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.queue.dropped(),
        }
    }

    fn close(&self) {
        self.closing.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    fn take_task(&self) -> Option<JoinHandle<()>> {
        self.task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

/// Routes derived events to subscribed clients
pub struct FanoutHub {
    clients: Arc<ClientMap>,
    capacity: usize,
    metrics: Arc<PipelineMetrics>,
}

impl FanoutHub {
    /// `capacity` bounds every client's outbound queue
    pub fn new(capacity: usize, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            clients: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
            metrics,
        }
    }

    /// Attach a client and start its delivery task
    ///
    /// The client receives nothing until it subscribes. Connecting an id that
    /// is already connected replaces the old connection. Must be called from
    /// within a tokio runtime.
    pub fn connect(&self, client_id: &str, sink: Box<dyn ClientSink>) {
        self.disconnect(client_id);

        let client = Arc::new(Client {
            id: client_id.to_string(),
            filter: RwLock::new(None),
            queue: DropOldestQueue::new(self.capacity),
            notify: Notify::new(),
            closing: AtomicBool::new(false),
            delivered: AtomicU64::new(0),
            task: Mutex::new(None),
        });

        let handle = tokio::spawn(deliver(
            client.clone(),
            sink,
            Arc::downgrade(&self.clients),
        ));
        *client
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);

        write(&self.clients).insert(client_id.to_string(), client);
        log::info!("Client {} connected", client_id);
    }

    /// Create or replace the subscription of a connected client
    pub fn subscribe(&self, client_id: &str, filter: SubscriptionFilter) -> Result<(), ConnectorError> {
        let clients = read(&self.clients);
        let client = clients
            .get(client_id)
            .ok_or_else(|| ConnectorError::UnknownClient(client_id.to_string()))?;
        log::info!(
            "Client {} subscribed to {:?} (min severity {})",
            client_id,
            filter.topics,
            filter.min_severity
        );
        *write(&client.filter) = Some(filter);
        Ok(())
    }

    /// Remove a client's subscription; it stays connected
    ///
    /// Returns whether there was a subscription.
    pub fn unsubscribe(&self, client_id: &str) -> Result<bool, ConnectorError> {
        let clients = read(&self.clients);
        let client = clients
            .get(client_id)
            .ok_or_else(|| ConnectorError::UnknownClient(client_id.to_string()))?;
        let had = write(&client.filter).take().is_some();
        if had {
            log::info!("Client {} unsubscribed", client_id);
        }
        Ok(had)
    }

    /// Tear a client down now, discarding anything still queued
    pub fn disconnect(&self, client_id: &str) -> bool {
        let Some(client) = write(&self.clients).remove(client_id) else {
            return false;
        };
        client.close();
        let discarded = client.queue.clear();
        if let Some(task) = client.take_task() {
            task.abort();
        }
        log::info!("Client {} disconnected ({} undelivered)", client_id, discarded);
        true
    }

    /// Offer one event to every subscription; returns the number of recipients
    pub fn publish(&self, event: &DerivedEvent) -> usize {
        let clients = read(&self.clients);
        let mut envelope: Option<Arc<EventEnvelope>> = None;
        let mut recipients = 0;

        for client in clients.values() {
            let matches = read(&client.filter)
                .as_ref()
                .map_or(false, |filter| filter.matches(event));
            if !matches || client.closing.load(Ordering::Acquire) {
                continue;
            }

            let shared = match &envelope {
                Some(shared) => shared.clone(),
                None => match EventEnvelope::from_event(event) {
                    Ok(built) => envelope.insert(Arc::new(built)).clone(),
                    Err(err) => {
                        log::warn!("Dropping unencodable {} event: {}", event.topic().name(), err);
                        return 0;
                    }
                },
            };

            if client.queue.push(shared).is_some() {
                self.metrics.record_rejection(RejectReason::ClientOverloaded);
                let dropped = client.queue.dropped();
                if dropped == 1 {
                    log::warn!("Client {} overloaded, dropping oldest messages", client.id);
                } else {
                    log::debug!("Client {} overloaded, {} dropped so far", client.id, dropped);
                }
            }
            client.notify.notify_one();
            recipients += 1;
        }
        recipients
    }

    pub fn client_stats(&self, client_id: &str) -> Option<ClientStats> {
        read(&self.clients).get(client_id).map(|c| c.stats())
    }

    pub fn all_client_stats(&self) -> Vec<ClientStats> {
        let mut stats: Vec<_> = read(&self.clients).values().map(|c| c.stats()).collect();
        stats.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        stats
    }

    /// Overload drops per connected client
    pub fn dropped_counts(&self) -> BTreeMap<String, u64> {
        read(&self.clients)
            .values()
            .map(|c| (c.id.clone(), c.queue.dropped()))
            .collect()
    }

    pub fn is_connected(&self, client_id: &str) -> bool {
        read(&self.clients).contains_key(client_id)
    }

    pub fn client_count(&self) -> usize {
        read(&self.clients).len()
    }

    /// Drain and stop every delivery task
    ///
    /// Each client gets `grace` to flush its queue before its task is
    /// aborted.
    pub async fn shutdown(&self, grace: Duration) {
        let clients: Vec<Arc<Client>> = write(&self.clients).drain().map(|(_, c)| c).collect();
        for client in &clients {
            client.close();
        }
        for client in clients {
            let Some(mut task) = client.take_task() else {
                continue;
            };
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                log::warn!(
                    "Client {} did not drain within {:?}, {} undelivered",
                    client.id,
                    grace,
                    client.queue.len()
                );
                task.abort();
            }
        }
        log::info!("Fan-out stopped");
    }
}

impl std::fmt::Debug for FanoutHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutHub")
            .field("clients", &self.client_count())
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Per-client delivery loop
async fn deliver(client: Arc<Client>, mut sink: Box<dyn ClientSink>, clients: Weak<ClientMap>) {
    loop {
        while let Some(envelope) = client.queue.pop() {
            if let Err(err) = sink.deliver(&envelope).await {
                log::warn!("Delivery to client {} failed, disconnecting: {}", client.id, err);
                client.closing.store(true, Ordering::Release);
                if let Some(clients) = clients.upgrade() {
                    let mut map = write(&clients);
                    if map.get(&client.id).map_or(false, |c| Arc::ptr_eq(c, &client)) {
                        map.remove(&client.id);
                    }
                }
                return;
            }
            client.delivered.fetch_add(1, Ordering::Relaxed);
        }
        if client.closing.load(Ordering::Acquire) {
            break;
        }
        client.notify.notified().await;
    }
    sink.close().await;
    log::debug!("Delivery task for client {} finished", client.id);
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::ChannelSink;
    use thermoguard_core::{Position, Reading, Topic};

    fn reading(sensor: &str, zone: &str, ts: i64) -> DerivedEvent {
        Reading::celsius(sensor, zone, Position::planar(0.0, 0.0), ts, 22.0).into()
    }

    #[tokio::test]
    async fn unsubscribed_client_receives_nothing() {
        let hub = FanoutHub::new(8, Arc::new(PipelineMetrics::new()));
        let (sink, _rx) = ChannelSink::pair(8);
        hub.connect("a", Box::new(sink));
        assert_eq!(hub.publish(&reading("s1", "z", 0)), 0);

        hub.subscribe("a", SubscriptionFilter::all()).unwrap();
        assert_eq!(hub.publish(&reading("s1", "z", 1)), 1);

        assert!(hub.unsubscribe("a").unwrap());
        assert_eq!(hub.publish(&reading("s1", "z", 2)), 0);
    }

    #[tokio::test]
    async fn unknown_client_cannot_subscribe() {
        let hub = FanoutHub::new(8, Arc::new(PipelineMetrics::new()));
        assert!(matches!(
            hub.subscribe("ghost", SubscriptionFilter::all()),
            Err(ConnectorError::UnknownClient(_))
        ));
    }

    #[tokio::test]
    async fn envelopes_arrive_in_publish_order() {
        let hub = FanoutHub::new(8, Arc::new(PipelineMetrics::new()));
        let (sink, mut rx) = ChannelSink::pair(8);
        hub.connect("a", Box::new(sink));
        hub.subscribe("a", SubscriptionFilter::topics(&[Topic::Readings])).unwrap();

        for ts in 0..3 {
            hub.publish(&reading("s1", "z", ts));
        }
        for ts in 0..3 {
            let envelope = rx.recv().await.unwrap();
            assert_eq!(envelope.timestamp, ts);
            assert_eq!(envelope.event_type, "reading");
        }
        assert_eq!(hub.client_stats("a").unwrap().delivered, 3);
    }

    #[tokio::test]
    async fn disconnect_tears_down_immediately() {
        let hub = FanoutHub::new(8, Arc::new(PipelineMetrics::new()));
        let (sink, _rx) = ChannelSink::pair(8);
        hub.connect("a", Box::new(sink));
        hub.subscribe("a", SubscriptionFilter::all()).unwrap();

        assert!(hub.disconnect("a"));
        assert!(!hub.is_connected("a"));
        assert_eq!(hub.publish(&reading("s1", "z", 0)), 0);
        assert!(!hub.disconnect("a"));
    }

    #[tokio::test]
    async fn reconnect_replaces_previous_connection() {
        let hub = FanoutHub::new(8, Arc::new(PipelineMetrics::new()));
        let (first, _rx1) = ChannelSink::pair(8);
        let (second, mut rx2) = ChannelSink::pair(8);
        hub.connect("a", Box::new(first));
        hub.connect("a", Box::new(second));
        assert_eq!(hub.client_count(), 1);

        hub.subscribe("a", SubscriptionFilter::all()).unwrap();
        hub.publish(&reading("s1", "z", 7));
        assert_eq!(rx2.recv().await.unwrap().timestamp, 7);
    }
}
