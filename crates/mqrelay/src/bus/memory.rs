//! In-process broker.
//!
//! Routes publishes to every connection holding a matching subscription,
//! using MQTT filter rules. Each connection gets its own delivery task, so
//! handlers run concurrently with publishers exactly as they would behind a
//! network broker.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::bytes::Bytes;

use super::{InboundMessage, MessageHandler, Transport, TransportError, topic_matches};

type ConnectionId = u64;

#[derive(Default)]
struct BrokerInner {
    next_id: AtomicU64,
    connections: DashMap<ConnectionId, mpsc::UnboundedSender<InboundMessage>>,
    subscriptions: RwLock<Vec<(String, ConnectionId)>>,
}

impl BrokerInner {
    fn subscribe(&self, connection: ConnectionId, filter: &str) {
        let mut subs = match self.subscriptions.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Subscription table poisoned - recovering");
                poisoned.into_inner()
            }
        };
        if !subs.iter().any(|(f, c)| *c == connection && f == filter) {
            subs.push((filter.to_string(), connection));
        }
    }

    fn unsubscribe(&self, connection: ConnectionId, filter: &str) {
        match self.subscriptions.write() {
            Ok(mut subs) => subs.retain(|(f, c)| !(*c == connection && f == filter)),
            Err(poisoned) => poisoned
                .into_inner()
                .retain(|(f, c)| !(*c == connection && f == filter)),
        }
    }

    fn route(&self, topic: &str, payload: Bytes) -> usize {
        let mut targets: Vec<ConnectionId> = match self.subscriptions.read() {
            Ok(subs) => subs
                .iter()
                .filter(|(filter, _)| topic_matches(filter, topic))
                .map(|(_, c)| *c)
                .collect(),
            Err(poisoned) => poisoned
                .into_inner()
                .iter()
                .filter(|(filter, _)| topic_matches(filter, topic))
                .map(|(_, c)| *c)
                .collect(),
        };
        // One delivery per connection, even with overlapping filters.
        targets.sort_unstable();
        targets.dedup();

        let mut delivered = 0;
        for connection in targets {
            if let Some(tx) = self.connections.get(&connection) {
                let message = InboundMessage {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                };
                if tx.send(message).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    fn disconnect(&self, connection: ConnectionId) {
        self.connections.remove(&connection);
        match self.subscriptions.write() {
            Ok(mut subs) => subs.retain(|(_, c)| *c != connection),
            Err(poisoned) => poisoned.into_inner().retain(|(_, c)| *c != connection),
        }
    }
}

/// Shared in-process broker. Clone to hand out to multiple components.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a connection whose inbound messages go to `handler`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(&self, handler: Arc<dyn MessageHandler>) -> MemoryTransport {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::unbounded_channel::<InboundMessage>();
        self.inner.connections.insert(id, tx);

        tracing::debug!(connection = id, "In-memory connection opened");

        let delivery = tokio::spawn(async move {
            handler.on_connect();
            while let Some(message) = rx.recv().await {
                handler.on_message(message);
            }
            handler.on_disconnect("connection closed");
        });

        MemoryTransport {
            id,
            broker: Arc::clone(&self.inner),
            delivery,
        }
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    /// Drop every connection, as if the broker went away.
    pub fn shutdown(&self) {
        self.inner.connections.clear();
        match self.inner.subscriptions.write() {
            Ok(mut subs) => subs.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
        tracing::debug!("In-memory broker shut down");
    }
}

/// One connection to an [`InMemoryBroker`].
pub struct MemoryTransport {
    id: ConnectionId,
    broker: Arc<BrokerInner>,
    delivery: JoinHandle<()>,
}

impl MemoryTransport {
    pub fn is_finished(&self) -> bool {
        self.delivery.is_finished()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn subscribe(&self, filter: &str) -> Result<(), TransportError> {
        if !self.broker.connections.contains_key(&self.id) {
            return Err(TransportError::Closed);
        }
        self.broker.subscribe(self.id, filter);
        tracing::debug!(connection = self.id, filter, "Subscribed");
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError> {
        if !self.broker.connections.contains_key(&self.id) {
            return Err(TransportError::Closed);
        }
        self.broker.unsubscribe(self.id, filter);
        tracing::debug!(connection = self.id, filter, "Unsubscribed");
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: String) -> Result<(), TransportError> {
        if !self.broker.connections.contains_key(&self.id) {
            return Err(TransportError::Closed);
        }
        let delivered = self.broker.route(topic, Bytes::from(payload));
        tracing::trace!(connection = self.id, topic, delivered, "Published");
        Ok(())
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.broker.disconnect(self.id);
        tracing::debug!(connection = self.id, "In-memory connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ChannelHandler;
    use std::time::Duration;

    #[tokio::test]
    async fn delivers_to_matching_subscribers_only() {
        let broker = InMemoryBroker::new();
        let (wild, mut wild_rx) = ChannelHandler::channel();
        let (exact, mut exact_rx) = ChannelHandler::channel();
        let (publisher, _pub_rx) = ChannelHandler::channel();

        let wild_conn = broker.connect(wild);
        let exact_conn = broker.connect(exact);
        let pub_conn = broker.connect(publisher);

        wild_conn.subscribe("arquivo/upload/#").await.unwrap();
        exact_conn.subscribe("arquivo/upload/bob").await.unwrap();

        pub_conn
            .publish("arquivo/upload/alice", "a;".to_string())
            .await
            .unwrap();

        let message = wild_rx.recv().await.unwrap();
        assert_eq!(message.topic, "arquivo/upload/alice");
        assert_eq!(message.payload.as_ref(), b"a;");

        let nothing = tokio::time::timeout(Duration::from_millis(50), exact_rx.recv()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn overlapping_filters_deliver_once() {
        let broker = InMemoryBroker::new();
        let (handler, mut rx) = ChannelHandler::channel();
        let conn = broker.connect(handler);

        conn.subscribe("arquivo/#").await.unwrap();
        conn.subscribe("arquivo/upload/+").await.unwrap();
        conn.subscribe("arquivo/upload/+").await.unwrap();
        conn.publish("arquivo/upload/x", "n;".to_string())
            .await
            .unwrap();

        assert!(rx.recv().await.is_some());
        let second = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery_for_that_filter_only() {
        let broker = InMemoryBroker::new();
        let (handler, mut rx) = ChannelHandler::channel();
        let conn = broker.connect(handler);

        conn.subscribe("arquivo/download/alice").await.unwrap();
        conn.subscribe("arquivo/download/bob").await.unwrap();
        conn.unsubscribe("arquivo/download/alice").await.unwrap();

        conn.publish("arquivo/download/alice", "a;".to_string())
            .await
            .unwrap();
        conn.publish("arquivo/download/bob", "b;".to_string())
            .await
            .unwrap();

        let message = rx.recv().await.unwrap();
        assert_eq!(message.topic, "arquivo/download/bob");
        let nothing = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn dropping_transport_closes_connection() {
        let broker = InMemoryBroker::new();
        let (handler, mut rx) = ChannelHandler::channel();
        let conn = broker.connect(handler);
        conn.subscribe("#").await.unwrap();
        assert_eq!(broker.connection_count(), 1);

        drop(conn);
        assert_eq!(broker.connection_count(), 0);

        // Delivery task ends and drops the handler, closing the channel.
        assert!(rx.recv().await.is_none());
    }
}
