//! Message bus adapter.
//!
//! The core only needs a handful of primitives from the bus: connect,
//! subscribe and unsubscribe, publish, and a callback for inbound messages. Two implementations:
//! - **mqtt**: a real broker via rumqttc
//! - **memory**: an in-process broker with the same topic-filter rules
//!
//! Inbound messages are delivered to a [`MessageHandler`] bound when the
//! adapter connects. Delivery always happens on a background task owned by
//! the adapter, never on the task that called `publish`.

pub mod memory;
pub mod mqtt;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::bytes::Bytes;

pub use memory::{InMemoryBroker, MemoryTransport};
pub use mqtt::MqttTransport;

/// A message received on a subscribed topic.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to connect to broker at {endpoint}: {reason}")]
    Connection { endpoint: String, reason: String },
    #[error("failed to subscribe to '{topic}': {reason}")]
    Subscribe { topic: String, reason: String },
    #[error("failed to unsubscribe from '{topic}': {reason}")]
    Unsubscribe { topic: String, reason: String },
    #[error("failed to publish to '{topic}': {reason}")]
    Publish { topic: String, reason: String },
    #[error("transport is closed")]
    Closed,
}

/// Fire-and-forget access to the bus.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Subscribe to an exact topic or a wildcard filter.
    async fn subscribe(&self, filter: &str) -> Result<(), TransportError>;

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError>;

    /// Publish without acknowledgement or retry.
    async fn publish(&self, topic: &str, payload: String) -> Result<(), TransportError>;
}

/// Callbacks invoked by a transport's background delivery task.
///
/// Implementations must synchronize any state they touch: callbacks run
/// concurrently with callers of [`Transport::publish`].
pub trait MessageHandler: Send + Sync + 'static {
    fn on_message(&self, message: InboundMessage);

    fn on_connect(&self) {}

    fn on_disconnect(&self, reason: &str) {
        tracing::warn!(reason, "Disconnected from broker");
    }
}

/// Handler that forwards every message into a channel.
///
/// Lets a consumer process messages on its own task, where it may publish
/// without stalling the transport's delivery loop.
pub struct ChannelHandler {
    tx: mpsc::UnboundedSender<InboundMessage>,
}

impl ChannelHandler {
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<InboundMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl MessageHandler for ChannelHandler {
    fn on_message(&self, message: InboundMessage) {
        if self.tx.send(message).is_err() {
            tracing::debug!("Inbound channel closed, dropping message");
        }
    }
}

/// MQTT topic filter matching.
///
/// `+` matches exactly one level, `#` (last level only) matches the rest,
/// including the parent level itself (`a/#` matches `a`).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
