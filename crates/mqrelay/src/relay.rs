//! Relay worker: one stateless loop serving every client.
//!
//! Flow per inbound message:
//! 1. Parse the identity out of `<ns>/upload/<identity>`
//! 2. Decode the envelope
//! 3. Apply the [`Transform`]
//! 4. Publish the result to `<ns>/download/<identity>`
//!
//! Malformed topics and payloads are logged and dropped; the protocol has
//! no negative acknowledgement, so the requester simply times out. A failed
//! publish is fatal and ends the loop.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bridge::{Envelope, FrameError};
use crate::bus::{InboundMessage, Transport, TransportError};
use crate::config::RelayConfig;
use crate::topic::{Category, TopicError, TopicLayout};

/// Pluggable request -> reply policy.
pub trait Transform: Send + Sync + 'static {
    fn apply(&self, request: Envelope) -> Result<Envelope, FrameError>;
}

impl<F> Transform for F
where
    F: Fn(Envelope) -> Result<Envelope, FrameError> + Send + Sync + 'static,
{
    fn apply(&self, request: Envelope) -> Result<Envelope, FrameError> {
        self(request)
    }
}

/// Default transform: uppercase text content and prefix the name.
///
/// Content that is not UTF-8 is passed through unchanged.
#[derive(Debug, Clone)]
pub struct Uppercase {
    prefix: String,
}

impl Uppercase {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Default for Uppercase {
    fn default() -> Self {
        Self::new(RelayConfig::default().prefix)
    }
}

impl Transform for Uppercase {
    fn apply(&self, request: Envelope) -> Result<Envelope, FrameError> {
        let (name, content) = request.into_parts();
        let content = match std::str::from_utf8(&content) {
            Ok(text) => text.to_uppercase().into_bytes().into(),
            Err(_) => content,
        };
        Envelope::new(format!("{}{}", self.prefix, name), content)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Topic(#[from] TopicError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl RelayError {
    /// Whether the loop can keep going after this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Transport(_))
    }
}

pub struct Relay {
    layout: TopicLayout,
    transport: Arc<dyn Transport>,
    transform: Arc<dyn Transform>,
    output_dir: Option<PathBuf>,
}

impl Relay {
    pub fn new(
        layout: TopicLayout,
        transport: Arc<dyn Transport>,
        transform: Arc<dyn Transform>,
    ) -> Self {
        Self {
            layout,
            transport,
            transform,
            output_dir: None,
        }
    }

    /// Also write every transformed file into `dir`.
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    /// Subscribe to the upload wildcard.
    pub async fn start(&self) -> Result<(), TransportError> {
        let filter = self.layout.wildcard(Category::Upload);
        self.transport.subscribe(&filter).await?;
        tracing::info!(%filter, "Relay subscribed");
        Ok(())
    }

    /// Process inbound messages until cancelled, the channel closes, or a
    /// publish fails.
    pub async fn run(
        &self,
        mut inbound: mpsc::UnboundedReceiver<InboundMessage>,
        cancel: CancellationToken,
    ) -> Result<(), RelayError> {
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Relay cancelled");
                    return Ok(());
                }
                message = inbound.recv() => match message {
                    Some(message) => message,
                    None => {
                        tracing::info!("Inbound channel closed, relay stopping");
                        return Ok(());
                    }
                },
            };

            match self.handle(message).await {
                Ok(()) => {}
                Err(e) if e.is_recoverable() => {
                    tracing::warn!(error = %e, "Dropping request");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Relay publish failed");
                    return Err(e);
                }
            }
        }
    }

    /// Handle a single inbound message.
    pub async fn handle(&self, message: InboundMessage) -> Result<(), RelayError> {
        let identity = self.layout.identity_from(Category::Upload, &message.topic)?;
        let request = Envelope::decode_bytes(&message.payload)?;

        tracing::info!(
            %identity,
            name = request.name(),
            bytes = request.content().len(),
            "Request received"
        );

        let reply = self.transform.apply(request)?;

        if let Some(dir) = &self.output_dir {
            save_output(dir, &reply).await;
        }

        let topic = self.layout.topic_for(Category::Download, &identity);
        self.transport.publish(&topic, reply.encode()).await?;

        tracing::info!(%identity, name = reply.name(), %topic, "Reply published");
        Ok(())
    }
}

/// Write `reply` under `dir`, using only the final path component of its
/// name. Failures are logged; they never block the reply.
async fn save_output(dir: &Path, reply: &Envelope) {
    let Some(file_name) = Path::new(reply.name()).file_name() else {
        tracing::warn!(name = reply.name(), "Reply name has no file component, not saving");
        return;
    };
    let path = dir.join(file_name);
    if let Err(e) = tokio::fs::create_dir_all(dir).await {
        tracing::warn!(dir = %dir.display(), error = %e, "Failed to create output directory");
        return;
    }
    match tokio::fs::write(&path, reply.content()).await {
        Ok(()) => tracing::debug!(path = %path.display(), "Saved transformed file"),
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to save transformed file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio_util::bytes::Bytes;

    use crate::bus::{ChannelHandler, InMemoryBroker};

    fn message(topic: &str, payload: &str) -> InboundMessage {
        InboundMessage {
            topic: topic.to_string(),
            payload: Bytes::from(payload.to_string()),
        }
    }

    #[test]
    fn uppercase_transforms_text_and_prefixes_name() {
        let request = Envelope::new("notes.txt", &b"hello world"[..]).unwrap();
        let reply = Uppercase::default().apply(request).unwrap();

        assert_eq!(reply.name(), "CAPS_notes.txt");
        assert_eq!(reply.content().as_ref(), b"HELLO WORLD");
    }

    #[test]
    fn uppercase_passes_binary_through() {
        let bytes = vec![0xff, 0x00, b'a'];
        let request = Envelope::new("blob.bin", bytes.clone()).unwrap();
        let reply = Uppercase::new("UP_").apply(request).unwrap();

        assert_eq!(reply.name(), "UP_blob.bin");
        assert_eq!(reply.content().as_ref(), bytes.as_slice());
    }

    #[test]
    fn closures_are_transforms() {
        let reverse = |request: Envelope| {
            let (name, content) = request.into_parts();
            let mut content = content.to_vec();
            content.reverse();
            Envelope::new(name, content)
        };
        let reply = reverse
            .apply(Envelope::new("r", &b"abc"[..]).unwrap())
            .unwrap();
        assert_eq!(reply.content().as_ref(), b"cba");
    }

    /// Relay connected to `broker` plus a spy subscribed to every reply.
    async fn setup(
        broker: &InMemoryBroker,
    ) -> (
        Relay,
        mpsc::UnboundedReceiver<InboundMessage>,
        mpsc::UnboundedReceiver<InboundMessage>,
        crate::bus::MemoryTransport,
    ) {
        let (handler, inbound) = ChannelHandler::channel();
        let transport = Arc::new(broker.connect(handler));
        let relay = Relay::new(
            TopicLayout::default(),
            transport,
            Arc::new(Uppercase::default()),
        );
        relay.start().await.unwrap();

        let (spy_handler, spy_rx) = ChannelHandler::channel();
        let spy = broker.connect(spy_handler);
        spy.subscribe("arquivo/download/#").await.unwrap();

        (relay, inbound, spy_rx, spy)
    }

    #[tokio::test]
    async fn handle_publishes_reply_to_requester() {
        let broker = InMemoryBroker::new();
        let (relay, _inbound, mut replies, _spy) = setup(&broker).await;

        relay
            .handle(message("arquivo/upload/alice", "notes.txt;aGVsbG8="))
            .await
            .unwrap();

        let reply = replies.recv().await.unwrap();
        assert_eq!(reply.topic, "arquivo/download/alice");
        let envelope = Envelope::decode_bytes(&reply.payload).unwrap();
        assert_eq!(envelope.name(), "CAPS_notes.txt");
        assert_eq!(envelope.content().as_ref(), b"HELLO");
    }

    #[tokio::test]
    async fn handle_rejects_malformed_input() {
        let broker = InMemoryBroker::new();
        let (relay, _inbound, _replies, _spy) = setup(&broker).await;

        let err = relay
            .handle(message("arquivo/upload/alice", "no delimiter"))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Frame(FrameError::MissingDelimiter)));
        assert!(err.is_recoverable());

        let err = relay
            .handle(message("arquivo/upload/a/b", "n;"))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Topic(_)));
    }

    #[tokio::test]
    async fn run_drops_malformed_and_keeps_serving() {
        let broker = InMemoryBroker::new();
        let (relay, inbound, mut replies, _spy) = setup(&broker).await;
        let (client_handler, _client_rx) = ChannelHandler::channel();
        let client = broker.connect(client_handler);

        let cancel = CancellationToken::new();
        let relay = Arc::new(relay);
        let worker = tokio::spawn({
            let relay = Arc::clone(&relay);
            let cancel = cancel.clone();
            async move { relay.run(inbound, cancel).await }
        });

        client
            .publish("arquivo/upload/alice", "garbage without delimiter".to_string())
            .await
            .unwrap();
        let nothing = tokio::time::timeout(Duration::from_millis(100), replies.recv()).await;
        assert!(nothing.is_err(), "malformed request produced a reply");

        client
            .publish("arquivo/upload/bob", "b.txt;Ym9i".to_string())
            .await
            .unwrap();
        let reply = replies.recv().await.unwrap();
        assert_eq!(reply.topic, "arquivo/download/bob");

        cancel.cancel();
        assert!(worker.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn run_stops_when_publish_fails() {
        let broker = InMemoryBroker::new();
        let (relay, inbound, _replies, _spy) = setup(&broker).await;

        // Queue a valid request, then take the broker away before it is handled.
        let (tx_handler, _rx) = ChannelHandler::channel();
        let client = broker.connect(tx_handler);
        client
            .publish("arquivo/upload/alice", "a.txt;YQ==".to_string())
            .await
            .unwrap();
        broker.shutdown();

        let err = relay
            .run(inbound, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Transport(TransportError::Closed)));
    }

    #[tokio::test]
    async fn output_dir_receives_transformed_file() {
        let broker = InMemoryBroker::new();
        let (relay, _inbound, _replies, _spy) = setup(&broker).await;
        let dir = tempfile::tempdir().unwrap();
        let relay = relay.with_output_dir(dir.path());

        relay
            .handle(message("arquivo/upload/alice", "../escape.txt;aGk="))
            .await
            .unwrap();

        // Name is "CAPS_../escape.txt": only the final component is used.
        let saved = std::fs::read(dir.path().join("escape.txt")).unwrap();
        assert_eq!(saved, b"HI");
    }
}
