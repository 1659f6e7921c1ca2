//! Correlation waiter: a blocking request/response call over pub/sub.
//!
//! Each identity owns exactly one slot, keyed in a map and guarded by its
//! own mutex. A slot moves through:
//!
//! ```text
//! Empty --request--> Pending --reply--> Fulfilled --take--> Empty
//!                       |
//!                       +--timeout / drop--> Empty
//! ```
//!
//! Replies are matched by the topic they arrive on (the identity's private
//! download topic), never by file name. A reply that arrives while the slot
//! is not Pending has nothing to answer and is dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::bytes::Bytes;

use crate::bridge::{Envelope, FrameError};
use crate::bus::{InboundMessage, MessageHandler, Transport, TransportError};
use crate::identity::Identity;
use crate::topic::{Category, TopicLayout};

/// Result of a completed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyRecord {
    pub name: String,
    pub content: Bytes,
    /// Time from submission until the reply landed.
    pub duration: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum CorrelationError {
    #[error("a request for '{0}' is already pending")]
    Busy(Identity),
    #[error("no reply for '{identity}' within {timeout:?}")]
    Timeout { identity: Identity, timeout: Duration },
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

enum SlotState {
    Empty,
    Pending {
        ticket: u64,
        expected_name: String,
        submitted_at: Instant,
    },
    Fulfilled {
        ticket: u64,
        reply: Envelope,
        submitted_at: Instant,
        received_at: Instant,
    },
}

/// Per-identity state. Tickets tell one request's cleanup apart from the
/// next request's state.
struct Slot {
    state: Mutex<SlotState>,
    ready: Notify,
    next_ticket: AtomicU64,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Empty),
            ready: Notify::new(),
            next_ticket: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Correlation slot mutex poisoned - resetting slot");
                let mut guard = poisoned.into_inner();
                *guard = SlotState::Empty;
                guard
            }
        }
    }

    /// Empty -> Pending. `None` if a request is already outstanding.
    fn begin(&self, expected_name: &str) -> Option<(u64, Instant)> {
        let mut state = self.lock();
        if !matches!(*state, SlotState::Empty) {
            return None;
        }
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let submitted_at = Instant::now();
        *state = SlotState::Pending {
            ticket,
            expected_name: expected_name.to_string(),
            submitted_at,
        };
        Some((ticket, submitted_at))
    }

    /// Pending -> Fulfilled. Returns false when there is nothing to answer.
    fn fulfill(&self, reply: Envelope) -> bool {
        let mut state = self.lock();
        let (ticket, submitted_at) = match &*state {
            SlotState::Pending {
                ticket,
                expected_name,
                submitted_at,
            } => {
                if !reply.name().ends_with(expected_name.as_str()) {
                    tracing::debug!(
                        expected = %expected_name,
                        received = reply.name(),
                        "Reply name differs from request name"
                    );
                }
                (*ticket, *submitted_at)
            }
            _ => return false,
        };
        *state = SlotState::Fulfilled {
            ticket,
            reply,
            submitted_at,
            received_at: Instant::now(),
        };
        drop(state);
        self.ready.notify_one();
        true
    }

    /// Fulfilled -> Empty, if the reply belongs to `ticket` and landed by
    /// `deadline`.
    fn take(&self, ticket: u64, deadline: Instant) -> Option<ReplyRecord> {
        let mut state = self.lock();
        match std::mem::replace(&mut *state, SlotState::Empty) {
            SlotState::Fulfilled {
                ticket: t,
                reply,
                submitted_at,
                received_at,
            } if t == ticket && received_at <= deadline => {
                let (name, content) = reply.into_parts();
                Some(ReplyRecord {
                    name,
                    content,
                    duration: received_at.duration_since(submitted_at),
                })
            }
            other => {
                *state = other;
                None
            }
        }
    }

    /// Back to Empty, but only if the slot still belongs to `ticket`.
    fn release(&self, ticket: u64) {
        let mut state = self.lock();
        let owned = match &*state {
            SlotState::Pending { ticket: t, .. } | SlotState::Fulfilled { ticket: t, .. } => {
                *t == ticket
            }
            SlotState::Empty => false,
        };
        if owned {
            *state = SlotState::Empty;
        }
    }

    fn is_pending(&self) -> bool {
        !matches!(*self.lock(), SlotState::Empty)
    }
}

/// Clears the slot when a request ends for any reason, including the
/// request future being dropped mid-wait.
struct PendingGuard {
    slot: Arc<Slot>,
    ticket: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.slot.release(self.ticket);
    }
}

/// Delivery side of the waiter: bound to the transport as its handler.
pub struct ReplyInbox {
    layout: TopicLayout,
    slots: DashMap<Identity, Arc<Slot>>,
}

impl ReplyInbox {
    pub fn new(layout: TopicLayout) -> Arc<Self> {
        Arc::new(Self {
            layout,
            slots: DashMap::new(),
        })
    }

    pub fn layout(&self) -> &TopicLayout {
        &self.layout
    }

    /// Number of identities with an open session.
    pub fn session_count(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, identity: &Identity) -> Option<Arc<Slot>> {
        self.slots.get(identity).map(|s| Arc::clone(s.value()))
    }
}

impl MessageHandler for ReplyInbox {
    fn on_message(&self, message: InboundMessage) {
        let identity = match self.layout.identity_from(Category::Download, &message.topic) {
            Ok(identity) => identity,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping reply on unexpected topic");
                return;
            }
        };

        let Some(slot) = self.slot(&identity) else {
            tracing::debug!(%identity, "Dropping reply for unknown session");
            return;
        };

        let reply = match Envelope::decode_bytes(&message.payload) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(%identity, error = %e, "Dropping malformed reply");
                return;
            }
        };

        let name = reply.name().to_string();
        if slot.fulfill(reply) {
            tracing::debug!(%identity, %name, "Reply delivered");
        } else {
            tracing::debug!(%identity, %name, "Dropping reply with no pending request");
        }
    }
}

/// Turns publish + asynchronous reply into one bounded call.
pub struct CorrelationWaiter {
    inbox: Arc<ReplyInbox>,
    transport: Arc<dyn Transport>,
}

impl CorrelationWaiter {
    /// `inbox` must be the handler `transport` was connected with.
    pub fn new(inbox: Arc<ReplyInbox>, transport: Arc<dyn Transport>) -> Self {
        Self { inbox, transport }
    }

    pub fn layout(&self) -> &TopicLayout {
        self.inbox.layout()
    }

    /// Subscribe to the identity's reply topic. Idempotent.
    pub async fn open(&self, identity: &Identity) -> Result<(), CorrelationError> {
        self.session(identity).await?;
        Ok(())
    }

    /// Drop the identity's slot and unsubscribe from its reply topic.
    ///
    /// Returns `false` if no session was open. Fails with
    /// [`CorrelationError::Busy`] while a request is outstanding; a request
    /// racing with `close` on the same identity may time out.
    pub async fn close(&self, identity: &Identity) -> Result<bool, CorrelationError> {
        let removed = self
            .inbox
            .slots
            .remove_if(identity, |_, slot| !slot.is_pending());
        if removed.is_none() {
            if self.is_pending(identity) {
                return Err(CorrelationError::Busy(identity.clone()));
            }
            return Ok(false);
        }

        let topic = self.layout().topic_for(Category::Download, identity);
        self.transport.unsubscribe(&topic).await?;
        tracing::debug!(%identity, %topic, "Session closed");
        Ok(true)
    }

    pub fn is_pending(&self, identity: &Identity) -> bool {
        self.inbox.slot(identity).is_some_and(|s| s.is_pending())
    }

    async fn session(&self, identity: &Identity) -> Result<Arc<Slot>, TransportError> {
        if let Some(slot) = self.inbox.slot(identity) {
            return Ok(slot);
        }

        // Subscribe before the slot exists, so no request for this identity
        // can publish ahead of its reply subscription.
        let topic = self.layout().topic_for(Category::Download, identity);
        self.transport.subscribe(&topic).await?;
        tracing::debug!(%identity, %topic, "Session opened");

        Ok(Arc::clone(
            &self
                .inbox
                .slots
                .entry(identity.clone())
                .or_insert_with(|| Arc::new(Slot::new())),
        ))
    }

    /// Publish `envelope` for `identity` and wait up to `timeout` for the
    /// reply on the identity's download topic.
    ///
    /// Fails fast with [`CorrelationError::Busy`] if the identity already
    /// has a request outstanding. On timeout the slot is cleared and any
    /// later reply is dropped.
    pub async fn request(
        &self,
        identity: &Identity,
        envelope: Envelope,
        timeout: Duration,
    ) -> Result<ReplyRecord, CorrelationError> {
        let slot = self.session(identity).await?;

        let Some((ticket, submitted_at)) = slot.begin(envelope.name()) else {
            tracing::debug!(%identity, "Rejecting request: another is pending");
            return Err(CorrelationError::Busy(identity.clone()));
        };
        let _pending = PendingGuard {
            slot: Arc::clone(&slot),
            ticket,
        };

        let topic = self.layout().topic_for(Category::Upload, identity);
        tracing::info!(
            %identity,
            name = envelope.name(),
            bytes = envelope.content().len(),
            "Sending request"
        );
        self.transport.publish(&topic, envelope.encode()).await?;

        let deadline = submitted_at
            .checked_add(timeout)
            .unwrap_or_else(|| submitted_at + Duration::from_secs(86_400 * 365));

        loop {
            if let Some(record) = slot.take(ticket, deadline) {
                tracing::info!(%identity, name = %record.name, duration = ?record.duration, "Reply received");
                return Ok(record);
            }

            if tokio::time::timeout_at(deadline, slot.ready.notified())
                .await
                .is_err()
            {
                // The reply may have landed just before the timer fired.
                if let Some(record) = slot.take(ticket, deadline) {
                    return Ok(record);
                }
                tracing::warn!(%identity, ?timeout, "Timed out waiting for reply");
                return Err(CorrelationError::Timeout {
                    identity: identity.clone(),
                    timeout,
                });
            }
        }
    }
}
