//! Inbound message dispatcher.
//!
//! Every delivery from the transport is classified exactly once:
//!
//! 1. Bytes that do not decode are reported as [`SessionEvent::Malformed`]
//!    and otherwise discarded.
//! 2. An envelope that arrived on the session's own identifier topic and
//!    carries a non-empty reply id goes to the correlation registry. This
//!    path never produces an event, even when no request matches (the
//!    requester already gave up).
//! 3. Everything else is published as [`SessionEvent::Message`], tagged with
//!    the topic it arrived on.
//!
//! Decode failures never leave the receive loop.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::registry::CorrelationRegistry;
use crate::{
    // ---
    log_debug,
    log_warn,
    protocol,
    Delivery,
    Envelope,
    Inbox,
    Topic,
};

/// A message that is not a reply to one of this session's requests.
#[derive(Clone, Debug)]
pub struct InboundMessage {
    // ---
    /// Topic the message arrived on.
    pub topic: Topic,
    pub envelope: Envelope,
}

impl InboundMessage {
    /// Whether the sender expects an answer (see [`Session::reply`](crate::Session::reply)).
    pub fn is_request(&self) -> bool {
        self.envelope.is_request()
    }
}

/// Notification published on a session's event stream.
#[derive(Clone, Debug)]
pub enum SessionEvent {
    /// An unsolicited message.
    Message(InboundMessage),

    /// Bytes on `topic` that were not a valid envelope.
    Malformed { topic: Topic, reason: Arc<str> },
}

/// Outcome of dispatching one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Route {
    /// Settled a pending request.
    Resolved,
    /// A reply for a request that is no longer pending; dropped.
    Unmatched,
    /// Emitted as an unsolicited message.
    Unsolicited,
    /// Failed to decode.
    Malformed,
}

pub(crate) struct Dispatcher {
    identifier: Topic,
    registry: CorrelationRegistry,
    events: broadcast::Sender<SessionEvent>,
}

impl Dispatcher {
    // ---
    pub(crate) fn new(
        identifier: Topic,
        registry: CorrelationRegistry,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            identifier,
            registry,
            events,
        }
    }

    /// Classify and route a single delivery.
    pub(crate) fn dispatch(&self, delivery: Delivery) -> Route {
        // ---
        let Delivery { topic, payload } = delivery;

        let envelope = match protocol::decode(&payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                log_warn!("{}: discarding malformed message on {topic}: {err}", self.identifier);
                self.emit(SessionEvent::Malformed {
                    topic,
                    reason: Arc::from(err.to_string()),
                });
                return Route::Malformed;
            }
        };

        if topic == self.identifier {
            if let Some(id) = envelope.reply_id().cloned() {
                if self.registry.resolve(&id, envelope) {
                    return Route::Resolved;
                }
                return Route::Unmatched;
            }
        }

        self.emit(SessionEvent::Message(InboundMessage { topic, envelope }));
        Route::Unsolicited
    }

    /// Drive the receive loop until the inbox closes.
    pub(crate) fn spawn(self, mut inbox: Inbox) -> JoinHandle<()> {
        // ---
        tokio::spawn(async move {
            log_debug!("{}: dispatcher started", self.identifier);

            while let Some(delivery) = inbox.deliveries.recv().await {
                self.dispatch(delivery);
            }

            log_debug!("{}: dispatcher stopped", self.identifier);
        })
    }

    fn emit(&self, event: SessionEvent) {
        // No receivers is fine: nobody is listening for unsolicited traffic.
        let _ = self.events.send(event);
    }
}
