// src/domain/transport.rs

//! Transport domain abstractions.
//!
//! This module defines the domain-level interface the session layer uses to
//! exchange raw message bytes over a publish/subscribe system. It
//! intentionally avoids any reference to concrete protocols, brokers, or
//! client libraries.
//!
//! The transport layer is responsible only for delivering opaque payloads
//! published on a topic to everyone subscribed to that topic. Envelope
//! encoding, correlation and timeouts are handled elsewhere.
//!
//! Concrete implementations of this interface live under `src/transport/`.

use crate::Result;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

/// A pub/sub topic name.
///
/// Its interpretation is transport-specific (an MQTT topic, a hub key), but
/// it is treated as an opaque identifier at the domain level. Topics are
/// immutable, cheap to clone, and safe to share across threads.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic(pub Arc<str>);

impl Topic {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<T> From<T> for Topic
where
    T: Into<Arc<str>>,
{
    fn from(value: T) -> Self {
        Topic(value.into())
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl PartialEq<str> for Topic {
    fn eq(&self, other: &str) -> bool {
        &*self.0 == other
    }
}

impl PartialEq<&str> for Topic {
    fn eq(&self, other: &&str) -> bool {
        &*self.0 == *other
    }
}

/// One message handed up by the transport: the topic it arrived on and the
/// raw bytes that were published.
#[derive(Clone, Debug)]
pub struct Delivery {
    // ---
    pub topic: Topic,
    pub payload: Bytes,
}

/// Handle returned from a successful subscription.
///
/// Every message published on any of the subscribed topics is delivered to
/// `deliveries`, in the per-topic order the transport provides. The
/// subscription stays active until the handle is dropped or the transport
/// is closed.
///
/// # Example
///
/// ```no_run
/// # use mom_reqrep::{Topic, TransportConfig};
/// # async fn example() -> mom_reqrep::Result<()> {
/// let transport = mom_reqrep::connect(&TransportConfig::memory("app")).await?;
///
/// let mut inbox = transport.subscribe(&[Topic::from("notifications")]).await?;
///
/// while let Some(delivery) = inbox.deliveries.recv().await {
///     println!("{}: {} bytes", delivery.topic, delivery.payload.len());
/// }
/// # Ok(())
/// # }
/// ```
pub struct Inbox {
    // ---
    pub deliveries: mpsc::Receiver<Delivery>,
}

/// Shared base state for all transport implementations.
///
/// Each concrete transport embeds this as a field named `base` so the
/// default `Transport` methods can delegate to it.
pub struct TransportBase {
    /// Client identifier of this connection (used for logging).
    pub transport_id: String,
    /// Capacity of each inbox channel handed out by `subscribe()`.
    pub inbox_capacity: usize,
}

impl TransportBase {
    pub fn new(transport_id: impl Into<String>, inbox_capacity: usize) -> Self {
        Self {
            transport_id: transport_id.into(),
            inbox_capacity,
        }
    }
}

impl From<&crate::TransportConfig> for TransportBase {
    fn from(config: &crate::TransportConfig) -> Self {
        // ---
        Self {
            transport_id: config.client_id.clone(),
            inbox_capacity: config.inbox_capacity,
        }
    }
}

/// Transport abstraction.
///
/// A `Transport` is an established connection to a publish/subscribe
/// system offering fire-and-forget delivery. It is the Rust expression of
/// the `connect` / `subscribe` / `publish` / delivery-callback contract the
/// session is built on.
///
/// Implementations must ensure that:
/// - Once `subscribe()` returns successfully, messages published *after*
///   that point on a matching topic are deliverable to the inbox.
/// - Messages published on the subscriber's own topics are delivered too
///   (a participant may message itself).
/// - `publish()` never waits for subscribers to consume the message.
///
/// The in-memory transport serves as the reference implementation.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    // ---
    /// Returns a reference to the shared base state.
    fn base(&self) -> &TransportBase;

    /// Returns the client identifier of the transport.
    fn transport_id(&self) -> &str {
        &self.base().transport_id
    }

    /// Publish raw bytes on a topic.
    async fn publish(&self, topic: &Topic, payload: Bytes) -> Result<()>;

    /// Subscribe to a set of topics, delivering all of them to one inbox.
    async fn subscribe(&self, topics: &[Topic]) -> Result<Inbox>;

    /// Close the transport and release any associated resources.
    async fn close(&self) -> Result<()>;
}

/// Shared transport pointer.
///
/// `.clone()` is cheap and all clones share the same connection.
pub type TransportPtr = Arc<dyn Transport>;
