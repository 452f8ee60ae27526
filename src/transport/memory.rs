//! In-memory transport implementation.
//!
//! This module provides a pure in-process implementation of the domain-level
//! `Transport` trait. It is intended primarily for testing, local execution,
//! and as a reference for transport semantics.
//!
//! ## Reference Semantics
//!
//! - Once `subscribe()` returns successfully, messages published *after* that
//!   point on a subscribed topic are deliverable.
//! - Topics match by exact string equality (no wildcards).
//! - Message delivery is deterministic within a single process.
//! - No messages are dropped due to timing or scheduling; a full inbox
//!   applies backpressure to the publisher instead.
//!
//! ## Non-Goals
//!
//! This transport does not emulate the failure modes, persistence, or
//! delivery guarantees of any specific broker.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::{
    // ---
    log_debug,
    Delivery,
    Error,
    Inbox,
    Result,
    Topic,
    Transport,
    TransportBase,
    TransportConfig,
    TransportPtr,
};

type SenderMap = HashMap<Topic, Vec<mpsc::Sender<Delivery>>>;

/// Shared message bus for the in-memory transport.
///
/// Simulates a broker within a single process. All memory transports that
/// share a `MemoryHub` can publish and receive each other's messages,
/// exactly as clients connected to a real broker would.
///
/// # Usage in tests
///
/// Construct a hub per test for isolation and connect each participant
/// with [`create_memory_transport_with_hub`]:
///
/// ```
/// # use mom_reqrep::{MemoryHub, TransportConfig};
/// # async fn example() -> mom_reqrep::Result<()> {
/// let hub = MemoryHub::new();
///
/// let a = mom_reqrep::create_memory_transport_with_hub(&TransportConfig::memory("svc-a"), hub.clone()).await?;
/// let b = mom_reqrep::create_memory_transport_with_hub(&TransportConfig::memory("svc-b"), hub.clone()).await?;
/// # Ok(())
/// # }
/// ```
pub struct MemoryHub {
    // ---
    subscriptions: RwLock<SenderMap>,
}

impl MemoryHub {
    /// Create a new, empty hub.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    async fn publish(&self, _transport_id: &str, topic: &Topic, payload: Bytes) {
        // ---
        // Snapshot the senders so no lock is held while awaiting capacity.
        let senders = {
            let subs = self.subscriptions.read().await;
            subs.get(topic).cloned().unwrap_or_default()
        };

        log_debug!(
            "{_transport_id}: publish to {topic} ({} subscribers)",
            senders.len()
        );

        let mut saw_closed = false;

        for sender in senders {
            let delivery = Delivery {
                topic: topic.clone(),
                payload: payload.clone(),
            };
            // A closed channel is a dropped Inbox; nothing to deliver to.
            if sender.send(delivery).await.is_err() {
                log_debug!("{_transport_id}: subscriber on {topic} is gone");
                saw_closed = true;
            }
        }

        if saw_closed {
            self.evict_closed().await;
        }
    }

    /// Drop subscriptions whose inbox receiver no longer exists.
    async fn evict_closed(&self) {
        // ---
        let mut subs = self.subscriptions.write().await;
        for list in subs.values_mut() {
            list.retain(|s| !s.is_closed());
        }
        subs.retain(|_, list| !list.is_empty());
    }

    async fn subscribe(&self, topics: &[Topic], sender: &mpsc::Sender<Delivery>) {
        // ---
        let mut subs = self.subscriptions.write().await;
        for topic in topics {
            let senders = subs.entry(topic.clone()).or_default();
            if !senders.iter().any(|s| s.same_channel(sender)) {
                senders.push(sender.clone());
            }
        }
    }

    /// Remove every subscription backed by one of `senders`.
    async fn unsubscribe_all(&self, senders: &[mpsc::Sender<Delivery>]) {
        // ---
        let mut subs = self.subscriptions.write().await;
        for list in subs.values_mut() {
            list.retain(|s| !senders.iter().any(|own| own.same_channel(s)));
        }
        subs.retain(|_, list| !list.is_empty());
    }

    /// Number of live subscriptions on `topic`.
    pub async fn subscriber_count(&self, topic: &Topic) -> usize {
        // ---
        let subs = self.subscriptions.read().await;
        subs.get(topic)
            .map(|list| list.iter().filter(|s| !s.is_closed()).count())
            .unwrap_or(0)
    }

    /// Number of registered senders on `topic`, closed or not.
    #[cfg(test)]
    pub(crate) async fn entry_count(&self, topic: &Topic) -> usize {
        self.subscriptions
            .read()
            .await
            .get(topic)
            .map_or(0, Vec::len)
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
        }
    }
}

/// Process-global hub used by [`create_memory_transport`].
static GLOBAL_HUB: OnceLock<Arc<MemoryHub>> = OnceLock::new();

fn global_hub() -> Arc<MemoryHub> {
    GLOBAL_HUB.get_or_init(MemoryHub::new).clone()
}

/// In-memory transport.
///
/// Routes messages through a shared [`MemoryHub`]. Closing a transport only
/// removes its own subscriptions; other participants on the hub are not
/// affected.
struct MemoryTransport {
    // ---
    base: TransportBase,
    hub: Arc<MemoryHub>,
    /// Senders of every inbox handed out, for `close()`. `None` once closed.
    inboxes: Mutex<Option<Vec<mpsc::Sender<Delivery>>>>,
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    // ---
    fn base(&self) -> &TransportBase {
        &self.base
    }

    async fn publish(&self, topic: &Topic, payload: Bytes) -> Result<()> {
        // ---
        if self.inboxes.lock().await.is_none() {
            return Err(Error::Transport("memory transport closed".into()));
        }
        self.hub.publish(self.transport_id(), topic, payload).await;
        Ok(())
    }

    async fn subscribe(&self, topics: &[Topic]) -> Result<Inbox> {
        // ---
        let mut inboxes = self.inboxes.lock().await;
        let Some(inboxes) = inboxes.as_mut() else {
            return Err(Error::Connection("memory transport closed".into()));
        };

        log_debug!("{}: subscribe to {topics:?}", self.transport_id());

        let (tx, rx) = mpsc::channel(self.base.inbox_capacity);
        self.hub.subscribe(topics, &tx).await;
        inboxes.push(tx);

        Ok(Inbox { deliveries: rx })
    }

    async fn close(&self) -> Result<()> {
        // ---
        log_debug!("{}: closing transport...", self.transport_id());

        let senders = self.inboxes.lock().await.take().unwrap_or_default();
        self.hub.unsubscribe_all(&senders).await;
        Ok(())
    }
}

/// Create a new in-memory transport using the process-global hub.
///
/// All transports created with this function share one message bus,
/// matching the semantics of clients connected to a single broker.
///
/// For isolated parallel testing, use [`create_memory_transport_with_hub`].
///
/// # Errors
///
/// Currently infallible; always returns `Ok`.
pub async fn create_memory_transport(config: &TransportConfig) -> Result<TransportPtr> {
    create_memory_transport_with_hub(config, global_hub()).await
}

/// Create a new in-memory transport on the provided hub.
///
/// # Errors
///
/// Currently infallible; always returns `Ok`.
pub async fn create_memory_transport_with_hub(
    config: &TransportConfig,
    hub: Arc<MemoryHub>,
) -> Result<TransportPtr> {
    // ---
    log_debug!("{}: create memory transport", config.client_id);

    let transport = MemoryTransport {
        base: TransportBase::from(config),
        hub,
        inboxes: Mutex::new(Some(Vec::new())),
    };

    Ok(Arc::new(transport))
}
