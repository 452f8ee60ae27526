//! Correlation registry.
//!
//! Tracks outbound requests awaiting a reply. Each entry is created by
//! [`CorrelationRegistry::register`] and removed exactly once by whichever
//! comes first:
//!
//! - a matching reply ([`resolve`](CorrelationRegistry::resolve)),
//! - its timer firing ([`expire`](CorrelationRegistry::expire)),
//! - cancellation: session close, or the waiting caller dropping its
//!   [`PendingReply`].
//!
//! Removal happens under the map lock, so the first event to take the entry
//! settles the request and every later event for the same id finds nothing
//! and does nothing.
//!
//! Per-request overhead is one map entry and one sleeping timer task. There
//! is no hard limit on the number of pending requests; crossing
//! [`PENDING_WARN_THRESHOLD`] is logged once per crossing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::{
    // ---
    log_debug,
    log_warn,
    CorrelationId,
    Envelope,
    Error,
    Result,
    Topic,
};

/// Number of concurrently pending requests above which a warning is logged.
pub(crate) const PENDING_WARN_THRESHOLD: usize = 100;

type Settlement = Result<Envelope>;
type PendingMap = HashMap<CorrelationId, PendingRequest>;

struct PendingRequest {
    /// Target topic, for timeout diagnostics.
    topic: Topic,
    tx: oneshot::Sender<Settlement>,
    timer: JoinHandle<()>,
}

impl PendingRequest {
    fn fulfil(self, envelope: Envelope) {
        self.timer.abort();
        // Receiver gone means the caller stopped waiting.
        let _ = self.tx.send(Ok(envelope));
    }

    fn fail(self, err: Error) {
        self.timer.abort();
        let _ = self.tx.send(Err(err));
    }
}

/// Acquire mutex guard, ignoring poisoning.
///
/// The map has no invariants spanning entries; a panic elsewhere can at
/// worst leave an entry that its timer will still remove.
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Map of pending requests, private to one session.
///
/// Cloning shares the same map (the dispatcher task holds a clone).
#[derive(Clone, Default)]
pub(crate) struct CorrelationRegistry {
    pending: Arc<Mutex<PendingMap>>,
}

impl CorrelationRegistry {
    // ---
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a new pending request bound for `topic`.
    ///
    /// Generates a fresh correlation id, arms a timer for `timeout` and
    /// returns the id (to embed in the outgoing envelope) together with the
    /// handle the caller awaits.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn register(&self, topic: Topic, timeout: Duration) -> (CorrelationId, PendingReply) {
        // ---
        let (tx, rx) = oneshot::channel();

        let mut pending = lock_ignore_poison(&self.pending);

        let mut id = CorrelationId::generate();
        while pending.contains_key(&id) {
            id = CorrelationId::generate();
        }

        let timer = spawn_timer(Arc::downgrade(&self.pending), id.clone(), timeout);
        pending.insert(id.clone(), PendingRequest { topic, tx, timer });

        if pending.len() == PENDING_WARN_THRESHOLD + 1 {
            log_warn!(
                "more than {PENDING_WARN_THRESHOLD} requests pending; replies may not be arriving"
            );
        }
        drop(pending);

        let reply = PendingReply {
            id: id.clone(),
            registry: Arc::downgrade(&self.pending),
            rx,
        };
        (id, reply)
    }

    /// Settle the pending request `id` with `envelope`.
    ///
    /// Returns `false` (and does nothing) if no such request is pending:
    /// already resolved, already timed out, or never registered.
    pub(crate) fn resolve(&self, id: &CorrelationId, envelope: Envelope) -> bool {
        // ---
        match take(&self.pending, id) {
            Some(request) => {
                request.fulfil(envelope);
                true
            }
            None => {
                log_debug!("no pending request for correlation id {id}");
                false
            }
        }
    }

    /// Fail the pending request `id` with [`Error::Timeout`].
    ///
    /// Returns `false` if it was already settled.
    pub(crate) fn expire(&self, id: &CorrelationId) -> bool {
        // ---
        match take(&self.pending, id) {
            Some(request) => {
                log_debug!("request {id} to {} timed out", request.topic);
                let topic = request.topic.to_string();
                // The timer is the running task; do not abort it.
                let _ = request.tx.send(Err(Error::Timeout { topic }));
                true
            }
            None => false,
        }
    }

    /// Fail every pending request with [`Error::Closed`].
    pub(crate) fn close_all(&self) -> usize {
        // ---
        let drained: Vec<PendingRequest> = {
            let mut pending = lock_ignore_poison(&self.pending);
            pending.drain().map(|(_, request)| request).collect()
        };

        let count = drained.len();
        for request in drained {
            request.fail(Error::Closed);
        }
        count
    }

    /// Number of requests currently awaiting a reply.
    pub(crate) fn len(&self) -> usize {
        lock_ignore_poison(&self.pending).len()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: &CorrelationId) -> bool {
        lock_ignore_poison(&self.pending).contains_key(id)
    }
}

fn take(pending: &Mutex<PendingMap>, id: &CorrelationId) -> Option<PendingRequest> {
    lock_ignore_poison(pending).remove(id)
}

fn spawn_timer(
    pending: Weak<Mutex<PendingMap>>,
    id: CorrelationId,
    timeout: Duration,
) -> JoinHandle<()> {
    // ---
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;

        if let Some(pending) = pending.upgrade() {
            CorrelationRegistry { pending }.expire(&id);
        }
    })
}

/// Handle for one in-flight request.
///
/// Await it with [`wait`](Self::wait). Dropping it before the request
/// settles deregisters the request and stops its timer.
pub(crate) struct PendingReply {
    id: CorrelationId,
    registry: Weak<Mutex<PendingMap>>,
    rx: oneshot::Receiver<Settlement>,
}

impl PendingReply {
    // ---
    /// Wait until the request is fulfilled, times out, or is cancelled.
    pub(crate) async fn wait(mut self) -> Result<Envelope> {
        // ---
        match (&mut self.rx).await {
            Ok(settlement) => settlement,
            // Sender dropped without settling: the registry itself is gone.
            Err(_) => Err(Error::Closed),
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        // ---
        if let Some(pending) = self.registry.upgrade() {
            if let Some(request) = take(&pending, &self.id) {
                request.timer.abort();
            }
        }
    }
}
