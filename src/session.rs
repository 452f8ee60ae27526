//! Request/response session over a publish/subscribe transport.
//!
//! A [`Session`] owns one participant's identity: its private identifier
//! topic (where replies arrive), the shared topics it listens on, the
//! transport connection, and the correlation registry for its in-flight
//! requests.
//!
//! # Protocol
//!
//! - [`send`](Session::send) publishes a one-way message.
//! - [`request`](Session::request) publishes a message carrying a fresh
//!   correlation id as `request_id` and waits for a message on the
//!   session's identifier topic whose `callback_id` equals it.
//! - A responder answers with [`reply`](Session::reply) (or `send` with the
//!   received id), which publishes to the requester's `from_topic` with
//!   `callback_id` set.
//! - Everything that is not a matched reply is delivered on the
//!   [`events`](Session::events) stream.
//!
//! Each request ends exactly once: reply, timeout, or session close.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, OnceCell};
use tokio::task::JoinHandle;

use crate::dispatcher::Dispatcher;
use crate::registry::CorrelationRegistry;
use crate::{
    // ---
    log_error,
    log_info,
    protocol,
    Correlation,
    CorrelationId,
    Envelope,
    Error,
    Result,
    SessionBuilder,
    SessionEvent,
    Topic,
    TransportConfig,
    TransportPtr,
};

/// Acquire mutex guard, ignoring poisoning
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A participant on the pub/sub bus.
///
/// Cheap to clone (internally `Arc`-backed); all clones share one
/// connection and one registry.
///
/// # Example
///
/// ```no_run
/// use mom_reqrep::{Session, TransportConfig};
/// use serde_json::json;
///
/// # async fn example() -> mom_reqrep::Result<()> {
/// let session = Session::builder("svc-a").topic("broadcast").build();
/// session
///     .init(&TransportConfig::with_broker("mqtt://localhost:1883", "svc-a"))
///     .await?;
///
/// let pong = session.request("svc-b", &json!({ "op": "ping" })).await?;
/// println!("{pong}");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

struct Inner {
    // ---
    identifier: Topic,
    topics: Vec<Topic>,
    default_timeout: Mutex<Duration>,
    registry: CorrelationRegistry,
    events: broadcast::Sender<SessionEvent>,
    connection: OnceCell<Connection>,
    closed: AtomicBool,
}

/// Live transport plus the dispatcher task draining its inbox.
struct Connection {
    transport: TransportPtr,
    rx_task: JoinHandle<()>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.rx_task.abort();
    }
}

impl Session {
    // ---
    /// Create an uninitialized session listening on `identifier` plus `topics`.
    ///
    /// Uses the default request timeout. See [`Session::builder`] for the
    /// other options.
    pub fn new<I, T>(identifier: impl Into<Topic>, topics: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Topic>,
    {
        SessionBuilder::new(identifier).topics(topics).build()
    }

    /// Start configuring a session for `identifier`.
    pub fn builder(identifier: impl Into<Topic>) -> SessionBuilder {
        SessionBuilder::new(identifier)
    }

    pub(crate) fn from_parts(
        identifier: Topic,
        topics: Vec<Topic>,
        default_timeout: Duration,
        event_capacity: usize,
    ) -> Self {
        // ---
        let (events, _) = broadcast::channel(event_capacity);

        Self {
            inner: Arc::new(Inner {
                identifier,
                topics,
                default_timeout: Mutex::new(default_timeout),
                registry: CorrelationRegistry::new(),
                events,
                connection: OnceCell::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// This session's private inbound topic.
    pub fn identifier(&self) -> &Topic {
        &self.inner.identifier
    }

    /// Shared topics subscribed in addition to the identifier.
    pub fn topics(&self) -> &[Topic] {
        &self.inner.topics
    }

    /// Timeout applied to requests registered from now on.
    pub fn default_timeout(&self) -> Duration {
        *lock_ignore_poison(&self.inner.default_timeout)
    }

    /// Change the timeout for future requests. In-flight requests keep the
    /// timeout they were registered with.
    pub fn set_default_timeout(&self, timeout: Duration) {
        *lock_ignore_poison(&self.inner.default_timeout) = timeout;
    }

    /// Whether `init` (or `attach`) has completed.
    pub fn is_initialized(&self) -> bool {
        self.inner.connection.initialized()
    }

    /// Number of requests currently awaiting a reply.
    pub fn pending_requests(&self) -> usize {
        self.inner.registry.len()
    }

    /// Subscribe to the stream of unsolicited messages and decode failures.
    ///
    /// Each receiver sees every event published after it was created. A
    /// receiver that falls more than the configured capacity behind skips
    /// the oldest events (`RecvError::Lagged`).
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Connect the transport described by `config`, subscribe to the
    /// identifier and shared topics, and start dispatching.
    ///
    /// Idempotent: once initialized, further calls return `Ok(())` without
    /// doing anything. Concurrent calls connect only once.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] if the transport cannot connect or
    /// subscribe (not retried), [`Error::MissingConfig`] for an incomplete
    /// `config`, or [`Error::Closed`] after [`close`](Self::close).
    pub async fn init(&self, config: &TransportConfig) -> Result<()> {
        // ---
        self.ensure_open()?;

        let connection = self
            .inner
            .connection
            .get_or_try_init(|| async {
                let transport = crate::connect(config).await?;
                self.establish(transport).await
            })
            .await?;
        self.check_not_closed_during_init(connection).await
    }

    /// Like [`init`](Self::init), but over an already-connected transport.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] if subscribing fails, or
    /// [`Error::Closed`] if the session was closed before or during the call.
    pub async fn attach(&self, transport: TransportPtr) -> Result<()> {
        // ---
        self.ensure_open()?;

        let connection = self
            .inner
            .connection
            .get_or_try_init(|| self.establish(transport))
            .await?;
        self.check_not_closed_during_init(connection).await
    }

    /// `close` may have run while the connection was being established and
    /// found nothing to shut down; in that case shut it down here.
    async fn check_not_closed_during_init(&self, connection: &Connection) -> Result<()> {
        // ---
        if !self.inner.closed.load(Ordering::Acquire) {
            return Ok(());
        }

        log_info!("{}: closed during init, shutting connection down", self.inner.identifier);
        connection.rx_task.abort();
        let _ = connection.transport.close().await;
        Err(Error::Closed)
    }

    async fn establish(&self, transport: TransportPtr) -> Result<Connection> {
        // ---
        let mut topics = vec![self.inner.identifier.clone()];
        for topic in &self.inner.topics {
            if !topics.contains(topic) {
                topics.push(topic.clone());
            }
        }

        let inbox = match transport.subscribe(&topics).await {
            Ok(inbox) => inbox,
            Err(err) => {
                log_error!("{}: subscribe failed: {err}", self.inner.identifier);
                let _ = transport.close().await;
                return Err(match err {
                    Error::Connection(msg) => Error::Connection(msg),
                    other => Error::Connection(other.to_string()),
                });
            }
        };

        let dispatcher = Dispatcher::new(
            self.inner.identifier.clone(),
            self.inner.registry.clone(),
            self.inner.events.clone(),
        );
        let rx_task = dispatcher.spawn(inbox);

        log_info!(
            "{}: session initialized, listening on {topics:?}",
            self.inner.identifier
        );

        Ok(Connection { transport, rx_task })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn connection(&self) -> Result<&Connection> {
        // ---
        self.ensure_open()?;
        self.inner.connection.get().ok_or(Error::NotInitialized)
    }

    /// Publish a one-way message to `topic`.
    ///
    /// Pass `correlates_id` to answer a request manually: it must be the
    /// `request_id` of the request being answered, and `topic` its sender.
    /// [`reply`](Self::reply) does both for you.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotInitialized`] before `init`, [`Error::Encode`] if
    /// the payload cannot be serialized, or the transport's publish error.
    pub async fn send<T>(
        &self,
        topic: impl Into<Topic>,
        payload: &T,
        correlates_id: Option<&CorrelationId>,
    ) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        // ---
        let connection = self.connection()?;
        let topic = topic.into();

        let correlation = Correlation::from(correlates_id.cloned());
        let bytes = protocol::encode(self.inner.identifier.as_str(), payload, &correlation)?;

        connection.transport.publish(&topic, bytes).await
    }

    /// Answer a request envelope received on the event stream.
    ///
    /// Publishes `payload` to the request's sender with its `request_id`
    /// echoed back as `callback_id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotARequest`] if `request` has no request id or no
    /// sender, plus everything [`send`](Self::send) can return.
    pub async fn reply<T>(&self, request: &Envelope, payload: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        // ---
        let id = request.request_id().ok_or(Error::NotARequest)?;
        if request.sender.is_empty() {
            return Err(Error::NotARequest);
        }
        self.send(request.sender.as_str(), payload, Some(id)).await
    }

    /// Send a request and return the reply's payload.
    ///
    /// Uses the current [`default_timeout`](Self::default_timeout).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] if no reply arrives in time, plus
    /// everything [`send`](Self::send) can return.
    pub async fn request<T>(&self, topic: impl Into<Topic>, payload: &T) -> Result<Value>
    where
        T: Serialize + ?Sized,
    {
        self.request_full(topic, payload)
            .await
            .map(|envelope| envelope.payload)
    }

    /// Send a request and return the whole reply envelope.
    ///
    /// # Errors
    ///
    /// Same as [`request`](Self::request).
    pub async fn request_full<T>(&self, topic: impl Into<Topic>, payload: &T) -> Result<Envelope>
    where
        T: Serialize + ?Sized,
    {
        let timeout = self.default_timeout();
        self.request_full_with_timeout(topic, payload, timeout).await
    }

    /// Send a request with a one-off timeout and return the reply's payload.
    ///
    /// # Errors
    ///
    /// Same as [`request`](Self::request).
    pub async fn request_with_timeout<T>(
        &self,
        topic: impl Into<Topic>,
        payload: &T,
        timeout: Duration,
    ) -> Result<Value>
    where
        T: Serialize + ?Sized,
    {
        self.request_full_with_timeout(topic, payload, timeout)
            .await
            .map(|envelope| envelope.payload)
    }

    /// Send a request with a one-off timeout and return the whole reply
    /// envelope.
    ///
    /// Dropping the returned future before it completes deregisters the
    /// request.
    ///
    /// # Errors
    ///
    /// Same as [`request`](Self::request).
    pub async fn request_full_with_timeout<T>(
        &self,
        topic: impl Into<Topic>,
        payload: &T,
        timeout: Duration,
    ) -> Result<Envelope>
    where
        T: Serialize + ?Sized,
    {
        // ---
        let connection = self.connection()?;
        let topic = topic.into();

        let (id, reply) = self.inner.registry.register(topic.clone(), timeout);

        // On any error below `reply` is dropped, which deregisters the request.
        let correlation = Correlation::Request(id);
        let bytes = protocol::encode(self.inner.identifier.as_str(), payload, &correlation)?;
        connection.transport.publish(&topic, bytes).await?;

        reply.wait().await
    }

    /// Close the session.
    ///
    /// Fails every pending request with [`Error::Closed`], stops the
    /// dispatcher and closes the transport. Subsequent calls on any clone
    /// fail with [`Error::Closed`]. Closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the transport's close error, if any.
    pub async fn close(&self) -> Result<()> {
        // ---
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let _failed = self.inner.registry.close_all();
        log_info!(
            "{}: closing session ({_failed} pending requests cancelled)",
            self.inner.identifier
        );

        match self.inner.connection.get() {
            Some(connection) => {
                connection.rx_task.abort();
                connection.transport.close().await
            }
            None => Ok(()),
        }
    }
}
