//! MQTT transport implementation using `rumqttc`.
//!
//! ## Concurrency model
//!
//! - A single background **actor task** owns the MQTT `EventLoop`.
//! - The actor publishes outbound messages, registers broker subscriptions,
//!   polls the `EventLoop` for incoming publishes, and shuts the connection
//!   down.
//! - All interaction with the MQTT client is serialized through this actor;
//!   no other task ever touches the event loop directly. The actor only uses
//!   the non-blocking `try_*` client calls so it can never wait on its own
//!   request queue.
//!
//! ## Connection behavior
//!
//! [`create_transport`] drives the event loop until the first CONNACK. A
//! refused or failed first connection is returned as a connection error and
//! the actor stops; it is not retried. After that, disconnects are retried
//! every [`RECONNECT_DELAY`] and all topics are resubscribed on reconnect.
//!
//! ## Message delivery semantics
//!
//! Payloads are opaque bytes; envelope encoding happens above this layer.
//! Incoming publishes are matched against every local subscription filter
//! (MQTT wildcard rules) and delivered once to each matching inbox:
//!
//! - Delivery is best-effort and non-durable (QoS 0).
//! - A full inbox drops the message (with a warning) rather than stalling
//!   the event loop; a closed inbox is evicted.
//!
//! ## Subscription confirmation
//!
//! Subscriptions wait for SUBACK confirmation from the broker before
//! returning success. SUBACK packets carry only packet IDs, so subscribe
//! requests are serialized (one outstanding at a time).

use rumqttc::{
    //
    AsyncClient,
    ConnectReturnCode,
    Event,
    EventLoop,
    MqttOptions,
    Packet,
    Publish,
    QoS,
    SubscribeFilter,
};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;

use super::topic_filter;
use crate::{
    //
    log_debug,
    log_error,
    log_info,
    log_warn,
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

const RECONNECT_DELAY: Duration = Duration::from_secs(2);
const DEFAULT_PORT: u16 = 1883;
const CLIENT_QUEUE_CAPACITY: usize = 64;

/// Subscription filter -> inboxes registered for it.
type SubscriberMap = Arc<RwLock<HashMap<String, Vec<mpsc::Sender<Delivery>>>>>;

//
// Actor commands
//

enum Cmd {
    //
    Publish {
        topic: String,
        payload: Bytes,
        resp: oneshot::Sender<Result<()>>,
    },
    Subscribe {
        topics: Vec<String>,
        resp: oneshot::Sender<Result<()>>,
    },
    Close {
        resp: oneshot::Sender<Result<()>>,
    },
}

enum ActorStep {
    //
    Continue,
    Stop,
}

impl Cmd {
    // ---

    /// Dispatches an actor command to the correct handler on the actor
    fn handle(self, actor: &mut MqttActor) -> ActorStep {
        // ---
        match self {
            Cmd::Publish {
                topic,
                payload,
                resp,
            } => {
                let _ = resp.send(actor.handle_publish(topic, payload));
                ActorStep::Continue
            }
            Cmd::Subscribe { topics, resp } => {
                actor.handle_subscribe(topics, resp);
                ActorStep::Continue
            }
            Cmd::Close { resp } => {
                actor.handle_close();
                let _ = resp.send(Ok(()));
                ActorStep::Stop
            }
        }
    }
}

/// MQTT-based implementation of the `Transport` trait.
///
/// Represents a single broker connection.
struct RumqttcTransport {
    // ---
    base: TransportBase,
    cmd_tx: mpsc::Sender<Cmd>,
    subscribers: SubscriberMap,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct MqttActor {
    // ---
    transport_id: String, // for logging only
    client: AsyncClient,
    event_loop: EventLoop,
    cmd_rx: mpsc::Receiver<Cmd>,
    subscribers: SubscriberMap,
    /// The one subscribe request awaiting its SUBACK.
    pending_subscribe: Option<(Vec<String>, oneshot::Sender<Result<()>>)>,
    /// Completed on the first CONNACK (or first failure).
    ready: Option<oneshot::Sender<Result<()>>>,
    reconnect: bool,
}

impl MqttActor {
    // ---

    async fn run(mut self) {
        // ---
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if matches!(cmd.handle(&mut self), ActorStep::Stop) {
                                break;
                            }
                        }
                        None => break,
                    }
                }

                event = self.event_loop.poll() => {
                    match event {
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            self.handle_incoming(publish).await;
                        }
                        Ok(Event::Incoming(Packet::SubAck(suback))) => {
                            self.handle_suback(suback);
                        }
                        Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                            self.handle_connack(connack).await;
                        }
                        Ok(_event) => {
                            // Other events (PingResp, outgoing packets, etc.) - ignore
                            log_debug!("{}: received mqtt event (ignored): {:?}",
                                       self.transport_id, _event);
                        }
                        Err(err) => {
                            if let Some(ready) = self.ready.take() {
                                log_error!("{}: connection failed: {err}", self.transport_id);
                                let _ = ready.send(Err(Error::Connection(err.to_string())));
                                break;
                            }

                            if is_disconnect(&err) {
                                self.reconnect = true;
                                log_error!("{}: broker disconnected: {err}", self.transport_id);
                            } else {
                                log_error!("{}: mqtt error: {err}", self.transport_id);
                            }
                            self.fail_pending_subscribe();
                            tokio::time::sleep(RECONNECT_DELAY).await;
                        }
                    }
                }
            }
        }

        log_debug!("{}: mqtt actor stopped", self.transport_id);
    }

    /// Publishes raw bytes with QoS 0 (at most once).
    fn handle_publish(&mut self, topic: String, payload: Bytes) -> Result<()> {
        // ---
        self.client
            .try_publish(topic.as_str(), QoS::AtMostOnce, false, payload.to_vec())
            .map_err(|err| {
                log_error!(
                    "{}: publish failed for topic {topic}: {err}",
                    self.transport_id
                );
                Error::Transport(format!("publish to {topic} failed: {err}"))
            })
    }

    /// Sends a SUBSCRIBE for all `topics` and parks `resp` until the SUBACK.
    fn handle_subscribe(&mut self, topics: Vec<String>, resp: oneshot::Sender<Result<()>>) {
        // ---
        if self.pending_subscribe.is_some() {
            log_error!(
                "{}: attempted concurrent subscribe while one is pending",
                self.transport_id
            );
            let _ = resp.send(Err(Error::Connection("subscribe already in progress".into())));
            return;
        }

        let filters = topics
            .iter()
            .map(|topic| SubscribeFilter::new(topic.clone(), QoS::AtMostOnce));

        if let Err(err) = self.client.try_subscribe_many(filters) {
            log_error!(
                "{}: failed to send subscribe for {topics:?}: {err}",
                self.transport_id
            );
            let _ = resp.send(Err(Error::Connection(format!("subscribe failed: {err}"))));
            return;
        }

        self.pending_subscribe = Some((topics, resp));
    }

    /// Completes the pending subscription from the broker's SUBACK.
    fn handle_suback(&mut self, suback: rumqttc::SubAck) {
        // ---
        let Some((topics, responder)) = self.pending_subscribe.take() else {
            // This is a reconnect re-subscribe SUBACK - ignore
            log_debug!("{}: SUBACK received for reconnect re-subscribe", self.transport_id);
            return;
        };

        let success = suback
            .return_codes
            .iter()
            .all(|code| !matches!(code, rumqttc::SubscribeReasonCode::Failure));

        if success {
            log_info!("{}: subscribed to {topics:?}", self.transport_id);
            let _ = responder.send(Ok(()));
        } else {
            log_error!(
                "{}: subscription refused for {topics:?}: {:?}",
                self.transport_id,
                suback.return_codes
            );
            let _ = responder.send(Err(Error::Connection(format!(
                "broker refused subscription to {topics:?}"
            ))));
        }
    }

    fn fail_pending_subscribe(&mut self) {
        // ---
        if let Some((topics, responder)) = self.pending_subscribe.take() {
            let _ = responder.send(Err(Error::Connection(format!(
                "connection lost while subscribing to {topics:?}"
            ))));
        }
    }

    /// Handles the broker's CONNACK: signals readiness on the first one,
    /// resubscribes after a reconnect.
    async fn handle_connack(&mut self, connack: rumqttc::ConnAck) {
        // ---
        if connack.code != ConnectReturnCode::Success {
            log_error!(
                "{}: connection refused: {:?}",
                self.transport_id,
                connack.code
            );
            return;
        }

        log_info!("{}: connected to broker", self.transport_id);

        if let Some(ready) = self.ready.take() {
            let _ = ready.send(Ok(()));
        }

        if self.reconnect {
            self.reconnect = false;

            let topics: Vec<String> = {
                let map = self.subscribers.read().await;
                map.keys().cloned().collect()
            };
            if topics.is_empty() {
                return;
            }

            let filters = topics
                .iter()
                .map(|topic| SubscribeFilter::new(topic.clone(), QoS::AtMostOnce));

            match self.client.try_subscribe_many(filters) {
                Ok(()) => log_info!("{}: resubscribed to {topics:?}", self.transport_id),
                Err(_err) => log_error!(
                    "{}: resubscribe failed for {topics:?}: {_err}",
                    self.transport_id
                ),
            }
        }
    }

    /// Disconnects from the MQTT broker.
    fn handle_close(&mut self) {
        // ---
        log_debug!("{}: disconnecting mqtt client", self.transport_id);

        if let Err(_err) = self.client.try_disconnect() {
            log_debug!("{}: mqtt disconnect failed: {_err}", self.transport_id);
        }
    }

    /// Fans an incoming publish out to every inbox whose filter matches.
    ///
    /// Each inbox receives the message once even if several of its filters
    /// match. Closed inboxes are evicted.
    async fn handle_incoming(&mut self, publish: Publish) {
        // ---
        let topic = Topic::from(publish.topic.as_str());
        let payload = publish.payload;

        let targets = {
            let map = self.subscribers.read().await;
            let mut targets: Vec<mpsc::Sender<Delivery>> = Vec::new();
            for (filter, senders) in map.iter() {
                if !topic_filter::matches(filter, topic.as_str()) {
                    continue;
                }
                for tx in senders {
                    if !targets.iter().any(|t| t.same_channel(tx)) {
                        targets.push(tx.clone());
                    }
                }
            }
            targets
        };

        let mut saw_closed = false;

        for tx in targets {
            let delivery = Delivery {
                topic: topic.clone(),
                payload: payload.clone(),
            };
            match tx.try_send(delivery) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    log_warn!(
                        "{}: inbox full, dropping message on {topic}",
                        self.transport_id
                    );
                }
                Err(TrySendError::Closed(_)) => saw_closed = true,
            }
        }

        if saw_closed {
            let mut map = self.subscribers.write().await;
            for senders in map.values_mut() {
                senders.retain(|tx| !tx.is_closed());
            }
            map.retain(|_, senders| !senders.is_empty());
        }
    }
} // MqttActor

fn is_disconnect(err: &rumqttc::ConnectionError) -> bool {
    // ---
    matches!(
        err,
        rumqttc::ConnectionError::Io(_) | rumqttc::ConnectionError::MqttState(_)
    )
}

fn actor_gone() -> Error {
    Error::Transport("mqtt actor stopped".into())
}

#[async_trait::async_trait]
impl Transport for RumqttcTransport {
    // ---
    fn base(&self) -> &TransportBase {
        &self.base
    }

    async fn publish(&self, topic: &Topic, payload: Bytes) -> Result<()> {
        // ---
        let (tx, rx) = oneshot::channel();

        self.cmd_tx
            .send(Cmd::Publish {
                topic: topic.to_string(),
                payload,
                resp: tx,
            })
            .await
            .map_err(|_| actor_gone())?;

        rx.await.map_err(|_| actor_gone())?
    }

    async fn subscribe(&self, topics: &[Topic]) -> Result<Inbox> {
        // ---
        let mut filters: Vec<String> = topics.iter().map(Topic::to_string).collect();
        filters.sort();
        filters.dedup();

        let (tx, rx) = mpsc::channel(self.base.inbox_capacity);
        {
            let mut map = self.subscribers.write().await;
            for filter in &filters {
                map.entry(filter.clone()).or_default().push(tx.clone());
            }
        }

        let (resp_tx, resp_rx) = oneshot::channel();

        self.cmd_tx
            .send(Cmd::Subscribe {
                topics: filters,
                resp: resp_tx,
            })
            .await
            .map_err(|_| Error::Connection("mqtt actor stopped".into()))?;

        resp_rx
            .await
            .map_err(|_| Error::Connection("mqtt actor stopped".into()))??;

        Ok(Inbox { deliveries: rx })
    }

    async fn close(&self) -> Result<()> {
        // ---
        let (tx, rx) = oneshot::channel();

        let _ = self.cmd_tx.send(Cmd::Close { resp: tx }).await;
        let _ = rx.await;

        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }

        self.subscribers.write().await.clear();
        Ok(())
    }
}

/// Creates a rumqttc-based MQTT transport and waits for the broker to
/// accept the connection.
///
/// # Errors
///
/// Returns [`Error::Connection`] if:
/// - the broker URI cannot be parsed
/// - the broker refuses or cannot be reached
/// - no CONNACK arrives within `config.connect_timeout`
pub async fn create_transport(config: &TransportConfig) -> Result<TransportPtr> {
    // ---
    let (client, event_loop) = create_mqtt_client(config)?;

    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (ready_tx, ready_rx) = oneshot::channel();
    let subscribers: SubscriberMap = Arc::new(RwLock::new(HashMap::new()));

    let actor = MqttActor {
        transport_id: config.client_id.clone(),
        client,
        event_loop,
        cmd_rx,
        subscribers: Arc::clone(&subscribers),
        pending_subscribe: None,
        ready: Some(ready_tx),
        reconnect: false,
    };

    let handle = tokio::spawn(actor.run());

    match tokio::time::timeout(config.connect_timeout, ready_rx).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(err))) => return Err(err),
        Ok(Err(_)) => {
            return Err(Error::Connection("mqtt actor stopped before connecting".into()));
        }
        Err(_) => {
            handle.abort();
            log_error!(
                "{}: no CONNACK from {} within {:?}",
                config.client_id,
                config.uri,
                config.connect_timeout
            );
            return Err(Error::Connection(format!(
                "timed out connecting to {}",
                config.uri
            )));
        }
    }

    Ok(Arc::new(RumqttcTransport {
        base: TransportBase::from(config),
        cmd_tx,
        subscribers,
        task: Mutex::new(Some(handle)),
    }))
}

/// Creates an MQTT client and event loop from the given configuration.
///
/// Fallible only due to URI parsing; the connection itself is made by the
/// first `EventLoop::poll`.
fn create_mqtt_client(config: &TransportConfig) -> Result<(AsyncClient, EventLoop)> {
    // ---
    let (host, port) = parse_broker_uri(&config.uri)?;

    let mut mqtt_options = MqttOptions::new(config.client_id.as_str(), host, port);

    if let Some(keep_alive_secs) = config.keep_alive_secs {
        mqtt_options.set_keep_alive(Duration::from_secs(u64::from(keep_alive_secs)));
    }

    Ok(AsyncClient::new(mqtt_options, CLIENT_QUEUE_CAPACITY))
}

/// Splits `mqtt://host:port` (or `tcp://`, or bare `host[:port]`) into host and port.
fn parse_broker_uri(uri: &str) -> Result<(String, u16)> {
    // ---
    let addr = uri
        .strip_prefix("mqtt://")
        .or_else(|| uri.strip_prefix("tcp://"))
        .unwrap_or(uri)
        .trim_end_matches('/');

    if addr.is_empty() {
        return Err(Error::Connection(format!("no broker host in uri {uri:?}")));
    }

    match addr.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse().map_err(|_err| {
                log_error!("rumqttc: invalid port in broker URI {uri}: {_err}");
                Error::Connection(format!("invalid port in broker uri {uri:?}"))
            })?;
            Ok((host.to_string(), port))
        }
        None => Ok((addr.to_string(), DEFAULT_PORT)),
    }
}
