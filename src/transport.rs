//! MQTT transport layer for inter-terminal state sync.
//!
//! Owns exactly one broker connection and multiplexes logical topics over
//! it. The connection lifecycle is a small state machine driven by the
//! rumqttc event loop; reconnection is automatic with a fixed delay, except
//! after an authorization failure, which is terminal until an explicit new
//! `connect()`. The network side sits behind the [`BrokerLink`] trait so
//! tests can attach an in-memory link.

use crate::config::{parse_broker_endpoint, ConnectOptions};
use crate::protocol::{ConnectionStatus, Envelope};
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Fixed delay between reconnect attempts.
const RECONNECT_DELAY: Duration = Duration::from_secs(3);
/// MQTT keep-alive interval.
const KEEP_ALIVE: Duration = Duration::from_secs(30);
/// Event loop request channel capacity.
const REQUEST_CAP: usize = 64;

// ---------------------------------------------------------------------------
// Broker link seam
// ---------------------------------------------------------------------------

/// Network side of the client. The production implementation wraps the
/// rumqttc handle; tests attach an in-memory link instead.
pub(crate) trait BrokerLink: Send + Sync {
    fn subscribe(&self, topic: &str) -> Result<(), String>;
    fn unsubscribe(&self, topic: &str) -> Result<(), String>;
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), String>;
    fn shutdown(&self);
}

struct MqttLink {
    client: AsyncClient,
}

impl BrokerLink for MqttLink {
    fn subscribe(&self, topic: &str) -> Result<(), String> {
        self.client
            .try_subscribe(topic, QoS::AtMostOnce)
            .map_err(|e| e.to_string())
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), String> {
        self.client.try_unsubscribe(topic).map_err(|e| e.to_string())
    }

    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), String> {
        // QoS 0: at-most-once, matching the fire-and-forget delivery contract.
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload)
            .map_err(|e| e.to_string())
    }

    fn shutdown(&self) {
        let _ = self.client.try_disconnect();
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

type MessageCallback = dyn Fn(&Envelope) + Send + Sync;
type StatusCallback = dyn Fn(ConnectionStatus) + Send + Sync;

struct ActiveLink {
    options: ConnectOptions,
    link: Arc<dyn BrokerLink>,
    cancel: CancellationToken,
    /// Cleared by the event loop task on exit. A dead loop means `connect`
    /// must rebuild even for identical options (fatal auth errors stop the
    /// loop but leave the link installed).
    alive: Arc<AtomicBool>,
}

struct ClientInner {
    client_id: String,
    status: Mutex<ConnectionStatus>,
    status_listeners: Mutex<HashMap<u64, Arc<StatusCallback>>>,
    topics: Mutex<HashMap<String, HashMap<u64, Arc<MessageCallback>>>>,
    active: Mutex<Option<ActiveLink>>,
    next_token: AtomicU64,
    link_generation: AtomicU64,
}

/// Pub/sub client multiplexing every synchronized key over one broker
/// connection. Cloning returns a handle to the same client.
#[derive(Clone)]
pub struct PubSubClient {
    inner: Arc<ClientInner>,
}

impl Default for PubSubClient {
    fn default() -> Self {
        Self::new()
    }
}

impl PubSubClient {
    pub fn new() -> Self {
        Self::with_client_id(format!("tillsync-{}", Uuid::new_v4()))
    }

    /// Construct with an explicit client identity (tests, fixed kiosk IDs).
    pub fn with_client_id(client_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                client_id: client_id.into(),
                status: Mutex::new(ConnectionStatus::Disconnected),
                status_listeners: Mutex::new(HashMap::new()),
                topics: Mutex::new(HashMap::new()),
                active: Mutex::new(None),
                next_token: AtomicU64::new(0),
                link_generation: AtomicU64::new(0),
            }),
        }
    }

    /// Identity carried as `senderId` on every outbound envelope.
    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// Current connection status.
    pub fn status(&self) -> ConnectionStatus {
        self.inner.status()
    }

    /// Whether state is currently flowing (connected and subscribed).
    pub fn is_syncing(&self) -> bool {
        self.status() == ConnectionStatus::Syncing
    }

    /// Open the broker connection described by `options`.
    ///
    /// Idempotent when already connected (or reconnecting) with identical
    /// options; different options force-close the prior connection first.
    /// Must be called from within a tokio runtime: the connection event loop
    /// runs as a spawned task. Never returns an error; failures surface as
    /// status transitions.
    pub fn connect(&self, options: ConnectOptions) {
        let previous = {
            let mut active = match self.inner.active.lock() {
                Ok(a) => a,
                Err(e) => {
                    warn!(error = %e, "connect: link registry poisoned");
                    return;
                }
            };
            if let Some(current) = active.as_ref() {
                if current.options == options && current.alive.load(Ordering::SeqCst) {
                    debug!("connect: already connected with identical options");
                    return;
                }
            }
            active.take()
        };
        if let Some(old) = previous {
            old.cancel.cancel();
            old.link.shutdown();
        }

        self.inner.set_status(ConnectionStatus::Connecting);

        let endpoint = match parse_broker_endpoint(&options.url) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!(url = %options.url, error = %e, "connect: invalid broker URL");
                self.inner.set_status(ConnectionStatus::Error);
                return;
            }
        };

        let mut mqtt_options =
            MqttOptions::new(self.inner.client_id.clone(), endpoint.host, endpoint.port);
        mqtt_options.set_keep_alive(KEEP_ALIVE);
        if let Some((username, password)) = options.handshake_credentials() {
            mqtt_options.set_credentials(username, password);
        }

        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CAP);
        let link: Arc<dyn BrokerLink> = Arc::new(MqttLink { client });
        let cancel = CancellationToken::new();
        let alive = Arc::new(AtomicBool::new(true));

        {
            let mut active = match self.inner.active.lock() {
                Ok(a) => a,
                Err(e) => {
                    warn!(error = %e, "connect: link registry poisoned");
                    return;
                }
            };
            *active = Some(ActiveLink {
                options,
                link: link.clone(),
                cancel: cancel.clone(),
                alive: alive.clone(),
            });
        }
        self.inner.link_generation.fetch_add(1, Ordering::SeqCst);

        info!(client_id = %self.inner.client_id, "connecting to broker");
        tokio::spawn(run_event_loop(
            self.inner.clone(),
            link,
            event_loop,
            cancel,
            alive,
        ));
    }

    /// Force-close the connection. No final reconnect attempt is made and
    /// the stored connection options are cleared. Idempotent.
    pub fn disconnect(&self) {
        let previous = match self.inner.active.lock() {
            Ok(mut active) => active.take(),
            Err(e) => {
                warn!(error = %e, "disconnect: link registry poisoned");
                None
            }
        };
        if let Some(link) = previous {
            link.cancel.cancel();
            link.link.shutdown();
        }
        self.inner.set_status(ConnectionStatus::Disconnected);
    }

    /// Register `callback` for messages on `topic`.
    ///
    /// The first observer for a topic issues a network subscribe (when the
    /// connection is live). Dropping the returned guard removes exactly this
    /// callback; removing the last observer for a topic also issues a
    /// network unsubscribe.
    pub fn subscribe(
        &self,
        topic: &str,
        callback: impl Fn(&Envelope) + Send + Sync + 'static,
    ) -> Subscription {
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        let first = match self.inner.topics.lock() {
            Ok(mut topics) => {
                let observers = topics.entry(topic.to_string()).or_default();
                let first = observers.is_empty();
                observers.insert(token, Arc::new(callback));
                first
            }
            Err(e) => {
                warn!(topic, error = %e, "subscribe: topic registry poisoned");
                false
            }
        };

        if first && self.is_syncing() {
            if let Some(link) = self.inner.current_link() {
                if let Err(e) = link.subscribe(topic) {
                    warn!(topic, error = %e, "network subscribe failed");
                }
            }
        }

        Subscription {
            inner: self.inner.clone(),
            topic: topic.to_string(),
            token,
        }
    }

    /// Publish `data` for other terminals subscribed to `topic`.
    ///
    /// A no-op unless the connection is live: messages are not queued for
    /// later delivery (at-most-once, fire and forget).
    pub fn publish(&self, topic: &str, data: Value) {
        if self.status() != ConnectionStatus::Syncing {
            trace!(topic, "publish: not connected, dropping");
            return;
        }
        let Some(link) = self.inner.current_link() else {
            return;
        };

        let envelope = Envelope::new(&self.inner.client_id, data);
        match serde_json::to_vec(&envelope) {
            Ok(payload) => {
                if let Err(e) = link.publish(topic, payload) {
                    warn!(topic, error = %e, "publish failed");
                }
            }
            Err(e) => warn!(topic, error = %e, "publish: envelope serialization failed"),
        }
    }

    /// Register a status observer.
    ///
    /// The callback is invoked immediately with the current status, so late
    /// subscribers never miss existing state, then on every subsequent
    /// transition. Dropping the guard removes it.
    pub fn add_status_listener(
        &self,
        callback: impl Fn(ConnectionStatus) + Send + Sync + 'static,
    ) -> StatusSubscription {
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        let callback: Arc<StatusCallback> = Arc::new(callback);
        if let Ok(mut listeners) = self.inner.status_listeners.lock() {
            listeners.insert(token, callback.clone());
        }
        callback(self.inner.status());
        StatusSubscription {
            inner: self.inner.clone(),
            token,
        }
    }
}

#[cfg(test)]
impl PubSubClient {
    pub(crate) fn test_attach_link(&self, options: ConnectOptions, link: Arc<dyn BrokerLink>) {
        {
            let mut active = self.inner.active.lock().unwrap();
            *active = Some(ActiveLink {
                options,
                link,
                cancel: CancellationToken::new(),
                alive: Arc::new(AtomicBool::new(true)),
            });
        }
        self.inner.link_generation.fetch_add(1, Ordering::SeqCst);
        self.inner.set_status(ConnectionStatus::Syncing);
    }

    pub(crate) fn test_set_status(&self, status: ConnectionStatus) {
        self.inner.set_status(status);
    }

    pub(crate) fn test_resubscribe(&self) {
        if let Some(link) = self.inner.current_link() {
            self.inner.resubscribe_all(link.as_ref());
        }
    }

    pub(crate) fn inject_message(&self, topic: &str, payload: &[u8]) {
        self.inner.handle_message(topic, payload);
    }

    pub(crate) fn link_generation(&self) -> u64 {
        self.inner.link_generation.load(Ordering::SeqCst)
    }
}

impl ClientInner {
    fn status(&self) -> ConnectionStatus {
        self.status
            .lock()
            .map(|status| *status)
            .unwrap_or(ConnectionStatus::Error)
    }

    fn set_status(&self, next: ConnectionStatus) {
        {
            let mut status = match self.status.lock() {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "status lock poisoned");
                    return;
                }
            };
            if *status == next {
                return;
            }
            *status = next;
        }
        // Listeners run outside the lock and may re-enter the client.
        let listeners: Vec<Arc<StatusCallback>> = match self.status_listeners.lock() {
            Ok(listeners) => listeners.values().cloned().collect(),
            Err(_) => return,
        };
        for listener in listeners {
            listener(next);
        }
    }

    fn current_link(&self) -> Option<Arc<dyn BrokerLink>> {
        self.active
            .lock()
            .ok()
            .and_then(|active| active.as_ref().map(|l| l.link.clone()))
    }

    /// Re-issue network subscriptions for every registered topic. MQTT
    /// subscriptions do not survive a reconnect.
    fn resubscribe_all(&self, link: &dyn BrokerLink) {
        let topics: Vec<String> = match self.topics.lock() {
            Ok(topics) => topics.keys().cloned().collect(),
            Err(_) => return,
        };
        for topic in topics {
            if let Err(e) = link.subscribe(&topic) {
                warn!(topic, error = %e, "resubscribe failed");
            }
        }
    }

    /// Decode and dispatch one inbound message.
    fn handle_message(&self, topic: &str, payload: &[u8]) {
        let envelope: Envelope = match serde_json::from_slice(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(topic, error = %e, "dropping malformed message");
                return;
            }
        };
        if envelope.sender_id == self.client_id {
            trace!(topic, "dropping own echo");
            return;
        }
        // Callbacks run outside the registry lock and may publish in turn.
        let callbacks: Vec<Arc<MessageCallback>> = match self.topics.lock() {
            Ok(topics) => topics
                .get(topic)
                .map(|observers| observers.values().cloned().collect())
                .unwrap_or_default(),
            Err(_) => return,
        };
        for callback in callbacks {
            callback(&envelope);
        }
    }

    fn remove_topic_observer(&self, topic: &str, token: u64) {
        let removed_last = match self.topics.lock() {
            Ok(mut topics) => match topics.get_mut(topic) {
                Some(observers) => {
                    observers.remove(&token);
                    if observers.is_empty() {
                        topics.remove(topic);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            },
            Err(_) => false,
        };

        if removed_last && self.status() == ConnectionStatus::Syncing {
            if let Some(link) = self.current_link() {
                if let Err(e) = link.unsubscribe(topic) {
                    warn!(topic, error = %e, "network unsubscribe failed");
                }
            }
        }
    }

    fn remove_status_listener(&self, token: u64) {
        if let Ok(mut listeners) = self.status_listeners.lock() {
            listeners.remove(&token);
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active.lock() {
            if let Some(link) = active.take() {
                link.cancel.cancel();
                link.link.shutdown();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

fn is_auth_refusal(code: ConnectReturnCode) -> bool {
    matches!(
        code,
        ConnectReturnCode::NotAuthorized | ConnectReturnCode::BadUserNamePassword
    )
}

async fn run_event_loop(
    inner: Arc<ClientInner>,
    link: Arc<dyn BrokerLink>,
    mut event_loop: EventLoop,
    cancel: CancellationToken,
    alive: Arc<AtomicBool>,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            polled = event_loop.poll() => match polled {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!(client_id = %inner.client_id, "broker session established");
                    inner.set_status(ConnectionStatus::Syncing);
                    inner.resubscribe_all(link.as_ref());
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    inner.handle_message(&publish.topic, &publish.payload);
                }
                Ok(_) => {}
                Err(ConnectionError::ConnectionRefused(code)) if is_auth_refusal(code) => {
                    warn!(?code, "broker refused credentials; stopping reconnect attempts");
                    inner.set_status(ConnectionStatus::NotAuthorized);
                    break;
                }
                Err(e) => {
                    let next = if matches!(e, ConnectionError::Io(_)) {
                        ConnectionStatus::Offline
                    } else {
                        ConnectionStatus::Reconnecting
                    };
                    debug!(error = %e, "connection lost, retrying");
                    inner.set_status(next);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    }
                    inner.set_status(ConnectionStatus::Reconnecting);
                }
            }
        }
    }
    alive.store(false, Ordering::SeqCst);
}

// ---------------------------------------------------------------------------
// Subscription guards
// ---------------------------------------------------------------------------

/// Topic subscription guard. Dropping removes the callback; the last removal
/// for a topic also unsubscribes from the broker.
pub struct Subscription {
    inner: Arc<ClientInner>,
    topic: String,
    token: u64,
}

impl Subscription {
    /// Explicit removal; equivalent to dropping the guard.
    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.inner.remove_topic_observer(&self.topic, self.token);
    }
}

/// Status listener guard.
pub struct StatusSubscription {
    inner: Arc<ClientInner>,
    token: u64,
}

impl Drop for StatusSubscription {
    fn drop(&mut self) {
        self.inner.remove_status_listener(self.token);
    }
}
