//! Synchronized state containers.
//!
//! One [`SyncedState`] per logical key presents a single mutable value kept
//! eventually consistent across every context holding a container for the
//! same key: sibling windows in this process through the local bus, other
//! terminals through the transport. Whichever update is applied last wins;
//! there is no merge and no conflict detection, and the order flows built on
//! top rely on that plain overwrite behavior.

use crate::bus::{BusSubscription, SlotChange};
use crate::db::StateStore;
use crate::protocol::{topic_for_key, ConnectionStatus, Envelope};
use crate::transport::{PubSubClient, StatusSubscription, Subscription};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};
use uuid::Uuid;

/// A mutable value replicated across every context holding a container for
/// the same key. Reads and writes look like a local state cell; replication
/// is last-writer-wins and eventually consistent.
pub struct SyncedState<T> {
    inner: Arc<SyncedInner<T>>,
    _topic_sub: Subscription,
    _bus_sub: BusSubscription,
    _status_sub: StatusSubscription,
}

struct SyncedInner<T> {
    key: String,
    topic: String,
    /// Bus origin token; a container never reacts to its own store writes.
    origin: String,
    value: Mutex<T>,
    store: StateStore,
    transport: PubSubClient,
    /// Latched once the post-connect announce has fired.
    announced: AtomicBool,
}

impl<T> SyncedState<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Build the container for `key`.
    ///
    /// Seeds from the durable store when a stored value exists and parses,
    /// from `initial` otherwise. A fresh key writes `initial` back
    /// immediately so the slot is never observed empty again; a corrupt slot
    /// logs a warning and falls back without overwriting it.
    pub fn new(key: &str, initial: T, store: &StateStore, transport: &PubSubClient) -> Self {
        let origin = format!("ctx-{}", Uuid::new_v4());

        let value = match store.get(key) {
            Some(raw) => match serde_json::from_str::<T>(&raw) {
                Ok(stored) => stored,
                Err(e) => {
                    warn!(key, error = %e, "stored value failed to parse, using default");
                    initial
                }
            },
            None => {
                match serde_json::to_string(&initial) {
                    Ok(raw) => {
                        if let Err(e) = store.put(key, &raw, &origin) {
                            warn!(key, error = %e, "failed to seed store");
                        }
                    }
                    Err(e) => warn!(key, error = %e, "default value failed to serialize"),
                }
                initial
            }
        };

        let inner = Arc::new(SyncedInner {
            key: key.to_string(),
            topic: topic_for_key(key),
            origin,
            value: Mutex::new(value),
            store: store.clone(),
            transport: transport.clone(),
            announced: AtomicBool::new(false),
        });

        let topic = inner.topic.clone();
        let topic_sub = {
            let inner = inner.clone();
            transport.subscribe(&topic, move |envelope| inner.apply_remote(envelope))
        };

        let bus_sub = {
            let inner = inner.clone();
            store
                .bus()
                .subscribe(move |change| inner.adopt_sibling_change(change))
        };

        // One-shot announce: the first time the transport reaches Syncing
        // after construction, push the current value so peers that were
        // offline during earlier updates can converge. Best effort only; two
        // peers announcing divergent values race, and the last publish
        // processed wins.
        let status_sub = {
            let inner = inner.clone();
            transport.add_status_listener(move |status| {
                if status == ConnectionStatus::Syncing
                    && !inner.announced.swap(true, Ordering::SeqCst)
                {
                    inner.publish_current();
                }
            })
        };

        Self {
            inner,
            _topic_sub: topic_sub,
            _bus_sub: bus_sub,
            _status_sub: status_sub,
        }
    }

    /// Logical state key this container synchronizes.
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Clone of the current value.
    pub fn get(&self) -> T {
        self.inner.lock_value().clone()
    }

    /// Replace the value: memory first, then durable store, then broadcast.
    ///
    /// Store and publish failures are logged, never surfaced; the in-memory
    /// value is not rolled back when a later step fails, so the local view
    /// may briefly run ahead of storage and peers.
    pub fn set(&self, value: T) {
        self.inner.apply_local(value);
    }

    /// Functional-update form of [`set`](Self::set).
    pub fn update(&self, f: impl FnOnce(&T) -> T) {
        let next = {
            let current = self.inner.lock_value();
            f(&*current)
        };
        self.inner.apply_local(next);
    }
}

impl<T> SyncedInner<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn lock_value(&self) -> MutexGuard<'_, T> {
        match self.value.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn apply_local(&self, value: T) {
        *self.lock_value() = value.clone();

        let raw = match serde_json::to_string(&value) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key = %self.key, error = %e, "value failed to serialize, skipping store and publish");
                return;
            }
        };
        if let Err(e) = self.store.put(&self.key, &raw, &self.origin) {
            warn!(key = %self.key, error = %e, "durable write failed, in-memory value stays ahead");
        }

        match serde_json::to_value(&value) {
            Ok(data) => self.transport.publish(&self.topic, data),
            Err(e) => warn!(key = %self.key, error = %e, "value failed to convert for publish"),
        }
    }

    /// Inbound envelope for this key: overwrite memory and storage
    /// unconditionally. The envelope timestamp is never consulted.
    fn apply_remote(&self, envelope: &Envelope) {
        let incoming: T = match serde_json::from_value(envelope.data.clone()) {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    key = %self.key,
                    sender = %envelope.sender_id,
                    error = %e,
                    "dropping undecodable update"
                );
                return;
            }
        };

        *self.lock_value() = incoming.clone();

        match serde_json::to_string(&incoming) {
            Ok(raw) => {
                if let Err(e) = self.store.put(&self.key, &raw, &self.origin) {
                    warn!(key = %self.key, error = %e, "failed to persist remote update");
                }
            }
            Err(e) => warn!(key = %self.key, error = %e, "remote update failed to re-serialize"),
        }
        debug!(key = %self.key, sender = %envelope.sender_id, "applied remote update");
    }

    /// A sibling context changed our slot: adopt the value and re-publish it
    /// so other terminals hear about changes made by contexts without their
    /// own live connection.
    fn adopt_sibling_change(&self, change: &SlotChange) {
        if change.key != self.key || change.origin == self.origin {
            return;
        }

        let adopted: T = match serde_json::from_str(&change.raw) {
            Ok(value) => value,
            Err(e) => {
                warn!(key = %self.key, error = %e, "dropping undecodable sibling change");
                return;
            }
        };
        *self.lock_value() = adopted;

        if let Ok(data) = serde_json::from_str::<Value>(&change.raw) {
            self.transport.publish(&self.topic, data);
        }
    }

    fn publish_current(&self) {
        let value = self.lock_value().clone();
        match serde_json::to_value(&value) {
            Ok(data) => {
                debug!(key = %self.key, "announcing current value after connect");
                self.transport.publish(&self.topic, data);
            }
            Err(e) => warn!(key = %self.key, error = %e, "announce failed to serialize"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectOptions;
    use crate::transport::BrokerLink;
    use serde_json::json;

    /// Delivers every publish to every attached client, the sender included,
    /// like a real broker fanning out a subscribed topic. Echo suppression
    /// is exercised naturally.
    #[derive(Default)]
    struct MemoryBroker {
        clients: Mutex<Vec<PubSubClient>>,
    }

    impl MemoryBroker {
        fn attach(broker: &Arc<MemoryBroker>, client: &PubSubClient) {
            broker.clients.lock().unwrap().push(client.clone());
            let link = Arc::new(BrokerPort {
                broker: broker.clone(),
            });
            client.test_attach_link(ConnectOptions::new("mqtt://127.0.0.1"), link);
        }
    }

    struct BrokerPort {
        broker: Arc<MemoryBroker>,
    }

    impl BrokerLink for BrokerPort {
        fn subscribe(&self, _topic: &str) -> Result<(), String> {
            Ok(())
        }
        fn unsubscribe(&self, _topic: &str) -> Result<(), String> {
            Ok(())
        }
        fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), String> {
            let clients = { self.broker.clients.lock().unwrap().clone() };
            for client in clients {
                client.inject_message(topic, &payload);
            }
            Ok(())
        }
        fn shutdown(&self) {}
    }

    #[derive(Default)]
    struct CountingLink {
        publishes: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl BrokerLink for CountingLink {
        fn subscribe(&self, _topic: &str) -> Result<(), String> {
            Ok(())
        }
        fn unsubscribe(&self, _topic: &str) -> Result<(), String> {
            Ok(())
        }
        fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), String> {
            self.publishes
                .lock()
                .unwrap()
                .push((topic.to_string(), payload));
            Ok(())
        }
        fn shutdown(&self) {}
    }

    fn offline_client(id: &str) -> PubSubClient {
        PubSubClient::with_client_id(id)
    }

    #[test]
    fn test_read_through_default_is_persisted() {
        let store = StateStore::open_in_memory().unwrap();
        let transport = offline_client("term-1");

        let first =
            SyncedState::new("tableCount", 12usize, &store, &transport);
        assert_eq!(first.get(), 12);

        // A second container for the same key must observe the persisted
        // default, not its own.
        let second = SyncedState::new("tableCount", 99usize, &store, &transport);
        assert_eq!(second.get(), 12);
    }

    #[test]
    fn test_corrupt_slot_falls_back_without_overwriting() {
        let store = StateStore::open_in_memory().unwrap();
        let transport = offline_client("term-1");
        store.put("menuItems", "definitely not json", "seed").unwrap();

        let container = SyncedState::new(
            "menuItems",
            vec!["fallback".to_string()],
            &store,
            &transport,
        );
        assert_eq!(container.get(), vec!["fallback".to_string()]);
        assert_eq!(
            store.get("menuItems").as_deref(),
            Some("definitely not json")
        );
    }

    #[test]
    fn test_set_persists_and_update_composes() {
        let store = StateStore::open_in_memory().unwrap();
        let transport = offline_client("term-1");

        let orders = SyncedState::new("activeOrders", Vec::<String>::new(), &store, &transport);
        orders.set(vec!["order-1".to_string()]);
        orders.update(|current| {
            let mut next = current.clone();
            next.push("order-2".to_string());
            next
        });

        assert_eq!(orders.get(), vec!["order-1", "order-2"]);
        assert_eq!(
            store.get("activeOrders").as_deref(),
            Some("[\"order-1\",\"order-2\"]")
        );
    }

    #[test]
    fn test_last_write_wins_convergence_across_terminals() {
        let broker = Arc::new(MemoryBroker::default());

        let store_x = StateStore::open_in_memory().unwrap();
        let client_x = PubSubClient::with_client_id("term-x");
        MemoryBroker::attach(&broker, &client_x);

        let store_y = StateStore::open_in_memory().unwrap();
        let client_y = PubSubClient::with_client_id("term-y");
        MemoryBroker::attach(&broker, &client_y);

        let x = SyncedState::new("activeOrders", Vec::<String>::new(), &store_x, &client_x);
        let y = SyncedState::new("activeOrders", Vec::<String>::new(), &store_y, &client_y);

        x.set(vec!["a".to_string()]);
        assert_eq!(y.get(), vec!["a".to_string()]);
        assert_eq!(store_y.get("activeOrders").as_deref(), Some("[\"a\"]"));

        y.set(vec!["b".to_string()]);
        assert_eq!(x.get(), vec!["b".to_string()]);
        assert_eq!(y.get(), vec!["b".to_string()]);
        assert_eq!(store_x.get("activeOrders").as_deref(), Some("[\"b\"]"));
    }

    #[test]
    fn test_remote_overwrites_unsynced_local_state() {
        // Documented last-write-wins limitation: a remote update discards
        // whatever the local container held, merged or not.
        let broker = Arc::new(MemoryBroker::default());

        let store_x = StateStore::open_in_memory().unwrap();
        let client_x = PubSubClient::with_client_id("term-x");
        let store_y = StateStore::open_in_memory().unwrap();
        let client_y = PubSubClient::with_client_id("term-y");

        let x = SyncedState::new("activeOrders", Vec::<String>::new(), &store_x, &client_x);
        let y = SyncedState::new("activeOrders", Vec::<String>::new(), &store_y, &client_y);

        // Y queues an order while offline.
        y.set(vec!["local-only".to_string()]);

        MemoryBroker::attach(&broker, &client_x);
        MemoryBroker::attach(&broker, &client_y);
        x.set(vec!["remote".to_string()]);

        assert_eq!(y.get(), vec!["remote".to_string()]);
    }

    #[test]
    fn test_undecodable_remote_update_leaves_value_unchanged() {
        let store = StateStore::open_in_memory().unwrap();
        let client = PubSubClient::with_client_id("term-x");
        let link = Arc::new(CountingLink::default());
        client.test_attach_link(ConnectOptions::new("mqtt://127.0.0.1"), link);

        let container =
            SyncedState::new("tableCount", 5usize, &store, &client);

        let bad = serde_json::to_vec(&Envelope::new("term-other", json!({ "not": "a number" })))
            .unwrap();
        client.inject_message("tillsync/v1/tableCount", &bad);

        assert_eq!(container.get(), 5);
        assert_eq!(store.get("tableCount").as_deref(), Some("5"));
    }

    #[test]
    fn test_sibling_change_is_adopted_and_republished() {
        let store = StateStore::open_in_memory().unwrap();
        let client = PubSubClient::with_client_id("term-x");
        let link = Arc::new(CountingLink::default());
        client.test_attach_link(ConnectOptions::new("mqtt://127.0.0.1"), link.clone());

        let register = SyncedState::new("tables", Vec::<u32>::new(), &store, &client);
        let kitchen = SyncedState::new("tables", Vec::<u32>::new(), &store, &client);
        link.publishes.lock().unwrap().clear();

        register.set(vec![4, 7]);

        // The kitchen window adopted the register's write through the bus.
        assert_eq!(kitchen.get(), vec![4, 7]);
        // Both the original set and the sibling's adopt republished.
        let publishes = link.publishes.lock().unwrap();
        assert_eq!(publishes.len(), 2);
        assert!(publishes
            .iter()
            .all(|(topic, _)| topic.as_str() == "tillsync/v1/tables"));
    }

    #[test]
    fn test_initial_publish_fires_once_on_first_syncing() {
        let client = PubSubClient::with_client_id("term-x");
        let store = StateStore::open_in_memory().unwrap();

        // Construct while disconnected: no announce yet.
        let _container = SyncedState::new("tables", vec![1u32], &store, &client);

        let link = Arc::new(CountingLink::default());
        client.test_attach_link(ConnectOptions::new("mqtt://127.0.0.1"), link.clone());
        assert_eq!(link.publishes.lock().unwrap().len(), 1);

        // A later reconnect does not re-announce.
        client.test_set_status(ConnectionStatus::Reconnecting);
        client.test_set_status(ConnectionStatus::Syncing);
        assert_eq!(link.publishes.lock().unwrap().len(), 1);

        let (topic, payload) = link.publishes.lock().unwrap()[0].clone();
        assert_eq!(topic, "tillsync/v1/tables");
        let envelope: Envelope = serde_json::from_slice(&payload).unwrap();
        assert_eq!(envelope.data, json!([1]));
    }

    #[test]
    fn test_offline_set_still_updates_memory_and_store() {
        let store = StateStore::open_in_memory().unwrap();
        let transport = offline_client("term-1");

        let container = SyncedState::new("stockItems", Vec::<String>::new(), &store, &transport);
        container.set(vec!["flour".to_string()]);

        assert_eq!(container.get(), vec!["flour".to_string()]);
        assert_eq!(store.get("stockItems").as_deref(), Some("[\"flour\"]"));
    }
}
