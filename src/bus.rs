//! In-process change bus.
//!
//! Stands in for the host environment's storage-change events: every durable
//! slot write that actually changes a value is broadcast here so sibling
//! containers in the same process (the register window and the kitchen
//! display sharing one store) observe it. The bus is a plain observer
//! registry; alternate backends (an OS-level local socket between processes)
//! can replace it without touching the sync containers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::warn;

/// A durable-slot change observed by sibling contexts.
#[derive(Debug, Clone)]
pub struct SlotChange {
    /// Logical state key whose slot changed.
    pub key: String,
    /// New raw serialized value.
    pub raw: String,
    /// Origin token of the writer. A context never observes its own writes.
    pub origin: String,
}

type ChangeCallback = dyn Fn(&SlotChange) + Send + Sync;

/// Process-wide broadcast registry for slot changes. Cloning returns a
/// handle to the same bus.
#[derive(Clone, Default)]
pub struct LocalBus {
    inner: Arc<BusInner>,
}

#[derive(Default)]
struct BusInner {
    subscribers: Mutex<HashMap<u64, Arc<ChangeCallback>>>,
    next_token: AtomicU64,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer. Dropping the returned guard removes it.
    pub fn subscribe(
        &self,
        callback: impl Fn(&SlotChange) + Send + Sync + 'static,
    ) -> BusSubscription {
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        match self.inner.subscribers.lock() {
            Ok(mut subscribers) => {
                subscribers.insert(token, Arc::new(callback));
            }
            Err(e) => warn!(error = %e, "bus: subscriber registry poisoned"),
        }
        BusSubscription {
            inner: self.inner.clone(),
            token,
        }
    }

    /// Deliver a change to every observer.
    ///
    /// The callback list is cloned out of the lock first, so observers may
    /// publish or subscribe from inside their handler.
    pub fn publish(&self, change: &SlotChange) {
        let callbacks: Vec<Arc<ChangeCallback>> = match self.inner.subscribers.lock() {
            Ok(subscribers) => subscribers.values().cloned().collect(),
            Err(e) => {
                warn!(error = %e, "bus: subscriber registry poisoned, dropping change");
                return;
            }
        };
        for callback in callbacks {
            callback(change);
        }
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .lock()
            .map(|subscribers| subscribers.len())
            .unwrap_or(0)
    }
}

/// Removes its callback when dropped.
pub struct BusSubscription {
    inner: Arc<BusInner>,
    token: u64,
}

impl Drop for BusSubscription {
    fn drop(&mut self) {
        if let Ok(mut subscribers) = self.inner.subscribers.lock() {
            subscribers.remove(&self.token);
        }
    }
}
