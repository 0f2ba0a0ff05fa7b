//! The rendezvous pattern (spec §4.3): register a one-shot channel before
//! starting an operation whose completion arrives later on a separate
//! streaming channel, then await it. Two distinct registries exist in the
//! session — agent-waiters keyed by `name.namespace`, intercept-waiters
//! keyed by intercept name — both built on this one generic type.

use std::collections::HashMap;

use tokio::sync::{mpsc, Mutex};

use crate::error::SessionError;

/// A transient rendezvous slot (spec §3 "Waiter"). `capacity` is the
/// channel's buffer: intercept-waiters need at least 2, since a WAITING
/// snapshot and its eventual ACTIVE/error snapshot can both be in flight
/// before the waiter drains the first (spec §5).
struct Waiter<V> {
    sender: mpsc::Sender<V>,
}

/// Name → one-shot channel, closed when a matching event arrives (spec §2
/// "Rendezvous Registry"). Registering a key that is already registered is
/// a caller error; callers must register before checking whether the event
/// they're waiting for has already happened, per spec §9's "register, then
/// check, then suspend" ordering — checking first and registering second
/// races the producer.
pub struct WaiterRegistry<V> {
    waiters: Mutex<HashMap<String, Waiter<V>>>,
}

impl<V: Clone + Send + 'static> WaiterRegistry<V> {
    pub fn new() -> Self {
        Self {
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Registers `key` and returns the receiving half. Errors if `key` is
    /// already registered (spec §4.3: "Registering a key already registered
    /// is a caller error").
    pub async fn register(&self, key: &str, capacity: usize) -> Result<mpsc::Receiver<V>, SessionError> {
        let mut guard = self.waiters.lock().await;
        if guard.contains_key(key) {
            return Err(SessionError::WaiterAlreadyRegistered(key.to_owned()));
        }
        let (sender, receiver) = mpsc::channel(capacity);
        guard.insert(key.to_owned(), Waiter { sender });
        Ok(receiver)
    }

    /// Atomically takes and deletes the waiter for `key`, if any, and sends
    /// `value` on it. Fulfilling a key with no registered waiter is a no-op
    /// — the event simply had no one listening (spec §4.4: "fulfills
    /// per-agent waiters whose keys match").
    pub async fn fulfill(&self, key: &str, value: V) {
        let waiter = self.waiters.lock().await.remove(key);
        if let Some(waiter) = waiter {
            // The channel is dropped right after send, closing it for the
            // receiver the way a one-shot would — spec §4.3: "send on
            // channel, close it".
            let _ = waiter.sender.send(value).await;
        }
    }

    /// Removes the waiter for `key` without sending anything — used when a
    /// session is cancelled out from under a pending wait.
    pub async fn cancel(&self, key: &str) {
        self.waiters.lock().await.remove(key);
    }

    pub async fn is_registered(&self, key: &str) -> bool {
        self.waiters.lock().await.contains_key(key)
    }

    /// Wakes every currently-registered waiter with `value` and clears the
    /// registry, without removing a specific key (spec §4.4 "agent init"
    /// waiters: "wakes every agent init waiter (channels are closed; the
    /// slice is cleared)").
    pub async fn fulfill_all(&self, value: V) {
        let mut guard = self.waiters.lock().await;
        let waiters: Vec<_> = guard.drain().collect();
        drop(guard);
        for (_, waiter) in waiters {
            let _ = waiter.sender.send(value.clone()).await;
        }
    }
}

impl<V: Clone + Send + 'static> Default for WaiterRegistry<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fulfill_delivers_exactly_once_and_deregisters() {
        let registry: WaiterRegistry<u32> = WaiterRegistry::new();
        let mut rx = registry.register("k", 2).await.unwrap();

        registry.fulfill("k", 7).await;
        assert_eq!(rx.recv().await, Some(7));

        assert!(!registry.is_registered("k").await);

        // A second registration under the same key succeeds and is not
        // falsely woken by the first fulfillment.
        let mut rx2 = registry.register("k", 2).await.unwrap();
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(20), rx2.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn registering_twice_is_a_caller_error() {
        let registry: WaiterRegistry<u32> = WaiterRegistry::new();
        let _rx = registry.register("k", 2).await.unwrap();
        assert!(registry.register("k", 2).await.is_err());
    }

    #[tokio::test]
    async fn fulfilling_an_unregistered_key_is_a_no_op() {
        let registry: WaiterRegistry<u32> = WaiterRegistry::new();
        registry.fulfill("missing", 1).await;
    }

    #[tokio::test]
    async fn fulfill_all_wakes_every_waiter_and_clears_the_registry() {
        let registry: WaiterRegistry<()> = WaiterRegistry::new();
        let mut a = registry.register("a", 1).await.unwrap();
        let mut b = registry.register("b", 1).await.unwrap();

        registry.fulfill_all(()).await;

        assert_eq!(a.recv().await, Some(()));
        assert_eq!(b.recv().await, Some(()));
        assert!(!registry.is_registered("a").await);
        assert!(!registry.is_registered("b").await);
    }
}
