//! Request/response correlation table.
//!
//! [`PendingRequests`] maps an outstanding request id to the `oneshot`
//! sender its caller is waiting on. An entry is removed exactly once: by
//! [`resolve`](PendingRequests::resolve) when the answer arrives, by
//! [`remove`](PendingRequests::remove) when the caller gives up, or by
//! [`fail_all`](PendingRequests::fail_all) when the transport goes away.

use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::time::Duration;

use tokio::sync::{Mutex, oneshot};
use tokio::time::Instant;

use crate::error::GatewayError;

/// Outcome delivered to a waiting caller.
pub type PendingResult<T> = Result<T, GatewayError>;

#[derive(Debug)]
struct PendingEntry<T> {
    created_at: Instant,
    tx: oneshot::Sender<PendingResult<T>>,
}

/// Outstanding requests keyed by id, at most one live entry per id.
#[derive(Debug)]
pub struct PendingRequests<K, T> {
    entries: Mutex<HashMap<K, PendingEntry<T>>>,
}

impl<K, T> Default for PendingRequests<K, T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, T> PendingRequests<K, T>
where
    K: Eq + Hash + Clone + Display,
{
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `id` and returns the receiver its answer will arrive on.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidRequest`] if `id` is already
    /// outstanding; ids are never reused while live.
    pub async fn register(&self, id: K) -> Result<oneshot::Receiver<PendingResult<T>>, GatewayError> {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(&id) {
            return Err(GatewayError::InvalidRequest(format!(
                "request id {id} is already outstanding"
            )));
        }
        let (tx, rx) = oneshot::channel();
        entries.insert(
            id,
            PendingEntry {
                created_at: Instant::now(),
                tx,
            },
        );
        Ok(rx)
    }

    /// Delivers `value` to the caller waiting on `id`.
    ///
    /// Returns `false` if no such request is outstanding; the value is
    /// dropped in that case.
    pub async fn resolve(&self, id: &K, value: T) -> bool {
        let Some(entry) = self.entries.lock().await.remove(id) else {
            return false;
        };
        let waited_ms = u64::try_from(entry.created_at.elapsed().as_millis()).unwrap_or(u64::MAX);
        tracing::trace!(%id, waited_ms, "request resolved");
        // The caller may have stopped waiting in the meantime.
        let _ = entry.tx.send(Ok(value));
        true
    }

    /// Removes `id` without answering it. Returns `true` if it was live.
    pub async fn remove(&self, id: &K) -> bool {
        self.entries.lock().await.remove(id).is_some()
    }

    /// Fails every outstanding request with a [`GatewayError::Connection`]
    /// carrying `reason`. Returns how many were failed.
    pub async fn fail_all(&self, reason: &str) -> usize {
        let drained: Vec<_> = self.entries.lock().await.drain().collect();
        let count = drained.len();
        for (_, entry) in drained {
            let _ = entry.tx.send(Err(GatewayError::Connection(reason.to_string())));
        }
        count
    }

    /// Waits up to `deadline` on `rx`; on expiry removes `id` so a late
    /// answer can no longer be delivered.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Timeout`] on expiry, the error the request was
    /// failed with, or [`GatewayError::Connection`] if the table was dropped.
    pub async fn wait(
        &self,
        id: &K,
        rx: oneshot::Receiver<PendingResult<T>>,
        deadline: Duration,
        operation: &str,
    ) -> PendingResult<T> {
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(GatewayError::Connection(format!(
                "{operation} abandoned before a response arrived"
            ))),
            Err(_) => {
                self.remove(id).await;
                Err(GatewayError::timeout(operation, deadline))
            }
        }
    }

    /// Number of outstanding requests.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Returns `true` when nothing is outstanding.
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready};

    #[tokio::test]
    async fn resolves_exactly_once() {
        let table: PendingRequests<u64, &str> = PendingRequests::new();
        let Ok(rx) = table.register(10_000).await else {
            panic!("register failed");
        };
        assert!(table.resolve(&10_000, "first").await);
        assert!(!table.resolve(&10_000, "second").await);
        assert!(table.is_empty().await);

        let Ok(Ok(value)) = rx.await else {
            panic!("expected the first value");
        };
        assert_eq!(value, "first");
    }

    #[tokio::test]
    async fn duplicate_live_id_is_rejected() {
        let table: PendingRequests<u64, ()> = PendingRequests::new();
        let _rx = table.register(5).await;
        assert!(matches!(
            table.register(5).await,
            Err(GatewayError::InvalidRequest(_))
        ));
        assert_eq!(table.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_removes_entry_and_late_resolve_is_dropped() {
        let table: PendingRequests<String, u32> = PendingRequests::new();
        let id = "cmd-1".to_string();
        let Ok(rx) = table.register(id.clone()).await else {
            panic!("register failed");
        };

        let result = table.wait(&id, rx, Duration::from_secs(10), "park").await;
        let Err(GatewayError::Timeout { timeout_ms, .. }) = result else {
            panic!("expected a timeout");
        };
        assert_eq!(timeout_ms, 10_000);
        assert!(table.is_empty().await);
        assert!(!table.resolve(&id, 1).await);
    }

    #[tokio::test]
    async fn fail_all_wakes_waiters_with_connection_error() {
        let table: PendingRequests<u64, ()> = PendingRequests::new();
        let Ok(rx_a) = table.register(1).await else {
            panic!("register failed");
        };
        let Ok(rx_b) = table.register(2).await else {
            panic!("register failed");
        };
        assert_eq!(table.fail_all("device disconnected").await, 2);

        for rx in [rx_a, rx_b] {
            let Ok(Err(GatewayError::Connection(reason))) = rx.await else {
                panic!("expected a connection error");
            };
            assert_eq!(reason, "device disconnected");
        }
    }

    #[tokio::test]
    async fn waiter_stays_pending_until_resolved() {
        let table = std::sync::Arc::new(PendingRequests::<u64, u8>::new());
        let Ok(rx) = table.register(42).await else {
            panic!("register failed");
        };
        let waiter_table = std::sync::Arc::clone(&table);
        let mut waiter = tokio_test::task::spawn(async move {
            waiter_table.wait(&42, rx, Duration::from_secs(60), "get_setting").await
        });
        assert_pending!(waiter.poll());

        assert!(table.resolve(&42, 7).await);
        assert!(waiter.is_woken());
        let Ok(value) = assert_ready!(waiter.poll()) else {
            panic!("expected a value");
        };
        assert_eq!(value, 7);
    }
}
