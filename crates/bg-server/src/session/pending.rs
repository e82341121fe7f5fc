//! Correlation of read-back requests with `-INPUT:` replies

use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Outstanding read-back requests of one session, keyed by correlation id
#[derive(Debug, Default)]
pub struct PendingInputs {
    waiters: Mutex<HashMap<String, oneshot::Sender<Value>>>,
}

impl PendingInputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh correlation id and the receiver its reply will arrive on
    pub fn register(&self) -> (String, oneshot::Receiver<Value>) {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(id.clone(), tx);
        (id, rx)
    }

    /// Hand a reply to its waiter. Returns false if nobody waits for `id`.
    pub fn deliver(&self, id: &str, value: Value) -> bool {
        let waiter = self.waiters.lock().remove(id);
        match waiter {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }

    /// Drop the waiter for `id` after a timeout
    pub fn forget(&self, id: &str) {
        self.waiters.lock().remove(id);
    }

    /// Drop every waiter; their receivers observe a closed channel
    pub fn cancel_all(&self) -> usize {
        let mut waiters = self.waiters.lock();
        let count = waiters.len();
        waiters.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_deliver_reaches_matching_waiter_only() {
        let pending = PendingInputs::new();
        let (id_a, rx_a) = pending.register();
        let (id_b, rx_b) = pending.register();
        assert_ne!(id_a, id_b);

        assert!(pending.deliver(&id_b, json!("b")));
        assert!(pending.deliver(&id_a, json!("a")));

        assert_eq!(rx_a.await.unwrap(), json!("a"));
        assert_eq!(rx_b.await.unwrap(), json!("b"));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_id_is_ignored() {
        let pending = PendingInputs::new();
        assert!(!pending.deliver("nope", json!(1)));
    }

    #[tokio::test]
    async fn test_cancel_all_closes_receivers() {
        let pending = PendingInputs::new();
        let (_, rx) = pending.register();
        assert_eq!(pending.cancel_all(), 1);
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_forget() {
        let pending = PendingInputs::new();
        let (id, _rx) = pending.register();
        pending.forget(&id);
        assert!(!pending.deliver(&id, json!(0)));
    }
}
