//! Index of running sessions
//!
//! Owned by the server facade and handed to every session and coordinator.
//! Sessions are indexed both by their session id (the active set, in start
//! order) and by the address they registered under; both views change under
//! the same lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;

use bg_protocol::SessionId;

use super::client::ClientSession;

#[derive(Default)]
struct Index {
    by_id: BTreeMap<SessionId, Arc<ClientSession>>,
    by_address: HashMap<String, Arc<ClientSession>>,
}

/// Running sessions by id and by address
#[derive(Default)]
pub struct ActiveSessions {
    index: Mutex<Index>,
}

impl ActiveSessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session unless another one already holds its address.
    /// On conflict the holder is returned.
    pub fn try_insert(
        &self,
        address: &str,
        session: &Arc<ClientSession>,
    ) -> Result<(), Arc<ClientSession>> {
        let mut index = self.index.lock();
        if let Some(existing) = index.by_address.get(address) {
            return Err(Arc::clone(existing));
        }
        index.by_id.insert(session.id(), Arc::clone(session));
        index
            .by_address
            .insert(address.to_string(), Arc::clone(session));
        Ok(())
    }

    /// Put `session` in place of whatever holds `address`, returning the
    /// displaced session
    pub fn replace(&self, address: &str, session: &Arc<ClientSession>) -> Option<Arc<ClientSession>> {
        let mut index = self.index.lock();
        let previous = index
            .by_address
            .insert(address.to_string(), Arc::clone(session));
        if let Some(previous) = &previous {
            index.by_id.remove(&previous.id());
        }
        index.by_id.insert(session.id(), Arc::clone(session));
        previous
    }

    /// Remove a session. The address slot is only cleared if it still
    /// belongs to this session.
    pub fn remove(&self, address: &str, id: SessionId) -> bool {
        let mut index = self.index.lock();
        let removed = index.by_id.remove(&id).is_some();
        if index
            .by_address
            .get(address)
            .is_some_and(|holder| holder.id() == id)
        {
            index.by_address.remove(address);
        }
        removed
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<ClientSession>> {
        self.index.lock().by_id.get(&id).cloned()
    }

    pub fn get_by_address(&self, address: &str) -> Option<Arc<ClientSession>> {
        self.index.lock().by_address.get(address).cloned()
    }

    /// Look a session up by its display id (`#00001`) or its client id
    pub fn find(&self, id: &str) -> Option<Arc<ClientSession>> {
        let id = id.trim();
        self.index
            .lock()
            .by_id
            .values()
            .find(|s| s.id().to_string() == id || s.client_id() == id)
            .cloned()
    }

    /// Sessions in start order
    pub fn list(&self) -> Vec<Arc<ClientSession>> {
        self.index.lock().by_id.values().cloned().collect()
    }

    pub fn addresses(&self) -> Vec<String> {
        let mut addresses: Vec<_> = self.index.lock().by_address.keys().cloned().collect();
        addresses.sort();
        addresses
    }

    pub fn len(&self) -> usize {
        self.index.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.lock().by_id.is_empty()
    }
}

impl std::fmt::Debug for ActiveSessions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let index = self.index.lock();
        f.debug_struct("ActiveSessions")
            .field("sessions", &index.by_id.keys().collect::<Vec<_>>())
            .finish()
    }
}
