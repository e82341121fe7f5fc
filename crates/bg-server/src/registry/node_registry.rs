//! Directory of known nodes keyed by IP address

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use bg_core::types::{info_str, NodeInfo};
use bg_core::RegistryError;

use super::entry::NodeRegistryEntry;
use crate::coordinator::ServerCoordinator;
use crate::resolver::AddressResolver;

/// Keys searched, in order, for a node's address
const ADDRESS_KEYS: [&str; 3] = ["ip-address", "address", "ip"];

/// Registry of every node the server knows about
///
/// Holds at most one live entry per resolved address. Entries removed by
/// unregistration are kept in a separate archive list for listings.
pub struct NodeRegistry {
    nodes: RwLock<HashMap<String, Arc<NodeRegistryEntry>>>,
    archived: Mutex<Vec<Arc<NodeRegistryEntry>>>,
    coordinator: RwLock<Option<Arc<dyn ServerCoordinator>>>,
    resolver: Arc<dyn AddressResolver>,
}

impl NodeRegistry {
    pub fn new(resolver: Arc<dyn AddressResolver>) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            archived: Mutex::new(Vec::new()),
            coordinator: RwLock::new(None),
            resolver,
        }
    }

    /// Install the coordinator consulted on duplicate pre-registrations
    pub fn set_coordinator(&self, coordinator: Option<Arc<dyn ServerCoordinator>>) {
        *self.coordinator.write() = coordinator;
    }

    pub fn coordinator(&self) -> Option<Arc<dyn ServerCoordinator>> {
        self.coordinator.read().clone()
    }

    pub fn resolver(&self) -> Arc<dyn AddressResolver> {
        Arc::clone(&self.resolver)
    }

    /// Pre-register a node
    ///
    /// The address is read from `ip-address`, `address` or `ip` and resolved
    /// to an IP. If resolution fails the given address is used as is and the
    /// failure is recorded on the new entry. `original-address`, `address`
    /// and `baguette-client-id` are added to `info`.
    ///
    /// When an entry already exists for the address, the installed
    /// coordinator decides whether it is replaced. Without a coordinator the
    /// request is refused and the existing entry is left untouched.
    pub async fn add_node(
        &self,
        mut info: NodeInfo,
        client_id: &str,
    ) -> Result<Arc<NodeRegistryEntry>, RegistryError> {
        let provided = address_from_info(&info).ok_or(RegistryError::MissingAddress)?;

        tracing::debug!("Resolving IP address of {}", provided);
        let (address, resolution_error) = match self.resolver.resolve(&provided).await {
            Ok(ip) => {
                tracing::info!("Provided address {} resolved to {}", provided, ip);
                (ip.to_string(), None)
            }
            Err(e) => {
                tracing::error!("Failed to resolve {}: {}", provided, e);
                (provided.clone(), Some(e))
            }
        };
        info.insert("original-address".into(), Value::String(provided));
        info.insert("address".into(), Value::String(address.clone()));

        let mut nodes = self.nodes.write();
        if nodes.contains_key(&address) {
            let allowed = self
                .coordinator
                .read()
                .as_ref()
                .map(|c| c.allow_already_preregistered_node(&info))
                .unwrap_or(false);
            if !allowed {
                tracing::error!(
                    "Node {} already pre-registered and may not be overwritten",
                    address
                );
                return Err(RegistryError::AlreadyPreregistered(address));
            }
            tracing::info!("Previous info of node {} will be overwritten", address);
        }

        info.insert("baguette-client-id".into(), Value::String(client_id.to_string()));
        let entry = Arc::new(NodeRegistryEntry::new(address.clone(), client_id, &info));
        if let Some(e) = resolution_error {
            entry.add_error(e.to_string());
        }
        nodes.insert(address.clone(), Arc::clone(&entry));
        drop(nodes);

        tracing::debug!("Added node {} ({})", address, client_id);
        Ok(entry)
    }

    /// Drop the live entry for `address`, if any
    pub fn remove_node(&self, address: &str) -> Option<Arc<NodeRegistryEntry>> {
        let removed = self.nodes.write().remove(address);
        if removed.is_some() {
            tracing::debug!("Removed node {}", address);
        }
        removed
    }

    /// Drop the live entry addressed by `info`
    pub fn remove_node_by_info(&self, info: &NodeInfo) -> Option<Arc<NodeRegistryEntry>> {
        address_from_info(info).and_then(|address| self.remove_node(&address))
    }

    pub fn clear_nodes(&self) {
        self.nodes.write().clear();
        tracing::debug!("Cleared node registry");
    }

    /// Move an entry to `ARCHIVED` and out of the live map
    pub fn archive_node(
        &self,
        entry: &Arc<NodeRegistryEntry>,
        info: &NodeInfo,
    ) -> Result<(), RegistryError> {
        let mut nodes = self.nodes.write();
        entry.node_archived(info)?;
        if nodes
            .get(entry.ip_address())
            .is_some_and(|live| Arc::ptr_eq(live, entry))
        {
            nodes.remove(entry.ip_address());
        }
        drop(nodes);

        self.archived.lock().push(Arc::clone(entry));
        tracing::info!("Archived node {}", entry.node_id_and_address());
        Ok(())
    }

    pub fn get_node_by_address(&self, address: &str) -> Option<Arc<NodeRegistryEntry>> {
        self.nodes.read().get(address).cloned()
    }

    pub fn get_node_by_reference(&self, reference: &str) -> Option<Arc<NodeRegistryEntry>> {
        self.nodes
            .read()
            .values()
            .find(|e| e.reference() == reference)
            .cloned()
    }

    pub fn get_node_by_client_id(&self, client_id: &str) -> Option<Arc<NodeRegistryEntry>> {
        self.nodes
            .read()
            .values()
            .find(|e| e.client_id() == client_id)
            .cloned()
    }

    /// Live entries, ordered by address
    pub fn nodes(&self) -> Vec<Arc<NodeRegistryEntry>> {
        let mut nodes: Vec<_> = self.nodes.read().values().cloned().collect();
        nodes.sort_by(|a, b| a.ip_address().cmp(b.ip_address()));
        nodes
    }

    pub fn node_addresses(&self) -> Vec<String> {
        let mut addresses: Vec<_> = self.nodes.read().keys().cloned().collect();
        addresses.sort();
        addresses
    }

    pub fn node_references(&self) -> Vec<String> {
        self.nodes().iter().map(|e| e.reference()).collect()
    }

    pub fn archived_nodes(&self) -> Vec<Arc<NodeRegistryEntry>> {
        self.archived.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }
}

impl std::fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRegistry")
            .field("nodes", &self.len())
            .field("archived", &self.archived.lock().len())
            .finish()
    }
}

fn address_from_info(info: &NodeInfo) -> Option<String> {
    ADDRESS_KEYS
        .iter()
        .filter_map(|key| info_str(info, key))
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
}
