//! Lifecycle record of a single node

use std::fmt;

use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

use bg_core::time::next_stamp;
use bg_core::types::{flatten_info, FlatInfo, NodeInfo, NodeState};
use bg_core::RegistryError;

/// Which metadata map a transition writes to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Preregistration,
    Installation,
    Registration,
    Removal,
}

#[derive(Debug)]
struct EntryState {
    state: NodeState,
    state_last_update: u64,
    reference: String,
    hostname: Option<String>,
    cluster_zone: Option<String>,
    preregistration: FlatInfo,
    installation: FlatInfo,
    registration: FlatInfo,
    removal: FlatInfo,
    errors: Vec<String>,
}

impl EntryState {
    fn section(&mut self, section: Section) -> &mut FlatInfo {
        match section {
            Section::Preregistration => &mut self.preregistration,
            Section::Installation => &mut self.installation,
            Section::Registration => &mut self.registration,
            Section::Removal => &mut self.removal,
        }
    }
}

/// One node known to the registry
///
/// The IP address and client id never change. Everything else sits behind
/// a per-entry lock because sessions, the facade and self-healing all drive
/// transitions concurrently. Once archived, every transition is refused.
pub struct NodeRegistryEntry {
    ip_address: String,
    client_id: String,
    inner: Mutex<EntryState>,
}

/// Flatten an error into node info: `{"exception": "<message>"}`
pub fn error_info(error: &dyn fmt::Display) -> NodeInfo {
    let mut info = NodeInfo::new();
    info.insert("exception".into(), Value::String(error.to_string()));
    info
}

impl NodeRegistryEntry {
    /// Create an entry in state `PREREGISTERED`
    pub fn new(ip_address: impl Into<String>, client_id: impl Into<String>, info: &NodeInfo) -> Self {
        Self {
            ip_address: ip_address.into(),
            client_id: client_id.into(),
            inner: Mutex::new(EntryState {
                state: NodeState::Preregistered,
                state_last_update: next_stamp(0),
                reference: Uuid::new_v4().to_string(),
                hostname: None,
                cluster_zone: None,
                preregistration: flatten_info(info),
                installation: FlatInfo::new(),
                registration: FlatInfo::new(),
                removal: FlatInfo::new(),
                errors: Vec::new(),
            }),
        }
    }

    pub fn ip_address(&self) -> &str {
        &self.ip_address
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn state(&self) -> NodeState {
        self.inner.lock().state
    }

    /// Millisecond stamp of the latest transition
    pub fn state_last_update(&self) -> u64 {
        self.inner.lock().state_last_update
    }

    pub fn is_archived(&self) -> bool {
        self.state() == NodeState::Archived
    }

    pub fn can_recover(&self) -> bool {
        self.state().can_recover()
    }

    /// Opaque token handed out to installers and agents
    pub fn reference(&self) -> String {
        self.inner.lock().reference.clone()
    }

    /// Issue a fresh reference, invalidating the previous one
    pub fn refresh_reference(&self) -> String {
        let mut inner = self.inner.lock();
        inner.reference = Uuid::new_v4().to_string();
        inner.reference.clone()
    }

    pub fn hostname(&self) -> Option<String> {
        self.inner.lock().hostname.clone()
    }

    pub fn set_hostname(&self, hostname: Option<String>) {
        self.inner.lock().hostname = hostname;
    }

    pub fn cluster_zone(&self) -> Option<String> {
        self.inner.lock().cluster_zone.clone()
    }

    pub fn set_cluster_zone(&self, zone: Option<String>) {
        self.inner.lock().cluster_zone = zone;
    }

    pub fn preregistration(&self) -> FlatInfo {
        self.inner.lock().preregistration.clone()
    }

    pub fn installation(&self) -> FlatInfo {
        self.inner.lock().installation.clone()
    }

    pub fn registration(&self) -> FlatInfo {
        self.inner.lock().registration.clone()
    }

    pub fn removal(&self) -> FlatInfo {
        self.inner.lock().removal.clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.inner.lock().errors.clone()
    }

    /// Record a non-fatal error against the node
    pub fn add_error(&self, error: impl Into<String>) {
        self.inner.lock().errors.push(error.into());
    }

    /// Node id given at pre-registration
    pub fn node_id(&self) -> Option<String> {
        self.inner.lock().preregistration.get("id").cloned()
    }

    pub fn node_id_or_address(&self) -> String {
        self.node_id()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| self.ip_address.clone())
    }

    pub fn node_id_and_address(&self) -> String {
        format!(
            "{} @ {}",
            self.node_id().unwrap_or_else(|| "-".into()),
            self.ip_address
        )
    }

    fn update(
        &self,
        state: NodeState,
        section: Section,
        clear: bool,
        values: FlatInfo,
    ) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock();
        if inner.state == NodeState::Archived {
            return Err(RegistryError::Archived {
                address: self.ip_address.clone(),
                requested: state,
            });
        }

        let map = inner.section(section);
        if clear {
            map.clear();
        }
        map.extend(values);

        let previous = inner.state;
        inner.state = state;
        inner.state_last_update = next_stamp(inner.state_last_update);
        drop(inner);

        tracing::debug!(
            "Node {} ({}): {} -> {}",
            self.ip_address,
            self.client_id,
            previous,
            state
        );
        Ok(())
    }

    fn update_info(
        &self,
        state: NodeState,
        section: Section,
        clear: bool,
        info: &NodeInfo,
    ) -> Result<(), RegistryError> {
        self.update(state, section, clear, flatten_info(info))
    }

    fn update_value(
        &self,
        state: NodeState,
        clear: bool,
        key: &str,
        value: Option<&str>,
        default: &str,
    ) -> Result<(), RegistryError> {
        let values = FlatInfo::from([(key.to_string(), value.unwrap_or(default).to_string())]);
        self.update(state, Section::Installation, clear, values)
    }

    /// Replace the pre-registration info and return to `PREREGISTERED`
    pub fn node_preregistration(&self, info: &NodeInfo) -> Result<(), RegistryError> {
        self.update_info(NodeState::Preregistered, Section::Preregistration, true, info)
    }

    pub fn node_ignore(&self, reason: Option<&str>) -> Result<(), RegistryError> {
        self.update_value(NodeState::IgnoreNode, true, "ignore-node", reason, "true")
    }

    pub fn node_installing(&self, task: Option<&str>) -> Result<(), RegistryError> {
        self.update_value(NodeState::Installing, true, "installation-task", task, "INSTALLING")
    }

    pub fn node_not_installed(&self, result: Option<&str>) -> Result<(), RegistryError> {
        self.update_value(
            NodeState::NotInstalled,
            true,
            "installation-task-result",
            result,
            "NOT_INSTALLED",
        )
    }

    pub fn node_installation_complete(&self, result: Option<&str>) -> Result<(), RegistryError> {
        self.update_value(
            NodeState::Installed,
            false,
            "installation-task-result",
            result,
            "SUCCESS",
        )
    }

    pub fn node_installation_error(&self, result: Option<&str>) -> Result<(), RegistryError> {
        self.update_value(
            NodeState::InstallError,
            false,
            "installation-task-result",
            result,
            "ERROR",
        )
    }

    pub fn node_waiting_registration(&self, info: &NodeInfo) -> Result<(), RegistryError> {
        self.update_info(NodeState::WaitingRegistration, Section::Registration, false, info)
    }

    /// Start a registration attempt, discarding details of earlier ones
    pub fn node_registering(&self, info: &NodeInfo) -> Result<(), RegistryError> {
        self.update_info(NodeState::Registering, Section::Registration, true, info)
    }

    pub fn node_registered(&self, info: &NodeInfo) -> Result<(), RegistryError> {
        self.update_info(NodeState::Registered, Section::Registration, false, info)
    }

    pub fn node_registration_error(&self, info: &NodeInfo) -> Result<(), RegistryError> {
        self.update_info(NodeState::RegistrationError, Section::Registration, false, info)
    }

    pub fn node_disconnected(&self, info: &NodeInfo) -> Result<(), RegistryError> {
        self.update_info(NodeState::Disconnected, Section::Registration, false, info)
    }

    pub fn node_exiting(&self, info: &NodeInfo) -> Result<(), RegistryError> {
        self.update_info(NodeState::Exiting, Section::Registration, false, info)
    }

    pub fn node_exited(&self, info: &NodeInfo) -> Result<(), RegistryError> {
        self.update_info(NodeState::Exited, Section::Registration, false, info)
    }

    pub fn node_failed(&self, info: &NodeInfo) -> Result<(), RegistryError> {
        self.update_info(NodeState::NodeFailed, Section::Registration, false, info)
    }

    pub fn node_removing(&self, info: &NodeInfo) -> Result<(), RegistryError> {
        self.update_info(NodeState::Removing, Section::Removal, false, info)
    }

    pub fn node_removed(&self, info: &NodeInfo) -> Result<(), RegistryError> {
        self.update_info(NodeState::Removed, Section::Removal, false, info)
    }

    pub fn node_remove_error(&self, info: &NodeInfo) -> Result<(), RegistryError> {
        self.update_info(NodeState::RemoveError, Section::Removal, false, info)
    }

    /// Freeze the entry; no transition is accepted afterwards
    pub fn node_archived(&self, info: &NodeInfo) -> Result<(), RegistryError> {
        self.update_info(NodeState::Archived, Section::Removal, false, info)
    }
}

impl fmt::Debug for NodeRegistryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("NodeRegistryEntry")
            .field("ip_address", &self.ip_address)
            .field("client_id", &self.client_id)
            .field("state", &inner.state)
            .field("state_last_update", &inner.state_last_update)
            .field("reference", &inner.reference)
            .field("hostname", &inner.hostname)
            .field("cluster_zone", &inner.cluster_zone)
            .field("errors", &inner.errors)
            .finish_non_exhaustive()
    }
}
