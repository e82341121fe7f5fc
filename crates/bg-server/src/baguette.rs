//! Server facade
//!
//! [`BaguetteServer`] owns the node registry, the active session index, the
//! credential store and the running transport. Topology reconfiguration,
//! start/stop and client dispatch all go through it.
//!
//! Start, stop and reconfiguration are serialized by one async control lock,
//! so a reconfiguration never interleaves with a restart.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use bg_core::config::ServerConfig;
use bg_core::types::{info_str, NodeInfo};
use bg_core::{BaguetteError, SessionError};

use crate::auth::Credentials;
use crate::coordinator::{CoordinatorContext, CoordinatorRegistry, ServerCoordinator};
use crate::events::{EventBus, ServerEvent};
use crate::registry::{NodeRegistry, NodeRegistryEntry};
use crate::resolver::{AddressResolver, SystemResolver};
use crate::server::Sshd;
use crate::session::{ActiveSessions, ClientSession, SessionContext, SessionSettings};
use crate::topology::{BrokerEndpoint, Topology, TranslationContext};
use crate::truststore::{MemoryTrustStore, TrustStore};

/// Node info key holding an explicit client id
const CLIENT_ID_KEY: &str = "CLIENT_ID";

#[derive(Default)]
struct Control {
    sshd: Option<Sshd>,
    give_up: Option<JoinHandle<()>>,
}

#[derive(Debug, Clone)]
struct Transport {
    local_addr: SocketAddr,
    fingerprint: String,
}

/// Builder for [`BaguetteServer`]
pub struct BaguetteServerBuilder {
    config: ServerConfig,
    resolver: Arc<dyn AddressResolver>,
    trust_store: Arc<dyn TrustStore>,
    coordinators: CoordinatorRegistry,
}

impl BaguetteServerBuilder {
    pub fn resolver(mut self, resolver: Arc<dyn AddressResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn trust_store(mut self, trust_store: Arc<dyn TrustStore>) -> Self {
        self.trust_store = trust_store;
        self
    }

    /// Replace the coordinator kinds available for selection
    pub fn coordinators(mut self, coordinators: CoordinatorRegistry) -> Self {
        self.coordinators = coordinators;
        self
    }

    pub fn build(self) -> Result<BaguetteServer, BaguetteError> {
        self.config.validate()?;

        let credentials = Arc::new(Credentials::from_map(self.config.credentials.clone()));
        credentials.bootstrap();

        Ok(BaguetteServer {
            registry: Arc::new(NodeRegistry::new(self.resolver)),
            sessions: Arc::new(ActiveSessions::new()),
            events: EventBus::default(),
            trust_store: self.trust_store,
            credentials,
            coordinators: self.coordinators,
            control: tokio::sync::Mutex::new(Control::default()),
            coordinator: RwLock::new(None),
            topology: RwLock::new(None),
            transport: RwLock::new(None),
            config: self.config,
        })
    }
}

/// Entry point for everything the server does
pub struct BaguetteServer {
    config: ServerConfig,
    registry: Arc<NodeRegistry>,
    sessions: Arc<ActiveSessions>,
    events: EventBus,
    trust_store: Arc<dyn TrustStore>,
    credentials: Arc<Credentials>,
    coordinators: CoordinatorRegistry,
    control: tokio::sync::Mutex<Control>,
    coordinator: RwLock<Option<Arc<dyn ServerCoordinator>>>,
    topology: RwLock<Option<Arc<Topology>>>,
    transport: RwLock<Option<Transport>>,
}

impl BaguetteServer {
    pub fn builder(config: ServerConfig) -> BaguetteServerBuilder {
        BaguetteServerBuilder {
            config,
            resolver: Arc::new(SystemResolver),
            trust_store: Arc::new(MemoryTrustStore::new()),
            coordinators: CoordinatorRegistry::with_builtins(),
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle

    /// Apply a new topology
    ///
    /// Stops the running transport (closing every session), clears the node
    /// registry, selects and initializes a coordinator for `tc`, then starts
    /// a new transport with it. On error the server is left stopped with no
    /// coordinator and no topology, so `restart_server` refuses to run.
    pub async fn set_topology_configuration(
        &self,
        tc: TranslationContext,
        constants: BTreeMap<String, f64>,
        upperware_grouping: &str,
        broker: BrokerEndpoint,
    ) -> Result<(), BaguetteError> {
        let mut control = self.control.lock().await;
        tracing::info!("Applying topology configuration: upperware grouping={}", upperware_grouping);

        self.stop_locked(&mut control).await;
        *self.coordinator.write() = None;
        *self.topology.write() = None;
        self.registry.clear_nodes();

        let topology = Arc::new(Topology::new(tc, constants, upperware_grouping, broker));
        let coordinator = self.prepare_coordinator(Arc::clone(&topology))?;
        *self.topology.write() = Some(topology);

        let result = self.start_locked(&mut control, coordinator).await;
        if result.is_err() {
            *self.topology.write() = None;
        }
        result
    }

    fn prepare_coordinator(&self, topology: Arc<Topology>) -> Result<Arc<dyn ServerCoordinator>, BaguetteError> {
        let coordinator = self.coordinators.select(&self.config, &topology.context)?;
        let events = self.events.clone();
        let name = coordinator.name().to_string();
        coordinator.initialize(CoordinatorContext {
            topology,
            registry: Arc::clone(&self.registry),
            sessions: Arc::clone(&self.sessions),
            on_ready: Some(Box::new(move || {
                tracing::info!("Coordinator {} is ready", name);
                events.publish(ServerEvent::TopologyReady { coordinator: name });
            })),
        })?;
        Ok(coordinator)
    }

    /// Start the transport with an initialized coordinator
    pub async fn start_server(&self, coordinator: Arc<dyn ServerCoordinator>) -> Result<(), BaguetteError> {
        let mut control = self.control.lock().await;
        if control.sshd.is_some() {
            tracing::warn!("Server is already running");
            return Ok(());
        }
        self.start_locked(&mut control, coordinator).await
    }

    pub async fn stop_server(&self) {
        let mut control = self.control.lock().await;
        self.stop_locked(&mut control).await;
    }

    /// Stop and start again with the current coordinator
    pub async fn restart_server(&self) -> Result<(), BaguetteError> {
        let mut control = self.control.lock().await;
        let coordinator = self
            .coordinator
            .read()
            .clone()
            .ok_or_else(|| BaguetteError::Transport("No coordinator to restart with".into()))?;
        self.stop_locked(&mut control).await;
        self.start_locked(&mut control, coordinator).await
    }

    pub fn is_server_running(&self) -> bool {
        self.transport.read().is_some()
    }

    async fn start_locked(
        &self,
        control: &mut Control,
        coordinator: Arc<dyn ServerCoordinator>,
    ) -> Result<(), BaguetteError> {
        self.registry.set_coordinator(Some(Arc::clone(&coordinator)));
        *self.coordinator.write() = Some(Arc::clone(&coordinator));

        let ctx = SessionContext {
            coordinator,
            registry: Arc::clone(&self.registry),
            sessions: Arc::clone(&self.sessions),
            events: self.events.clone(),
            trust_store: Arc::clone(&self.trust_store),
            settings: SessionSettings {
                address_override_allowed: self.config.client_address_override_allowed,
                echo: self.config.echo,
                read_timeout: self.config.read_timeout,
            },
        };

        let give_up = tokio::spawn(mark_failed_nodes(self.events.clone(), Arc::clone(&self.registry)));
        let sshd = match Sshd::start(&self.config, ctx, Arc::clone(&self.credentials)).await {
            Ok(sshd) => sshd,
            Err(e) => {
                give_up.abort();
                self.registry.set_coordinator(None);
                *self.coordinator.write() = None;
                tracing::error!("Failed to start server: {:#}", e);
                return Err(BaguetteError::Transport(format!("{:#}", e)));
            }
        };

        *self.transport.write() = Some(Transport {
            local_addr: sshd.local_addr(),
            fingerprint: sshd.fingerprint().to_string(),
        });
        control.sshd = Some(sshd);
        control.give_up = Some(give_up);
        tracing::info!("Server started");
        Ok(())
    }

    async fn stop_locked(&self, control: &mut Control) {
        let Some(sshd) = control.sshd.take() else {
            tracing::debug!("Server is not running");
            return;
        };
        sshd.stop().await;
        if let Some(task) = control.give_up.take() {
            task.abort();
        }
        *self.transport.write() = None;
        self.registry.set_coordinator(None);
        tracing::info!("Server stopped");
    }

    // ------------------------------------------------------------------
    // Node registration

    /// Pre-register a node and hand it to the coordinator
    ///
    /// The client id is `CLIENT_ID` from `info` when present, otherwise it is
    /// built from `client_id_format`.
    pub async fn register_client(&self, mut info: NodeInfo) -> Result<Arc<NodeRegistryEntry>, BaguetteError> {
        let client_id = match info_str(&info, CLIENT_ID_KEY).filter(|id| !id.trim().is_empty()) {
            Some(id) => id,
            None => self.generate_client_id(&info),
        };
        let random = uuid::Uuid::new_v4().to_string();
        tracing::debug!("Registering client: client-id={}, random={}", client_id, random);
        info.insert("random".into(), Value::String(random));

        let entry = self.registry.add_node(info, &client_id).await?;
        if let Some(coordinator) = self.coordinator() {
            coordinator.preregister(&entry);
        }
        Ok(entry)
    }

    /// Client id from the configured format, or a random UUID without one
    pub fn generate_client_id(&self, info: &NodeInfo) -> String {
        match self.config.client_id_format.as_deref().filter(|f| !f.trim().is_empty()) {
            Some(format) => format_client_id(format, &self.config.client_id_format_escape, info),
            None => uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Archive a node's entry
    pub fn unregister_client(&self, entry: &Arc<NodeRegistryEntry>) -> Result<(), BaguetteError> {
        tracing::debug!("Unregistering client: {}", entry.node_id_and_address());
        self.registry.archive_node(entry, &NodeInfo::new())?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Dispatch

    /// Send a line to one session, by display id or client id
    pub fn send_to_client(&self, id: &str, command: &str) -> Result<(), SessionError> {
        self.find_session(id)?.send_to_client(command)
    }

    /// Send a line to every active session. Returns how many got it.
    pub fn send_to_active_clients(&self, command: &str) -> usize {
        send_to_all(&self.sessions.list(), command)
    }

    /// Send a line to every member of one cluster
    pub fn send_to_cluster(&self, cluster_id: &str, command: &str) -> Result<usize, SessionError> {
        let zone = self
            .coordinator()
            .and_then(|c| c.cluster(cluster_id))
            .ok_or_else(|| SessionError::NotFound(format!("cluster {}", cluster_id)))?;
        Ok(send_to_all(&zone.nodes(), command))
    }

    /// Send a line to every member of every cluster
    pub fn send_to_active_clusters(&self, command: &str) -> usize {
        let Some(coordinator) = self.coordinator() else {
            return 0;
        };
        coordinator
            .clusters()
            .iter()
            .map(|zone| send_to_all(&zone.nodes(), command))
            .sum()
    }

    /// Push constants to every active session
    pub fn send_constants(&self, constants: &BTreeMap<String, f64>) -> usize {
        let mut sent = 0;
        for session in self.sessions.list() {
            match session.send_constants(constants) {
                Ok(()) => sent += 1,
                Err(e) => tracing::warn!("{}==> Constants not sent: {}", session.id(), e),
            }
        }
        sent
    }

    /// Send `command` to a session and wait for its correlated reply
    pub async fn read_from_client(&self, id: &str, command: &str) -> Result<Value, SessionError> {
        self.find_session(id)?.read_from_client(command).await
    }

    fn find_session(&self, id: &str) -> Result<Arc<ClientSession>, SessionError> {
        self.sessions
            .find(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    // ------------------------------------------------------------------
    // Accessors

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn sessions(&self) -> &Arc<ActiveSessions> {
        &self.sessions
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn credentials(&self) -> &Arc<Credentials> {
        &self.credentials
    }

    pub fn trust_store(&self) -> &Arc<dyn TrustStore> {
        &self.trust_store
    }

    pub fn coordinator(&self) -> Option<Arc<dyn ServerCoordinator>> {
        self.coordinator.read().clone()
    }

    pub fn topology(&self) -> Option<Arc<Topology>> {
        self.topology.read().clone()
    }

    /// Address the transport is bound to, while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.read().as_ref().map(|t| t.local_addr)
    }

    pub fn host_key_fingerprint(&self) -> Option<String> {
        self.transport.read().as_ref().map(|t| t.fingerprint.clone())
    }
}

fn send_to_all(sessions: &[Arc<ClientSession>], command: &str) -> usize {
    let mut sent = 0;
    for session in sessions {
        match session.send_to_client(command) {
            Ok(()) => sent += 1,
            Err(e) => tracing::warn!("{}==> Not sent: {}", session.id(), e),
        }
    }
    sent
}

/// Mark nodes agents gave up recovering as failed
async fn mark_failed_nodes(events: EventBus, registry: Arc<NodeRegistry>) {
    let mut rx = events.subscribe();
    loop {
        match rx.recv().await {
            Ok(ServerEvent::SelfHealingGiveUp { address, sender }) => {
                let address = address.trim();
                if address.is_empty() {
                    continue;
                }
                match registry.get_node_by_address(address) {
                    Some(entry) => {
                        let mut info = NodeInfo::new();
                        info.insert("sender".into(), Value::String(sender));
                        match entry.node_failed(&info) {
                            Ok(()) => tracing::info!("Marked node as failed: {}", address),
                            Err(e) => tracing::warn!("Could not mark node {} as failed: {}", address, e),
                        }
                    }
                    None => tracing::warn!("Node with address not found: {}", address),
                }
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!("Missed {} server events", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Substitute `<escape>{key}` placeholders with node info values
///
/// Placeholders naming a key that is not in `info` are left as written.
pub fn format_client_id(format: &str, escape: &str, info: &NodeInfo) -> String {
    let opener = format!("{}{{", escape);
    let mut out = String::with_capacity(format.len());
    let mut rest = format;

    while let Some(start) = rest.find(&opener) {
        out.push_str(&rest[..start]);
        let after = &rest[start + opener.len()..];
        match after.find('}') {
            Some(end) => {
                let key = &after[..end];
                match info_str(info, key) {
                    Some(value) => out.push_str(&value),
                    None => out.push_str(&rest[start..start + opener.len() + end + 1]),
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
