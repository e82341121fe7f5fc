//! Pluggable coordination policy
//!
//! A [`ServerCoordinator`] decides which nodes may (re)connect and what
//! configuration each agent receives once it registers. One coordinator is
//! active per topology; reconfiguring the server replaces it wholesale.
//!
//! # Lifecycle
//!
//! ```text
//! factory ──▶ is_supported(tc) ──▶ initialize(ctx) ──▶ start() ──▶ … ──▶ stop()
//! ```
//!
//! Between `start` and `stop` the registry and the sessions call the
//! admission hooks and the session hooks. Hooks run on session tasks and must
//! not block; pushing commands to a session only queues them.
//!
//! Hooks are invoked while the registry or the active session index may be
//! locked, so implementations must not call back into [`NodeRegistry`]
//! mutators from `allow_already_preregistered_node`.

pub mod clustering;
mod factory;
pub mod noop;
pub mod two_level;

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use bg_core::types::NodeInfo;
use bg_core::{ConfigError, SessionError};
use bg_protocol::BrokerConnectionConfig;

use crate::registry::{NodeRegistry, NodeRegistryEntry};
use crate::session::{ActiveSessions, ClientSession};
use crate::topology::{Topology, TranslationContext};

pub use clustering::{ClusterZone, ClusteringCoordinator};
pub use factory::{CoordinatorFactory, CoordinatorRegistry};
pub use noop::NoopCoordinator;
pub use two_level::TwoLevelCoordinator;

/// Invoked once the coordinator has applied the topology
pub type ReadyCallback = Box<dyn FnOnce() + Send>;

/// Parameters map handed to coordinator factories
pub type CoordinatorParameters = std::collections::HashMap<String, String>;

/// What a coordinator is given at initialization
pub struct CoordinatorContext {
    pub topology: Arc<Topology>,
    pub registry: Arc<NodeRegistry>,
    pub sessions: Arc<ActiveSessions>,
    pub on_ready: Option<ReadyCallback>,
}

/// Admission and configuration policy for agent sessions
pub trait ServerCoordinator: Send + Sync {
    /// Short name used in logs and configuration
    fn name(&self) -> &str;

    /// Whether this coordinator can drive the given topology
    fn is_supported(&self, _tc: &TranslationContext) -> bool {
        true
    }

    fn supports_aggregators(&self) -> bool {
        false
    }

    fn initialize(&self, ctx: CoordinatorContext) -> Result<(), ConfigError>;

    /// Topology the coordinator was initialized with
    fn topology(&self) -> Option<Arc<Topology>>;

    fn start(&self) {}

    fn stop(&self) {}

    /// May a pre-registration overwrite an existing entry for the same address?
    fn allow_already_preregistered_node(&self, _info: &NodeInfo) -> bool {
        true
    }

    /// May `session` replace a live session from the same address?
    fn allow_already_registered_node(&self, _session: &Arc<ClientSession>) -> bool {
        true
    }

    /// Consulted when a connection arrives from an address with no entry
    fn allow_not_preregistered_node(&self, _session: &Arc<ClientSession>) -> bool {
        true
    }

    /// A node was added to the registry through client registration
    fn preregister(&self, _entry: &Arc<NodeRegistryEntry>) {}

    /// An agent completed its handshake. An error terminates the session.
    fn register(&self, session: &Arc<ClientSession>) -> Result<(), SessionError>;

    /// A session is going away. Called for every session, registered or not.
    fn unregister(&self, session: &Arc<ClientSession>);

    /// The agent reported `READY`
    fn client_ready(&self, session: &Arc<ClientSession>) {
        tracing::debug!("{}--> Client ready", session.id());
    }

    /// A line no other handler claimed. Returns whether it was consumed.
    fn process_client_input(&self, session: &Arc<ClientSession>, line: &str) -> bool {
        tracing::warn!("{}--> Unhandled client input: {}", session.id(), line);
        false
    }

    /// Zones managed by this coordinator
    fn clusters(&self) -> Vec<Arc<ClusterZone>> {
        Vec::new()
    }

    fn cluster(&self, _id: &str) -> Option<Arc<ClusterZone>> {
        None
    }

    /// Broker connection an agent uses for `grouping`: its own broker
    fn grouping_broker_config(&self, grouping: &str, session: &ClientSession) -> BrokerConnectionConfig {
        BrokerConnectionConfig {
            grouping: grouping.to_string(),
            url: session.broker_url().unwrap_or_default(),
            certificate: session.certificate(),
            username: session.broker_username(),
            password: session.broker_password(),
        }
    }

    /// Broker connection to the upperware
    fn upperware_broker_config(&self) -> Option<BrokerConnectionConfig> {
        let topology = self.topology()?;
        Some(BrokerConnectionConfig {
            grouping: topology.upperware_grouping.clone(),
            url: topology.broker.url.clone(),
            certificate: topology.broker.certificate.clone(),
            username: topology.broker.username.clone(),
            password: topology.broker.password.clone(),
        })
    }

    /// Push one `SET-GROUPING-CONFIG` per agent grouping
    fn send_grouping_configurations(
        &self,
        connections: &BTreeMap<String, BrokerConnectionConfig>,
        session: &ClientSession,
    ) -> Result<(), SessionError> {
        let Some(topology) = self.topology() else {
            tracing::warn!("{}==> No topology, grouping configurations not sent", session.id());
            return Ok(());
        };
        for grouping in topology.groupings() {
            let config = topology.grouping_configuration(&grouping, connections);
            session.send_grouping_configuration(&config)?;
        }
        Ok(())
    }

    /// Upperware connection plus the session's own broker for every agent grouping
    fn broker_connections(&self, session: &ClientSession) -> BTreeMap<String, BrokerConnectionConfig> {
        let mut connections = BTreeMap::new();
        if let Some(upperware) = self.upperware_broker_config() {
            connections.insert(upperware.grouping.clone(), upperware);
        }
        if let Some(topology) = self.topology() {
            for grouping in topology.groupings() {
                let config = self.grouping_broker_config(&grouping, session);
                connections.insert(grouping, config);
            }
        }
        connections
    }
}

/// State every built-in coordinator keeps after initialization
#[derive(Default)]
pub struct CoordinatorCore {
    topology: RwLock<Option<Arc<Topology>>>,
    registry: RwLock<Option<Arc<NodeRegistry>>>,
    sessions: RwLock<Option<Arc<ActiveSessions>>>,
    on_ready: Mutex<Option<ReadyCallback>>,
}

impl CoordinatorCore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, ctx: CoordinatorContext) {
        *self.topology.write() = Some(ctx.topology);
        *self.registry.write() = Some(ctx.registry);
        *self.sessions.write() = Some(ctx.sessions);
        *self.on_ready.lock() = ctx.on_ready;
    }

    pub fn topology(&self) -> Option<Arc<Topology>> {
        self.topology.read().clone()
    }

    pub fn registry(&self) -> Option<Arc<NodeRegistry>> {
        self.registry.read().clone()
    }

    pub fn sessions(&self) -> Option<Arc<ActiveSessions>> {
        self.sessions.read().clone()
    }

    /// Run the ready callback, once
    pub fn fire_ready(&self) -> bool {
        let callback = self.on_ready.lock().take();
        match callback {
            Some(callback) => {
                callback();
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for CoordinatorCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorCore")
            .field("initialized", &self.topology.read().is_some())
            .finish_non_exhaustive()
    }
}
