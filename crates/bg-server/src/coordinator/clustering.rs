//! Three-level coordinator that groups agents into cluster zones
//!
//! Agents in the same zone form a cluster: each one runs the last-level
//! grouping, one of them is elected aggregator for the middle level, and the
//! aggregator forwards to the upperware. Zone membership is derived from the
//! node's pre-registration info.
//!
//! Parameters:
//!
//! | key | default |
//! |---|---|
//! | `cluster-detector-rules` | `zone,zone-id,region,region-id,cloud,cloud-id,provider,provider-id` |
//! | `default-clusters` | `DEFAULT_CLUSTER` |
//! | `assignment-to-default-clusters` | `RANDOM` (or `SEQUENTIAL`) |
//! | `zone-port-start` | `1200` |
//! | `zone-port-end` | `65535` |

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rand::Rng;

use bg_core::types::FlatInfo;
use bg_core::{ConfigError, NodeState, SessionError};
use bg_protocol::ClientConfiguration;

use super::noop::NoopCoordinator;
use super::{CoordinatorContext, CoordinatorParameters, ServerCoordinator};
use crate::registry::NodeRegistryEntry;
use crate::session::ClientSession;
use crate::topology::{Topology, TranslationContext};

pub const NAME: &str = "clustering";

const DEFAULT_DETECTOR_RULES: [&str; 8] = [
    "zone",
    "zone-id",
    "region",
    "region-id",
    "cloud",
    "cloud-id",
    "provider",
    "provider-id",
];
const DEFAULT_CLUSTER: &str = "DEFAULT_CLUSTER";
const DEFAULT_PORT_START: u16 = 1200;
const DEFAULT_PORT_END: u16 = 65535;

/// How zone-less nodes are spread over the default clusters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultAssignment {
    Random,
    Sequential,
}

impl FromStr for DefaultAssignment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "RANDOM" => Ok(Self::Random),
            "SEQUENTIAL" => Ok(Self::Sequential),
            other => Err(ConfigError::Invalid(format!(
                "Unsupported assignment-to-default-clusters: {}",
                other
            ))),
        }
    }
}

/// Picks a zone id from pre-registration info
#[derive(Debug)]
pub struct ZoneDetector {
    rules: Vec<String>,
    default_clusters: Vec<String>,
    assignment: DefaultAssignment,
    next_default: AtomicUsize,
}

impl ZoneDetector {
    pub fn from_parameters(params: &CoordinatorParameters) -> Result<Self, ConfigError> {
        let rules = split_list(params.get("cluster-detector-rules"));
        let default_clusters = split_list(params.get("default-clusters"));
        let assignment = match params.get("assignment-to-default-clusters") {
            Some(value) if !value.trim().is_empty() => value.parse()?,
            _ => DefaultAssignment::Random,
        };

        Ok(Self {
            rules: if rules.is_empty() {
                DEFAULT_DETECTOR_RULES.iter().map(|r| r.to_string()).collect()
            } else {
                rules
            },
            default_clusters: if default_clusters.is_empty() {
                vec![DEFAULT_CLUSTER.to_string()]
            } else {
                default_clusters
            },
            assignment,
            next_default: AtomicUsize::new(0),
        })
    }

    /// First non-blank value of a rule key, else one of the default clusters
    pub fn zone_for(&self, info: &FlatInfo) -> String {
        let detected = self
            .rules
            .iter()
            .filter_map(|key| info.get(key))
            .map(|value| value.trim())
            .find(|value| !value.is_empty());
        if let Some(zone) = detected {
            return zone.to_string();
        }

        let index = match self.assignment {
            DefaultAssignment::Random => rand::thread_rng().gen_range(0..self.default_clusters.len()),
            DefaultAssignment::Sequential => {
                self.next_default.fetch_add(1, Ordering::SeqCst) % self.default_clusters.len()
            }
        };
        self.default_clusters[index].clone()
    }
}

fn split_list(value: Option<&String>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn parse_port(params: &CoordinatorParameters, key: &str, default: u16) -> Result<u16, ConfigError> {
    match params.get(key).map(|v| v.trim()).filter(|v| !v.is_empty()) {
        None => Ok(default),
        Some(value) => match value.parse::<u16>() {
            Ok(port) if port > 0 => Ok(port),
            _ => Err(ConfigError::Invalid(format!("{} must be between 1 and 65535: {}", key, value))),
        },
    }
}

#[derive(Default)]
struct ZoneMembers {
    next_port: u32,
    nodes: BTreeMap<String, Arc<ClientSession>>,
    ports: HashMap<String, u16>,
    without_client: BTreeMap<String, Arc<NodeRegistryEntry>>,
    aggregator: Option<Arc<ClientSession>>,
}

/// A set of agents that cluster together
pub struct ClusterZone {
    id: String,
    start_port: u16,
    end_port: u16,
    members: Mutex<ZoneMembers>,
}

impl ClusterZone {
    pub fn new(id: impl Into<String>, start_port: u16, end_port: u16) -> Result<Self, ConfigError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(ConfigError::Invalid("Zone id cannot be blank".into()));
        }
        if start_port == 0 || start_port > end_port {
            return Err(ConfigError::Invalid(format!(
                "Invalid port range for zone {}: {}-{}",
                id, start_port, end_port
            )));
        }
        tracing::info!("New cluster zone: {} (ports {}-{})", id, start_port, end_port);
        Ok(Self {
            id,
            start_port,
            end_port,
            members: Mutex::new(ZoneMembers {
                next_port: start_port as u32,
                ..ZoneMembers::default()
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Port the cluster node at `address` listens on. Stable per address;
    /// `None` once the zone's range is used up.
    pub fn port_for_address(&self, address: &str) -> Option<u16> {
        let mut members = self.members.lock();
        if let Some(port) = members.ports.get(address) {
            return Some(*port);
        }
        if members.next_port > self.end_port as u32 {
            tracing::error!("Zone ports exhausted: {}", self.id);
            return None;
        }
        let port = members.next_port as u16;
        members.next_port += 1;
        members.ports.insert(address.to_string(), port);
        tracing::debug!("Mapped address to port: {} -> {}", address, port);
        Some(port)
    }

    pub fn add_node(&self, session: &Arc<ClientSession>) {
        self.members
            .lock()
            .nodes
            .insert(session.ip_address(), Arc::clone(session));
        session.set_cluster_zone(Some(self.id.clone()));
        if let Some(entry) = session.entry() {
            entry.set_cluster_zone(Some(self.id.clone()));
        }
    }

    /// Remove `session` if it is the member registered for its address
    pub fn remove_node(&self, session: &Arc<ClientSession>) -> bool {
        let address = session.ip_address();
        let removed = {
            let mut members = self.members.lock();
            let removed = match members.nodes.get(&address) {
                Some(member) if Arc::ptr_eq(member, session) => members.nodes.remove(&address).is_some(),
                _ => false,
            };
            if members
                .aggregator
                .as_ref()
                .is_some_and(|aggregator| Arc::ptr_eq(aggregator, session))
            {
                members.aggregator = None;
            }
            removed
        };

        if session.cluster_zone().as_deref() == Some(self.id.as_str()) {
            session.set_cluster_zone(None);
        }
        if let Some(entry) = session.entry() {
            if entry.cluster_zone().as_deref() == Some(self.id.as_str()) {
                entry.set_cluster_zone(None);
            }
        }
        removed
    }

    pub fn node_addresses(&self) -> Vec<String> {
        self.members.lock().nodes.keys().cloned().collect()
    }

    pub fn nodes(&self) -> Vec<Arc<ClientSession>> {
        self.members.lock().nodes.values().cloned().collect()
    }

    pub fn node_by_address(&self, address: &str) -> Option<Arc<ClientSession>> {
        self.members.lock().nodes.get(address).cloned()
    }

    /// Track a node that has no agent; zone clients collect its metrics
    pub fn add_node_without_client(&self, entry: &Arc<NodeRegistryEntry>) {
        self.members
            .lock()
            .without_client
            .insert(entry.ip_address().to_string(), Arc::clone(entry));
        entry.set_cluster_zone(Some(self.id.clone()));
        self.send_client_configuration_to_zone_clients();
    }

    pub fn remove_node_without_client(&self, entry: &Arc<NodeRegistryEntry>) {
        self.members.lock().without_client.remove(entry.ip_address());
        if entry.cluster_zone().as_deref() == Some(self.id.as_str()) {
            entry.set_cluster_zone(None);
        }
        self.send_client_configuration_to_zone_clients();
    }

    pub fn nodes_without_client(&self) -> Vec<Arc<NodeRegistryEntry>> {
        self.members.lock().without_client.values().cloned().collect()
    }

    pub fn client_configuration(&self) -> ClientConfiguration {
        ClientConfiguration {
            nodes_without_client: self.members.lock().without_client.keys().cloned().collect(),
            ..ClientConfiguration::default()
        }
    }

    /// Push the zone's client configuration to every member
    pub fn send_client_configuration_to_zone_clients(&self) -> ClientConfiguration {
        let config = self.client_configuration();
        for session in self.nodes() {
            if let Err(e) = session.send_client_configuration(&config) {
                tracing::warn!("{}==> Client configuration not sent: {}", session.id(), e);
            }
        }
        config
    }

    pub fn aggregator(&self) -> Option<Arc<ClientSession>> {
        self.members.lock().aggregator.clone()
    }

    pub fn set_aggregator(&self, session: Option<Arc<ClientSession>>) {
        self.members.lock().aggregator = session;
    }

    pub fn start_port(&self) -> u16 {
        self.start_port
    }

    pub fn end_port(&self) -> u16 {
        self.end_port
    }
}

impl std::fmt::Debug for ClusterZone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterZone")
            .field("id", &self.id)
            .field("nodes", &self.node_addresses())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
struct Levels {
    top: String,
    aggregator: String,
    last: String,
}

/// Coordinator for `GLOBAL` + aggregator + per-node topologies
pub struct ClusteringCoordinator {
    base: NoopCoordinator,
    detector: ZoneDetector,
    port_start: u16,
    port_end: u16,
    levels: RwLock<Option<Levels>>,
    zones: Mutex<BTreeMap<String, Arc<ClusterZone>>>,
    ignored: Mutex<BTreeMap<String, Arc<NodeRegistryEntry>>>,
}

impl ClusteringCoordinator {
    pub fn new() -> Self {
        Self {
            base: NoopCoordinator::named(NAME),
            detector: ZoneDetector {
                rules: DEFAULT_DETECTOR_RULES.iter().map(|r| r.to_string()).collect(),
                default_clusters: vec![DEFAULT_CLUSTER.to_string()],
                assignment: DefaultAssignment::Random,
                next_default: AtomicUsize::new(0),
            },
            port_start: DEFAULT_PORT_START,
            port_end: DEFAULT_PORT_END,
            levels: RwLock::new(None),
            zones: Mutex::new(BTreeMap::new()),
            ignored: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn from_parameters(params: &CoordinatorParameters) -> Result<Self, ConfigError> {
        let port_start = parse_port(params, "zone-port-start", DEFAULT_PORT_START)?;
        let port_end = parse_port(params, "zone-port-end", DEFAULT_PORT_END)?;
        if port_start > port_end {
            return Err(ConfigError::Invalid(format!(
                "zone-port-start {} is greater than zone-port-end {}",
                port_start, port_end
            )));
        }
        let detector = ZoneDetector::from_parameters(params)?;
        tracing::debug!("{}: zone detector: {:?}", NAME, detector);

        Ok(Self {
            detector,
            port_start,
            port_end,
            ..Self::new()
        })
    }

    /// Nodes pre-registered with `IGNORE_NODE`
    pub fn ignored_nodes(&self) -> Vec<Arc<NodeRegistryEntry>> {
        self.ignored.lock().values().cloned().collect()
    }

    fn zone(&self, id: &str) -> Result<Arc<ClusterZone>, ConfigError> {
        let mut zones = self.zones.lock();
        if let Some(zone) = zones.get(id) {
            return Ok(Arc::clone(zone));
        }
        let zone = Arc::new(ClusterZone::new(id, self.port_start, self.port_end)?);
        zones.insert(id.to_string(), Arc::clone(&zone));
        Ok(zone)
    }

    /// Zone already assigned to the session or its entry, else detected
    fn zone_id_for_session(&self, session: &ClientSession) -> Option<String> {
        let assigned = session
            .cluster_zone()
            .or_else(|| session.entry().and_then(|e| e.cluster_zone()))
            .filter(|z| !z.trim().is_empty());
        assigned.or_else(|| {
            session
                .entry()
                .map(|entry| self.detector.zone_for(&entry.preregistration()))
        })
    }

    fn instruct_cluster_join(
        &self,
        session: &Arc<ClientSession>,
        zone: &ClusterZone,
        levels: &Levels,
        start_election: bool,
    ) -> Result<(), SessionError> {
        let others: Vec<String> = zone
            .nodes()
            .iter()
            .filter(|member| !Arc::ptr_eq(member, session))
            .map(|member| member.cluster_endpoint())
            .collect();
        let command = format!(
            "CLUSTER-JOIN {}  {}:{}:{}  start-election={}  {}  {}",
            zone.id(),
            levels.top,
            levels.aggregator,
            levels.last,
            start_election,
            session.cluster_endpoint(),
            others.join(" ")
        );
        tracing::debug!("{}: client {} joins cluster: {}", NAME, session.id(), command);
        session.send_to_client(&command)
    }
}

impl Default for ClusteringCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ClusteringCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusteringCoordinator")
            .field("levels", &*self.levels.read())
            .field("zones", &self.zones.lock().keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl ServerCoordinator for ClusteringCoordinator {
    fn name(&self) -> &str {
        NAME
    }

    /// Needs exactly three rule groupings, one of them `GLOBAL`
    fn is_supported(&self, tc: &TranslationContext) -> bool {
        tc.g2r.contains_key("GLOBAL") && tc.g2r.len() == 3
    }

    fn supports_aggregators(&self) -> bool {
        true
    }

    fn initialize(&self, ctx: CoordinatorContext) -> Result<(), ConfigError> {
        if !self.is_supported(&ctx.topology.context) {
            return Err(ConfigError::Invalid(
                "Translation context is not supported by the clustering coordinator".into(),
            ));
        }
        let levels = match ctx.topology.context.rule_groupings().as_slice() {
            [top, aggregator, last] => Levels {
                top: top.clone(),
                aggregator: aggregator.clone(),
                last: last.clone(),
            },
            other => return Err(ConfigError::Invalid(format!("Expected three groupings, found {:?}", other))),
        };
        tracing::info!(
            "{}: groupings: top-level={}, aggregator={}, last-level={}",
            NAME,
            levels.top,
            levels.aggregator,
            levels.last
        );
        *self.levels.write() = Some(levels);
        self.zones.lock().clear();
        self.ignored.lock().clear();

        self.base.initialize(ctx)
    }

    fn topology(&self) -> Option<Arc<Topology>> {
        self.base.topology()
    }

    fn start(&self) {
        self.base.start();
    }

    fn stop(&self) {
        self.base.stop();
    }

    fn preregister(&self, entry: &Arc<NodeRegistryEntry>) {
        if !self.base.log_invocation("preregister", &entry.node_id_and_address(), true) {
            return;
        }

        match entry.state() {
            NodeState::IgnoreNode => {
                tracing::info!("{}: ignoring node {}", NAME, entry.node_id_and_address());
                self.ignored
                    .lock()
                    .insert(entry.ip_address().to_string(), Arc::clone(entry));
            }
            NodeState::NotInstalled => {
                let zone_id = self.detector.zone_for(&entry.preregistration());
                tracing::debug!(
                    "{}: node without client {} assigned to zone {}",
                    NAME,
                    entry.node_id_and_address(),
                    zone_id
                );
                match self.zone(&zone_id) {
                    Ok(zone) => zone.add_node_without_client(entry),
                    Err(e) => tracing::error!("{}: {}", NAME, e),
                }
            }
            NodeState::Installed => {
                tracing::debug!("{}: node with client: {}", NAME, entry.node_id_and_address());
            }
            state => {
                tracing::warn!(
                    "{}: no pre-registration for node {} in state {}",
                    NAME,
                    entry.node_id_and_address(),
                    state
                );
            }
        }
    }

    fn register(&self, session: &Arc<ClientSession>) -> Result<(), SessionError> {
        if !self.base.log_invocation("register", &session.id().to_string(), true) {
            return Ok(());
        }
        let Some(levels) = self.levels.read().clone() else {
            return Err(SessionError::Rejected(format!("{} coordinator is not initialized", NAME)));
        };
        let Some(zone_id) = self.zone_id_for_session(session) else {
            return Err(SessionError::Rejected(format!("No zone for client {}", session.id())));
        };
        let zone = self
            .zone(&zone_id)
            .map_err(|e| SessionError::Rejected(e.to_string()))?;

        let address = session.ip_address();
        let port = zone
            .port_for_address(&address)
            .ok_or_else(|| SessionError::Rejected(format!("Zone ports exhausted: {}", zone.id())))?;
        zone.add_node(session);
        let hostname = session.hostname().unwrap_or_else(|| address.clone());
        session.set_cluster_node(address, hostname, port);
        tracing::debug!(
            "{}: client {} in zone {}: cluster node {}",
            NAME,
            session.id(),
            zone.id(),
            session.cluster_endpoint()
        );

        zone.send_client_configuration_to_zone_clients();

        let connections = self.broker_connections(session);
        tracing::info!(
            "{}: sending grouping configurations to client {}: {:?}",
            NAME,
            session.id(),
            connections.keys().collect::<Vec<_>>()
        );
        self.send_grouping_configurations(&connections, session)?;

        tracing::info!("{}: setting active grouping of client {}: {}", NAME, session.id(), levels.last);
        session.set_active_grouping(&levels.last)?;

        self.instruct_cluster_join(session, &zone, &levels, true)?;
        tracing::info!(
            "{}: client added in topology: client={}, address={}, zone={}",
            NAME,
            session.id(),
            session.ip_address(),
            zone.id()
        );
        Ok(())
    }

    fn unregister(&self, session: &Arc<ClientSession>) {
        if !self.base.log_invocation("unregister", &session.id().to_string(), true) {
            return;
        }
        let zone = session
            .cluster_zone()
            .and_then(|id| self.zones.lock().get(&id).cloned());
        let Some(zone) = zone else {
            tracing::warn!(
                "{}: non-registered client removed: client={}, address={}",
                NAME,
                session.id(),
                session.ip_address()
            );
            return;
        };

        zone.remove_node(session);
        if let Err(e) = session.send_to_client("CLUSTER-LEAVE") {
            tracing::debug!("{}==> CLUSTER-LEAVE not sent: {}", session.id(), e);
        }
        tracing::info!(
            "{}: client removed from topology: client={}, address={}",
            NAME,
            session.id(),
            session.ip_address()
        );
        if zone.aggregator().is_none() {
            tracing::warn!("{}: zone without aggregator: {}", NAME, zone.id());
        }
    }

    fn client_ready(&self, session: &Arc<ClientSession>) {
        self.base.client_ready(session);
    }

    /// Handles `CLUSTER AGGREGATOR <id>` and swallows other `CLUSTER` lines
    fn process_client_input(&self, session: &Arc<ClientSession>, line: &str) -> bool {
        let args: Vec<&str> = line.split_whitespace().collect();
        match args.as_slice() {
            [cluster, rest @ ..] if cluster.eq_ignore_ascii_case("CLUSTER") => {
                if rest.first().is_some_and(|a| a.eq_ignore_ascii_case("AGGREGATOR")) {
                    let zone = session
                        .cluster_zone()
                        .and_then(|id| self.zones.lock().get(&id).cloned());
                    match zone {
                        Some(zone) => {
                            zone.set_aggregator(Some(Arc::clone(session)));
                            tracing::info!(
                                "{}: new aggregator of zone {}: {} @ {} ({})",
                                NAME,
                                zone.id(),
                                session.id(),
                                session.ip_address(),
                                rest.get(1).copied().unwrap_or_default()
                            );
                        }
                        None => tracing::warn!("{}--> Aggregator report from client without zone", session.id()),
                    }
                }
                true
            }
            _ => false,
        }
    }

    fn clusters(&self) -> Vec<Arc<ClusterZone>> {
        self.zones.lock().values().cloned().collect()
    }

    fn cluster(&self, id: &str) -> Option<Arc<ClusterZone>> {
        self.zones.lock().get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::registry::NodeRegistry;
    use crate::resolver::SystemResolver;
    use crate::session::{ActiveSessions, ExitHook, SessionContext, SessionSettings};
    use crate::topology::BrokerEndpoint;
    use crate::truststore::MemoryTrustStore;
    use bg_core::types::NodeInfo;
    use serde_json::json;
    use std::collections::BTreeSet;

    fn three_levels() -> TranslationContext {
        let mut tc = TranslationContext::default();
        for g in ["GLOBAL", "PER_ZONE", "PER_INSTANCE"] {
            tc.g2r.insert(
                g.to_string(),
                BTreeMap::from([("t".to_string(), BTreeSet::from(["r".to_string()]))]),
            );
        }
        tc
    }

    fn info(value: serde_json::Value) -> NodeInfo {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_is_supported_needs_three_levels() {
        let coordinator = ClusteringCoordinator::new();
        assert!(coordinator.is_supported(&three_levels()));

        let mut two = three_levels();
        two.g2r.remove("PER_ZONE");
        assert!(!coordinator.is_supported(&two));

        let mut no_global = three_levels();
        no_global.g2r.remove("GLOBAL");
        no_global.g2r.insert("PER_HOST".into(), BTreeMap::new());
        assert!(!coordinator.is_supported(&no_global));
    }

    #[test]
    fn test_zone_ports_are_stable_per_address() {
        let zone = ClusterZone::new("z", 1200, 1201).unwrap();
        assert_eq!(zone.port_for_address("10.0.0.1"), Some(1200));
        assert_eq!(zone.port_for_address("10.0.0.2"), Some(1201));
        assert_eq!(zone.port_for_address("10.0.0.1"), Some(1200));
        assert_eq!(zone.port_for_address("10.0.0.3"), None);
    }

    #[test]
    fn test_zone_rejects_bad_arguments() {
        assert!(ClusterZone::new(" ", 1200, 1300).is_err());
        assert!(ClusterZone::new("z", 1300, 1200).is_err());
        assert!(ClusterZone::new("z", 0, 1200).is_err());
    }

    #[test]
    fn test_detector_uses_rules_then_defaults() {
        let params = CoordinatorParameters::from([
            ("cluster-detector-rules".to_string(), "rack, zone".to_string()),
            ("default-clusters".to_string(), "A,B".to_string()),
            ("assignment-to-default-clusters".to_string(), "sequential".to_string()),
        ]);
        let detector = ZoneDetector::from_parameters(&params).unwrap();

        let prereg = FlatInfo::from([
            ("zone".to_string(), "eu-1".to_string()),
            ("rack".to_string(), " ".to_string()),
        ]);
        assert_eq!(detector.zone_for(&prereg), "eu-1");

        let empty = FlatInfo::new();
        assert_eq!(detector.zone_for(&empty), "A");
        assert_eq!(detector.zone_for(&empty), "B");
        assert_eq!(detector.zone_for(&empty), "A");
    }

    #[test]
    fn test_from_parameters_validates_ports() {
        let bad = CoordinatorParameters::from([("zone-port-start".to_string(), "abc".to_string())]);
        assert!(ClusteringCoordinator::from_parameters(&bad).is_err());

        let inverted = CoordinatorParameters::from([
            ("zone-port-start".to_string(), "2000".to_string()),
            ("zone-port-end".to_string(), "1000".to_string()),
        ]);
        assert!(ClusteringCoordinator::from_parameters(&inverted).is_err());

        let unknown = CoordinatorParameters::from([(
            "assignment-to-default-clusters".to_string(),
            "ROUND_ROBIN".to_string(),
        )]);
        assert!(ClusteringCoordinator::from_parameters(&unknown).is_err());
    }

    #[tokio::test]
    async fn test_register_joins_zone() {
        let registry = Arc::new(NodeRegistry::new(Arc::new(SystemResolver)));
        let sessions = Arc::new(ActiveSessions::new());
        let coordinator = Arc::new(ClusteringCoordinator::new());
        coordinator
            .initialize(CoordinatorContext {
                topology: Arc::new(Topology::new(
                    three_levels(),
                    BTreeMap::new(),
                    "GLOBAL",
                    BrokerEndpoint::default(),
                )),
                registry: Arc::clone(&registry),
                sessions: Arc::clone(&sessions),
                on_ready: None,
            })
            .unwrap();
        coordinator.start();

        registry
            .add_node(info(json!({"ip-address": "127.0.0.1", "zone": "eu-1"})), "c1")
            .await
            .unwrap();

        let ctx = SessionContext {
            coordinator: coordinator.clone(),
            registry,
            sessions,
            events: EventBus::default(),
            trust_store: Arc::new(MemoryTrustStore::new()),
            settings: SessionSettings::default(),
        };
        let (session, mut rx) = ClientSession::new(ctx, "127.0.0.1:40000".parse().unwrap(), ExitHook::noop());

        coordinator.register(&session).unwrap();

        let mut lines = Vec::new();
        while let Ok(line) = rx.try_recv() {
            lines.push(line);
        }
        assert!(lines.iter().any(|l| l.starts_with("SET-CLIENT-CONFIG ")));
        assert_eq!(lines.iter().filter(|l| l.starts_with("SET-GROUPING-CONFIG ")).count(), 2);
        assert!(lines.contains(&"SET-ACTIVE-GROUPING PER_INSTANCE".to_string()));
        assert_eq!(
            lines.last().map(String::as_str),
            Some("CLUSTER-JOIN eu-1  GLOBAL:PER_ZONE:PER_INSTANCE  start-election=true  127.0.0.1:1200")
        );

        let zone = coordinator.cluster("eu-1").unwrap();
        assert_eq!(zone.node_addresses(), vec!["127.0.0.1".to_string()]);
        assert_eq!(session.cluster_zone().as_deref(), Some("eu-1"));

        assert!(coordinator.process_client_input(&session, "CLUSTER AGGREGATOR node-1"));
        assert!(zone.aggregator().is_some());
        assert!(coordinator.process_client_input(&session, "cluster status"));
        assert!(!coordinator.process_client_input(&session, "SOMETHING ELSE"));

        coordinator.unregister(&session);
        assert!(zone.node_addresses().is_empty());
        assert!(zone.aggregator().is_none());
        assert!(session.cluster_zone().is_none());
    }

    #[tokio::test]
    async fn test_preregister_tracks_nodes_without_client() {
        let registry = Arc::new(NodeRegistry::new(Arc::new(SystemResolver)));
        let coordinator = ClusteringCoordinator::new();
        coordinator
            .initialize(CoordinatorContext {
                topology: Arc::new(Topology::new(
                    three_levels(),
                    BTreeMap::new(),
                    "GLOBAL",
                    BrokerEndpoint::default(),
                )),
                registry: Arc::clone(&registry),
                sessions: Arc::new(ActiveSessions::new()),
                on_ready: None,
            })
            .unwrap();
        coordinator.start();

        let edge = registry
            .add_node(info(json!({"ip-address": "10.1.1.1", "zone": "edge"})), "e1")
            .await
            .unwrap();
        edge.node_not_installed(None).unwrap();
        coordinator.preregister(&edge);

        let ignored = registry
            .add_node(info(json!({"ip-address": "10.1.1.2"})), "e2")
            .await
            .unwrap();
        ignored.node_ignore(None).unwrap();
        coordinator.preregister(&ignored);

        let zone = coordinator.cluster("edge").unwrap();
        assert_eq!(
            zone.client_configuration().nodes_without_client,
            BTreeSet::from(["10.1.1.1".to_string()])
        );
        assert_eq!(edge.cluster_zone().as_deref(), Some("edge"));
        assert_eq!(coordinator.ignored_nodes().len(), 1);
    }
}
