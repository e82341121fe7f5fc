//! Node and client listings
//!
//! Every listing comes in two shapes: a map of [`NodeSummary`] keyed by id,
//! and sorted one-line strings for consoles and logs.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use serde::Serialize;

use bg_core::NodeState;

use crate::baguette::BaguetteServer;
use crate::registry::NodeRegistryEntry;
use crate::session::ClientSession;

/// Normalized view of a node and its session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct NodeSummary {
    /// Session id when connected, client id otherwise
    pub id: String,
    pub ip_address: String,
    pub node_hostname: Option<String>,
    pub node_port: Option<u16>,
    pub node_status: Option<String>,
    pub node_zone: Option<String>,
    pub grouping: Option<String>,
    pub reference: Option<String>,
    pub node_id: Option<String>,
    pub node_state: Option<String>,
    /// Entry errors joined with ` | `
    pub errors: Option<String>,
}

impl NodeSummary {
    fn build(
        session: Option<&ClientSession>,
        entry: Option<&NodeRegistryEntry>,
        lowest_grouping: Option<&str>,
    ) -> Option<Self> {
        let ip_address = match (entry, session) {
            (Some(entry), _) => entry.ip_address().to_string(),
            (None, Some(session)) => session.ip_address(),
            (None, None) => return None,
        };
        let id = match (session, entry) {
            (Some(session), _) => session.id().to_string(),
            (None, Some(entry)) => entry.client_id().to_string(),
            (None, None) => return None,
        };

        let hostname = entry.and_then(|e| e.hostname()).or_else(|| {
            session.and_then(|s| s.cluster_node_hostname().or_else(|| s.hostname()))
        });
        let grouping = match session {
            Some(session) => session.grouping(),
            None => entry
                .filter(|e| e.state() == NodeState::NotInstalled)
                .and(lowest_grouping.map(str::to_string)),
        };
        let errors = entry
            .map(|e| e.errors())
            .filter(|errors| !errors.is_empty())
            .map(|errors| errors.join(" | "));

        Some(Self {
            id,
            ip_address,
            node_hostname: hostname,
            node_port: session.and_then(|s| s.cluster_node_port()),
            node_status: session.and_then(|s| s.node_status()),
            node_zone: entry.and_then(|e| e.cluster_zone()),
            grouping,
            reference: entry.map(|e| e.reference()),
            node_id: session.and_then(|s| s.property("node-id")),
            node_state: entry.map(|e| e.state().to_string()),
            errors,
        })
    }

    /// `<id> <ip>[ <hostname>][:<port>] …` with absent fields skipped
    pub fn line(&self) -> String {
        let mut line = format!("{} {}", self.id, self.ip_address);
        if let Some(hostname) = &self.node_hostname {
            line.push(' ');
            line.push_str(hostname);
        }
        if let Some(port) = self.node_port {
            line.push_str(&format!(":{}", port));
        }
        for value in [
            &self.node_status,
            &self.node_zone,
            &self.grouping,
            &self.reference,
            &self.node_id,
            &self.node_state,
            &self.errors,
        ]
        .into_iter()
        .flatten()
        {
            line.push(' ');
            line.push_str(value);
        }
        line
    }
}

impl BaguetteServer {
    /// Connected sessions keyed by session id
    pub fn active_clients(&self) -> BTreeMap<String, NodeSummary> {
        let lowest = self.lowest_grouping();
        self.sessions()
            .list()
            .iter()
            .filter_map(|session| {
                let entry = session
                    .entry()
                    .or_else(|| self.registry().get_node_by_address(session.address()));
                self.resolve_hostname_later(Some(session), entry.as_ref());
                NodeSummary::build(Some(session.as_ref()), entry.as_deref(), lowest.as_deref())
            })
            .map(|summary| (summary.id.clone(), summary))
            .collect()
    }

    pub fn active_client_lines(&self) -> Vec<String> {
        lines(self.active_clients())
    }

    /// Every registry entry, keyed by client id
    pub fn all_nodes(&self) -> BTreeMap<String, NodeSummary> {
        self.nodes_in_states(&NodeState::ALL)
    }

    pub fn all_node_lines(&self) -> Vec<String> {
        lines(self.all_nodes())
    }

    /// Nodes that run without an agent
    pub fn nodes_without_client(&self) -> BTreeMap<String, NodeSummary> {
        self.nodes_in_states(&[NodeState::NotInstalled])
    }

    pub fn nodes_without_client_lines(&self) -> Vec<String> {
        lines(self.nodes_without_client())
    }

    pub fn ignored_nodes(&self) -> BTreeMap<String, NodeSummary> {
        self.nodes_in_states(&[NodeState::IgnoreNode])
    }

    pub fn ignored_node_lines(&self) -> Vec<String> {
        lines(self.ignored_nodes())
    }

    /// Nodes without an agent plus ignored nodes
    pub fn passive_nodes(&self) -> BTreeMap<String, NodeSummary> {
        self.nodes_in_states(&[NodeState::NotInstalled, NodeState::IgnoreNode])
    }

    pub fn passive_node_lines(&self) -> Vec<String> {
        lines(self.passive_nodes())
    }

    fn nodes_in_states(&self, states: &[NodeState]) -> BTreeMap<String, NodeSummary> {
        let lowest = self.lowest_grouping();
        self.registry()
            .nodes()
            .iter()
            .filter(|entry| states.contains(&entry.state()))
            .filter_map(|entry| {
                let session = self.sessions().get_by_address(entry.ip_address());
                self.resolve_hostname_later(session.as_ref(), Some(entry));
                NodeSummary::build(session.as_deref(), Some(entry.as_ref()), lowest.as_deref())
                    .map(|summary| (entry.client_id().to_string(), summary))
            })
            .collect()
    }

    fn lowest_grouping(&self) -> Option<String> {
        self.topology().and_then(|t| t.lowest_level_grouping())
    }

    /// Look the hostname up in the background if nobody knows it yet
    fn resolve_hostname_later(
        &self,
        session: Option<&Arc<ClientSession>>,
        entry: Option<&Arc<NodeRegistryEntry>>,
    ) {
        if !self.config().resolve_hostname {
            return;
        }
        let known = entry.and_then(|e| e.hostname()).is_some()
            || session.and_then(|s| s.cluster_node_hostname()).is_some();
        if known {
            return;
        }
        let address = match (entry, session) {
            (Some(entry), _) => entry.ip_address().to_string(),
            (None, Some(session)) => session.address().to_string(),
            (None, None) => return,
        };
        let Ok(ip) = address.parse::<IpAddr>() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let resolver = self.registry().resolver();
        let session = session.cloned();
        let entry = entry.cloned();
        runtime.spawn(async move {
            match resolver.reverse(ip).await {
                Ok(hostname) if !hostname.trim().is_empty() => {
                    tracing::debug!("Resolved {} to {}", ip, hostname);
                    if let Some(session) = &session {
                        session.set_hostname(Some(hostname.clone()));
                    }
                    if let Some(entry) = &entry {
                        entry.set_hostname(Some(hostname));
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Failed to resolve hostname of {}: {}", ip, e),
            }
        });
    }
}

fn lines(summaries: BTreeMap<String, NodeSummary>) -> Vec<String> {
    let mut lines: Vec<String> = summaries.values().map(NodeSummary::line).collect();
    lines.sort();
    lines
}
