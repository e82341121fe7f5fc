//! Coordinator for a global level plus one per-node level

use std::sync::Arc;

use parking_lot::RwLock;

use bg_core::{ConfigError, SessionError};

use super::noop::NoopCoordinator;
use super::{CoordinatorContext, ServerCoordinator};
use crate::registry::NodeRegistryEntry;
use crate::session::ClientSession;
use crate::topology::{Topology, TranslationContext};

pub const NAME: &str = "two-level";

/// Every agent runs the node-level grouping and forwards to the upperware
#[derive(Debug)]
pub struct TwoLevelCoordinator {
    base: NoopCoordinator,
    /// (global grouping, node grouping)
    levels: RwLock<Option<(String, String)>>,
}

impl TwoLevelCoordinator {
    pub fn new() -> Self {
        Self {
            base: NoopCoordinator::named(NAME),
            levels: RwLock::new(None),
        }
    }

    /// Grouping agents are told to activate
    pub fn node_grouping(&self) -> Option<String> {
        self.levels.read().as_ref().map(|(_, node)| node.clone())
    }

    pub fn global_grouping(&self) -> Option<String> {
        self.levels.read().as_ref().map(|(global, _)| global.clone())
    }
}

impl Default for TwoLevelCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerCoordinator for TwoLevelCoordinator {
    fn name(&self) -> &str {
        NAME
    }

    /// Needs `GLOBAL` and at least one more grouping with rules
    fn is_supported(&self, tc: &TranslationContext) -> bool {
        tc.g2r.contains_key("GLOBAL") && tc.g2r.len() > 1
    }

    fn initialize(&self, ctx: CoordinatorContext) -> Result<(), ConfigError> {
        if !self.is_supported(&ctx.topology.context) {
            return Err(ConfigError::Invalid(
                "Translation context is not supported by the two-level coordinator".into(),
            ));
        }

        let groupings = ctx.topology.context.rule_groupings();
        let (global, node) = match groupings.as_slice() {
            [global, node, ..] => (global.clone(), node.clone()),
            _ => return Err(ConfigError::Invalid(format!("Expected two groupings, found {:?}", groupings))),
        };
        tracing::info!("{}: groupings: top-level={}, node-level={}", NAME, global, node);
        *self.levels.write() = Some((global, node));

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
        self.base.preregister(entry);
    }

    fn register(&self, session: &Arc<ClientSession>) -> Result<(), SessionError> {
        if !self.base.log_invocation("register", &session.id().to_string(), true) {
            return Ok(());
        }

        let connections = self.broker_connections(session);
        tracing::info!(
            "{}: sending grouping configurations to client {}: {:?}",
            NAME,
            session.id(),
            connections
        );
        self.send_grouping_configurations(&connections, session)?;

        if let Some(grouping) = self.node_grouping() {
            tracing::info!("{}: setting active grouping of client {}: {}", NAME, session.id(), grouping);
            session.set_active_grouping(&grouping)?;
        }
        Ok(())
    }

    fn unregister(&self, session: &Arc<ClientSession>) {
        if !self.base.log_invocation("unregister", &session.id().to_string(), true) {
            return;
        }
        tracing::info!(
            "{}: client unregistered: {} @ {}",
            NAME,
            session.id(),
            session.ip_address()
        );
    }

    fn client_ready(&self, session: &Arc<ClientSession>) {
        self.base.client_ready(session);
    }

    fn process_client_input(&self, session: &Arc<ClientSession>, line: &str) -> bool {
        if line.trim().is_empty() {
            return false;
        }
        tracing::info!(
            "{}: client {} @ {}: input: {}",
            NAME,
            session.id(),
            session.ip_address(),
            line
        );
        true
    }
}
