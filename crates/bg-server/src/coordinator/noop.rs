//! Coordinator that admits everything and pushes nothing

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bg_core::{ConfigError, SessionError};

use super::{CoordinatorContext, CoordinatorCore, ServerCoordinator};
use crate::registry::NodeRegistryEntry;
use crate::session::ClientSession;
use crate::topology::Topology;

pub const NAME: &str = "noop";

/// Default coordinator
///
/// Accepts every node and every session without sending any configuration.
/// It also provides the start/stop bookkeeping that the other built-in
/// coordinators build on.
#[derive(Debug)]
pub struct NoopCoordinator {
    name: &'static str,
    core: CoordinatorCore,
    started: AtomicBool,
}

impl NoopCoordinator {
    pub fn new() -> Self {
        Self::named(NAME)
    }

    pub(crate) fn named(name: &'static str) -> Self {
        Self {
            name,
            core: CoordinatorCore::new(),
            started: AtomicBool::new(false),
        }
    }

    pub fn core(&self) -> &CoordinatorCore {
        &self.core
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Log a hook invocation. Returns whether the coordinator is running.
    ///
    /// With `expect_started` a call on a stopped coordinator is warned about,
    /// without it a call on a running one is.
    pub(crate) fn log_invocation(&self, method: &str, subject: &str, expect_started: bool) -> bool {
        let started = self.is_started();
        if expect_started && !started {
            tracing::warn!("{}: {}(): coordinator has not been started {}", self.name, method, subject);
        } else if !expect_started && started {
            tracing::warn!("{}: {}(): coordinator is already running {}", self.name, method, subject);
        } else {
            tracing::debug!("{}: {}(): invoked {}", self.name, method, subject);
        }
        started
    }
}

impl Default for NoopCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerCoordinator for NoopCoordinator {
    fn name(&self) -> &str {
        self.name
    }

    fn initialize(&self, ctx: CoordinatorContext) -> Result<(), ConfigError> {
        if self.log_invocation("initialize", "", false) {
            return Ok(());
        }
        self.core.install(ctx);
        Ok(())
    }

    fn topology(&self) -> Option<Arc<Topology>> {
        self.core.topology()
    }

    fn start(&self) {
        if self.log_invocation("start", "", false) {
            return;
        }
        self.started.store(true, Ordering::SeqCst);
        if self.core.fire_ready() {
            tracing::info!("{}: start(): ready callback invoked", self.name);
        }
    }

    fn stop(&self) {
        if !self.log_invocation("stop", "", true) {
            return;
        }
        self.started.store(false, Ordering::SeqCst);
    }

    fn preregister(&self, entry: &Arc<NodeRegistryEntry>) {
        self.log_invocation("preregister", &entry.node_id_and_address(), true);
    }

    fn register(&self, session: &Arc<ClientSession>) -> Result<(), SessionError> {
        self.log_invocation("register", &session.id().to_string(), true);
        Ok(())
    }

    fn unregister(&self, session: &Arc<ClientSession>) {
        self.log_invocation("unregister", &session.id().to_string(), true);
    }

    fn client_ready(&self, session: &Arc<ClientSession>) {
        self.log_invocation("client_ready", &session.id().to_string(), true);
    }
}
