//! Per-connection protocol handler
//!
//! A [`ClientSession`] owns one agent connection from the moment the shell
//! channel opens until it closes. It reads newline terminated lines, runs the
//! handshake, dispatches every later line as a parsed [`ClientMessage`] and
//! drives the lifecycle of the node's [`NodeRegistryEntry`].
//!
//! Outbound lines are queued on an unbounded channel drained by the transport,
//! so pushing to a session never blocks. The transport learns that the
//! session is over through the exit callback, which fires exactly once.
//!
//! ```text
//! run ─┬─ no entry ──────────────▶ close immediately (exit 2)
//!      └─ activate ─▶ REGISTERING ─▶ serve ─┬─ EOF ───▶ EXITING
//!                                           └─ error ─▶ REGISTRATION_ERROR | DISCONNECTED
//!                                  finish ─▶ unregister, exit 0, EXITING → EXITED
//! ```

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use bg_core::time::{current_time_millis, elapsed_millis};
use bg_core::types::NodeInfo;
use bg_core::{NodeState, RegistryError, SessionError};
use bg_protocol::{
    ClientConfiguration, ClientMessage, Greeting, GroupingConfiguration, LineCodec, Notification,
    NotifyLevel, ServerCommand, SessionId,
};

use super::active::ActiveSessions;
use super::exit::{ExitHook, EXIT_NORMAL, EXIT_REJECTED, EXIT_STOPPED};
use super::pending::PendingInputs;
use crate::auth::mask_secret;
use crate::coordinator::ServerCoordinator;
use crate::events::{EventBus, ServerEvent};
use crate::registry::{error_info, NodeRegistry, NodeRegistryEntry};
use crate::truststore::TrustStore;

/// Key added to every statistics snapshot
pub const STATS_RECEIVED_AT: &str = "_received_at_server_timestamp";

const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Per-session behaviour taken from the server configuration
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Honor `address=` and `port=` in the greeting
    pub address_override_allowed: bool,
    /// Echo every received line back as `ECHO <line>`
    pub echo: bool,
    /// How long `read_from_client` waits for the reply
    pub read_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            address_override_allowed: false,
            echo: false,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

/// Collaborators injected into every session
#[derive(Clone)]
pub struct SessionContext {
    pub coordinator: Arc<dyn ServerCoordinator>,
    pub registry: Arc<NodeRegistry>,
    pub sessions: Arc<ActiveSessions>,
    pub events: EventBus,
    pub trust_store: Arc<dyn TrustStore>,
    pub settings: SessionSettings,
}

#[derive(Debug, Default)]
struct SessionState {
    client_id: Option<String>,
    ip_address: String,
    port: u16,
    broker_url: Option<String>,
    broker_username: Option<String>,
    broker_password: Option<String>,
    certificate: Option<String>,
    hostname: Option<String>,
    grouping: Option<String>,
    node_status: Option<String>,
    properties: BTreeMap<String, String>,
    statistics: Option<Map<String, Value>>,
    cluster_zone: Option<String>,
    cluster_node_address: Option<String>,
    cluster_node_port: Option<u16>,
    cluster_node_hostname: Option<String>,
    last_error: Option<String>,
}

/// One live agent connection
pub struct ClientSession {
    id: SessionId,
    ctx: SessionContext,
    peer: SocketAddr,
    /// Address the registry knows the node by; fixed for the session's life
    address: String,
    entry: Option<Arc<NodeRegistryEntry>>,
    outbound: mpsc::UnboundedSender<String>,
    exit: ExitHook,
    cancel: CancellationToken,
    pending: PendingInputs,
    stopped: AtomicBool,
    superseded: AtomicBool,
    state: Mutex<SessionState>,
}

impl ClientSession {
    /// Create a session for a connection from `peer`
    ///
    /// The registry entry is looked up by the peer's IP address here and
    /// never changes afterwards. The returned receiver yields the lines to
    /// write to the agent, without terminators.
    pub fn new(
        ctx: SessionContext,
        peer: SocketAddr,
        exit: ExitHook,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let id = SessionId::next();
        let address = peer.ip().to_canonical().to_string();
        let entry = ctx.registry.get_node_by_address(&address);
        let (outbound, rx) = mpsc::unbounded_channel();

        tracing::info!("{}--> New session from {}", id, peer);
        if entry.is_none() {
            tracing::error!("{}--> No registry entry for {}, session marked for immediate close", id, address);
        }

        let session = Arc::new(Self {
            id,
            ctx,
            peer,
            address: address.clone(),
            entry,
            outbound,
            exit,
            cancel: CancellationToken::new(),
            pending: PendingInputs::new(),
            stopped: AtomicBool::new(false),
            superseded: AtomicBool::new(false),
            state: Mutex::new(SessionState {
                ip_address: address,
                port: peer.port(),
                ..SessionState::default()
            }),
        });
        (session, rx)
    }

    /// Drive the session until the agent disconnects or the session is stopped
    pub async fn run<R>(self: Arc<Self>, reader: R)
    where
        R: AsyncRead + Unpin + Send,
    {
        let Some(entry) = self.entry.clone() else {
            self.close_immediately(false);
            return;
        };

        if !self.activate() {
            self.close_immediately(true);
            return;
        }

        self.ctx.events.publish(ServerEvent::ClientStarting {
            session: self.id,
            address: self.address.clone(),
        });
        self.transition(entry.node_registering(&NodeInfo::new()));

        tracing::info!("{}==> Session started", self.id);
        let result = match self.send_to_client(&format!("CLIENT ({}) : START", self.id)) {
            Ok(()) => self.serve(reader, &entry).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => self.on_end_of_input(&entry),
            Err(e) => self.on_error(&entry, e),
        }
        self.finish(&entry);
    }

    /// Add to the active index, resolving an address conflict through the coordinator
    fn activate(self: &Arc<Self>) -> bool {
        let existing = match self.ctx.sessions.try_insert(&self.address, self) {
            Ok(()) => return true,
            Err(existing) => existing,
        };

        if !self.ctx.coordinator.allow_already_registered_node(self) {
            tracing::warn!(
                "{}--> Refused: session {} is already active for {}",
                self.id,
                existing.id(),
                self.address
            );
            return false;
        }

        tracing::warn!(
            "{}--> Session {} is already active for {}, replacing it",
            self.id,
            existing.id(),
            self.address
        );
        existing.supersede();
        self.ctx.sessions.replace(&self.address, self);
        true
    }

    fn close_immediately(self: &Arc<Self>, refused: bool) {
        if !refused {
            let allowed = self.ctx.coordinator.allow_not_preregistered_node(self);
            tracing::warn!(
                "{}--> Exiting immediately: {} is not pre-registered (coordinator allows unknown nodes: {})",
                self.id,
                self.address,
                allowed
            );
        }
        self.ctx.events.publish(ServerEvent::SessionClosingImmediately {
            session: self.id,
            address: self.address.clone(),
        });
        if !refused {
            self.ctx.coordinator.unregister(self);
        }
        self.cancel.cancel();
        self.exit.fire(EXIT_REJECTED);
        tracing::info!("{}--> Session closed immediately", self.id);
        self.ctx.events.publish(ServerEvent::SessionClosedImmediately {
            session: self.id,
            address: self.address.clone(),
        });
    }

    async fn serve<R>(self: &Arc<Self>, reader: R, entry: &Arc<NodeRegistryEntry>) -> Result<(), SessionError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut lines = FramedRead::new(reader, LineCodec::new());
        let mut greeted = false;
        let mut warned = false;

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::debug!("{}--> Session cancelled", self.id);
                    return Ok(());
                }
                next = lines.next() => next,
            };
            let Some(line) = next else {
                return Ok(());
            };
            let line = line?;
            let line = line.trim();
            tracing::debug!("{}--> {}", self.id, line);

            if self.ctx.settings.echo {
                self.send_to_client(&format!("ECHO {}", line))?;
            }

            match ClientMessage::parse(line)? {
                ClientMessage::Hello(greeting) if !greeted => {
                    greeted = true;
                    self.handshake(greeting, entry)?;
                }
                message => {
                    if !greeted && !warned {
                        warned = true;
                        tracing::warn!("{}--> Expected greeting, got: {}", self.id, line);
                    }
                    self.dispatch(message)?
                }
            }
        }
    }

    fn handshake(self: &Arc<Self>, greeting: Greeting, entry: &Arc<NodeRegistryEntry>) -> Result<(), SessionError> {
        self.apply_greeting(&greeting);

        self.ctx.coordinator.register(self)?;
        self.ctx.events.publish(ServerEvent::ClientRegistered {
            session: self.id,
            address: self.address.clone(),
            client_id: self.client_id(),
        });
        self.transition(entry.node_registered(&NodeInfo::new()));

        self.send_command(&ServerCommand::SendStatsStart)
    }

    fn apply_greeting(&self, greeting: &Greeting) {
        let allow_override = self.ctx.settings.address_override_allowed;
        let mut state = self.state.lock();

        if let Some(client_id) = greeting
            .client_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty() && !id.eq_ignore_ascii_case("null"))
        {
            tracing::info!("{}--> Client Id: {}", self.id, client_id);
            state.client_id = Some(client_id.to_string());
        }
        if let Some(url) = &greeting.broker_url {
            tracing::info!("{}--> Broker URL: {}", self.id, url);
            state.broker_url = Some(url.clone());
        }
        if allow_override {
            if let Some(address) = greeting.address.as_deref().map(str::trim).filter(|a| !a.is_empty()) {
                tracing::info!("{}--> Effective IP: {}", self.id, address);
                state.ip_address = address.to_string();
            }
            if let Some(port) = greeting.port {
                tracing::info!("{}--> Effective Port: {}", self.id, port);
                state.port = port;
            }
        }
        if let Some(username) = &greeting.username {
            tracing::info!("{}--> Broker Username: {}", self.id, username);
            state.broker_username = Some(username.clone());
        }
        if let Some(password) = &greeting.password {
            tracing::info!("{}--> Broker Password: {}", self.id, mask_secret(password));
            state.broker_password = Some(password.clone());
        }
        state.certificate = greeting.certificate().map(str::to_string);
        let alias = state.ip_address.clone();
        drop(state);

        match greeting.certificate() {
            Some(pem) => {
                tracing::info!("{}--> Adding client certificate to trust store: alias={}", self.id, alias);
                if let Err(e) = self.ctx.trust_store.add_or_replace(&alias, pem) {
                    tracing::warn!("{}--> Could not store client certificate: {}", self.id, e);
                }
            }
            None => tracing::debug!("{}--> No client certificate, trust store unchanged", self.id),
        }

        for token in &greeting.unknown {
            tracing::warn!("{}--> Unknown HELLO argument will be ignored: {}", self.id, token);
        }
    }

    fn dispatch(self: &Arc<Self>, message: ClientMessage) -> Result<(), SessionError> {
        match message {
            ClientMessage::Hello(_) => {
                tracing::warn!("{}--> Repeated greeting ignored", self.id);
            }
            ClientMessage::Input { id, value } => {
                if !self.pending.deliver(&id, value) {
                    tracing::warn!("{}--> Input for unknown request: {}", self.id, id);
                }
            }
            ClientMessage::NodeCredentialsQuery(address) => {
                let reply = match self.ctx.registry.get_node_by_address(&address) {
                    Some(entry) => {
                        tracing::debug!("{}--> Pre-registration info requested for {}", self.id, address);
                        serde_json::to_string(&entry.preregistration())
                            .map_err(bg_protocol::ProtocolError::from)?
                    }
                    None => {
                        tracing::warn!("{}--> Unknown node: {}", self.id, address);
                        "{}".to_string()
                    }
                };
                self.send_to_client(&reply)?;
            }
            ClientMessage::ServerQuery(line) => {
                tracing::warn!("{}--> Unsupported server request: {}", self.id, line);
            }
            ClientMessage::GroupingChange(grouping) => {
                let mut state = self.state.lock();
                tracing::info!(
                    "{}--> Client grouping changed: {:?} --> {}",
                    self.id,
                    state.grouping,
                    grouping
                );
                if !grouping.is_empty() && state.grouping.as_deref() != Some(grouping.as_str()) {
                    state.grouping = Some(grouping);
                }
            }
            ClientMessage::StatusChange(status) => {
                let mut state = self.state.lock();
                tracing::info!(
                    "{}--> Client status changed: {:?} --> {}",
                    self.id,
                    state.node_status,
                    status
                );
                if !status.is_empty() && state.node_status.as_deref() != Some(status.as_str()) {
                    state.node_status = Some(status);
                }
            }
            ClientMessage::Notify(notification) => self.notify(notification),
            ClientMessage::PropertyChange { name, value } => {
                if name.is_empty() {
                    tracing::warn!("{}--> Invalid client property change", self.id);
                    return Ok(());
                }
                let mut state = self.state.lock();
                let old = match value {
                    Some(value) => state.properties.insert(name.clone(), value.clone()),
                    None => state.properties.remove(&name),
                };
                tracing::info!(
                    "{}--> Client property changed: {} = {:?} --> {:?}",
                    self.id,
                    name,
                    old,
                    state.properties.get(&name)
                );
            }
            ClientMessage::Stats(value) => match value {
                Value::Object(mut stats) => {
                    stats.insert(STATS_RECEIVED_AT.to_string(), Value::from(current_time_millis()));
                    tracing::debug!("{}--> Client STATS received: {} entries", self.id, stats.len());
                    self.state.lock().statistics = Some(stats);
                }
                Value::Null => tracing::debug!("{}--> Client STATS object is null", self.id),
                other => tracing::error!("{}--> Unsupported client STATS object: {}", self.id, other),
            },
            ClientMessage::Ready => self.ctx.coordinator.client_ready(self),
            ClientMessage::Other(line) => {
                self.ctx.coordinator.process_client_input(self, &line);
            }
        }
        Ok(())
    }

    fn notify(&self, notification: Notification) {
        match notification {
            Notification::Log { level, text } => {
                let text = text.unwrap_or_default();
                match level {
                    NotifyLevel::Debug => tracing::debug!("{}--> {}", self.id, text),
                    NotifyLevel::Info => tracing::info!("{}--> {}", self.id, text),
                    NotifyLevel::Warn => tracing::warn!("{}--> {}", self.id, text),
                    NotifyLevel::Error => tracing::error!("{}--> {}", self.id, text),
                }
            }
            Notification::RecoveryGiveUp { node_id, address } => {
                tracing::info!(
                    "{}--> Client recovery notification: GIVE_UP: {} @ {}",
                    self.id,
                    node_id,
                    address
                );
                self.ctx.events.publish(ServerEvent::SelfHealingGiveUp {
                    address,
                    sender: format!("Client_{}", self.id),
                });
            }
            Notification::RecoveryMissingAddress(args) => {
                tracing::warn!("{}--> Missing node address in client recovery notification: {}", self.id, args);
            }
            Notification::RecoveryUnknown(args) => {
                tracing::warn!("{}--> UNKNOWN client recovery notification: {}", self.id, args);
            }
            Notification::RecoveryInvalid(args) => {
                tracing::warn!("{}--> INVALID client recovery notification: {:?}", self.id, args);
            }
            Notification::Unknown(message) => {
                tracing::warn!("{}--> UNKNOWN client notification type: {}", self.id, message);
            }
        }
    }

    fn on_end_of_input(&self, entry: &NodeRegistryEntry) {
        self.ctx.events.publish(ServerEvent::ClientExiting {
            session: self.id,
            address: self.address.clone(),
        });
        if self.superseded.load(Ordering::SeqCst) {
            tracing::debug!("{}==> Session was replaced, node state left alone", self.id);
        } else if entry.is_archived() {
            tracing::warn!("{}==> Node is archived", self.id);
        } else {
            self.transition(entry.node_exiting(&NodeInfo::new()));
        }

        if !self.stopped.load(Ordering::SeqCst) {
            tracing::info!("{}==> Signaling client to exit", self.id);
            if let Err(e) = self.send_command(&ServerCommand::Exit(None)) {
                tracing::debug!("{}==> {}", self.id, e);
            }
        }
    }

    fn on_error(&self, entry: &NodeRegistryEntry, error: SessionError) {
        tracing::warn!("{}==> EXCEPTION : {}", self.id, error);
        // The channel may already be gone.
        let _ = self.send_to_client(&format!("EXCEPTION {}", error));
        self.state.lock().last_error = Some(error.to_string());
        self.ctx.events.publish(ServerEvent::ClientException {
            session: self.id,
            address: self.address.clone(),
            error: error.to_string(),
        });

        if self.superseded.load(Ordering::SeqCst) {
            return;
        }
        let info = error_info(&error);
        if entry.state() == NodeState::Registering {
            self.transition(entry.node_registration_error(&info));
        } else {
            self.transition(entry.node_disconnected(&info));
        }
    }

    fn finish(self: &Arc<Self>, entry: &NodeRegistryEntry) {
        self.ctx.sessions.remove(&self.address, self.id);
        self.cancel.cancel();
        let dropped = self.pending.cancel_all();
        if dropped > 0 {
            tracing::debug!("{}--> Cancelled {} pending read(s)", self.id, dropped);
        }
        tracing::info!("{}--> Session stops", self.id);

        self.ctx.coordinator.unregister(self);
        self.ctx.events.publish(ServerEvent::ClientUnregistered {
            session: self.id,
            address: self.address.clone(),
        });

        self.exit.fire(EXIT_NORMAL);
        self.ctx.events.publish(ServerEvent::ClientExited {
            session: self.id,
            address: self.address.clone(),
        });

        if !self.superseded.load(Ordering::SeqCst) && entry.state() == NodeState::Exiting {
            self.transition(entry.node_exited(&NodeInfo::new()));
        }
    }

    fn transition(&self, result: Result<(), RegistryError>) {
        if let Err(e) = result {
            tracing::warn!("{}--> {}", self.id, e);
        }
    }

    // ------------------------------------------------------------------
    // Outbound

    /// Queue a line for the agent. Blank lines are dropped.
    pub fn send_to_client(&self, line: &str) -> Result<(), SessionError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(());
        }
        tracing::info!("{}==> PUSH : {}", self.id, line);
        self.push(line.to_string())
    }

    /// Encode and queue a command
    pub fn send_command(&self, command: &ServerCommand) -> Result<(), SessionError> {
        let line = command.encode()?;
        match command {
            ServerCommand::SetParams(_)
            | ServerCommand::SetClientConfig(_)
            | ServerCommand::SetGroupingConfig(_) => {
                let name = line.split(' ').next().unwrap_or_default();
                tracing::info!("{}==> PUSH : {} ({} bytes)", self.id, name, line.len());
                tracing::trace!("{}==> PUSH : {}", self.id, line);
                self.push(line)
            }
            _ => self.send_to_client(&line),
        }
    }

    fn push(&self, line: String) -> Result<(), SessionError> {
        self.outbound
            .send(line)
            .map_err(|_| SessionError::Disconnected(self.id.to_string()))
    }

    pub fn set_client_id(&self, id: &str) -> Result<(), SessionError> {
        if id.trim().is_empty() {
            return Ok(());
        }
        self.send_command(&ServerCommand::SetId(id.trim().to_string()))
    }

    pub fn set_role(&self, role: &str) -> Result<(), SessionError> {
        if role.trim().is_empty() {
            return Ok(());
        }
        self.send_command(&ServerCommand::SetRole(role.trim().to_string()))
    }

    pub fn set_active_grouping(&self, grouping: &str) -> Result<(), SessionError> {
        if grouping.trim().is_empty() {
            return Ok(());
        }
        self.send_command(&ServerCommand::SetActiveGrouping(grouping.trim().to_string()))
    }

    /// Push parameters; an empty set sends nothing
    pub fn send_params(&self, params: &BTreeMap<String, String>) -> Result<(), SessionError> {
        if params.is_empty() {
            return Ok(());
        }
        self.send_command(&ServerCommand::SetParams(params.clone()))
    }

    pub fn send_client_configuration(&self, config: &ClientConfiguration) -> Result<(), SessionError> {
        self.send_command(&ServerCommand::SetClientConfig(config.clone()))
    }

    pub fn send_grouping_configuration(&self, config: &GroupingConfiguration) -> Result<(), SessionError> {
        tracing::debug!("{}==> Grouping configuration for {}", self.id, config.name);
        self.send_command(&ServerCommand::SetGroupingConfig(config.clone()))
    }

    pub fn send_constants(&self, constants: &BTreeMap<String, f64>) -> Result<(), SessionError> {
        self.send_command(&ServerCommand::SetConstants(constants.clone()))
    }

    /// Tell the agent to exit and terminate the session. Only the first call has an effect.
    pub fn stop(&self, message: &str) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            tracing::debug!("{}==> Already stopped", self.id);
            return;
        }
        tracing::info!("{}==> STOP : {}", self.id, message);
        let message = Some(message.trim().to_string()).filter(|m| !m.is_empty());
        if let Err(e) = self.send_command(&ServerCommand::Exit(message)) {
            tracing::debug!("{}==> {}", self.id, e);
        }
        self.exit.fire(EXIT_STOPPED);
        self.cancel.cancel();
    }

    /// Stop a session whose address has been taken over by a newer one
    fn supersede(&self) {
        self.superseded.store(true, Ordering::SeqCst);
        self.stop("Replaced by a new connection");
    }

    /// Send `<command> <id>` and wait for the matching `-INPUT:<id>:` reply
    pub async fn read_from_client(&self, command: &str) -> Result<Value, SessionError> {
        self.read_from_client_with_timeout(command, self.ctx.settings.read_timeout)
            .await
    }

    pub async fn read_from_client_with_timeout(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<Value, SessionError> {
        if self.cancel.is_cancelled() {
            return Err(SessionError::Cancelled(self.id.to_string()));
        }

        let (id, reply) = self.pending.register();
        let started = current_time_millis();
        let request = ServerCommand::Correlated {
            command: command.to_string(),
            id: id.clone(),
        };
        if let Err(e) = self.send_command(&request) {
            self.pending.forget(&id);
            return Err(e);
        }

        let result = tokio::select! {
            reply = reply => reply.map_err(|_| SessionError::Cancelled(self.id.to_string())),
            _ = tokio::time::sleep(timeout) => Err(SessionError::Timeout {
                command: command.to_string(),
                timeout,
            }),
            _ = self.cancel.cancelled() => Err(SessionError::Cancelled(self.id.to_string())),
        };
        if result.is_err() {
            self.pending.forget(&id);
        }

        tracing::debug!(
            "{}<== Read {} completed after {} ms: ok={}",
            self.id,
            id,
            elapsed_millis(started),
            result.is_ok()
        );
        result
    }

    // ------------------------------------------------------------------
    // Accessors

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Address the session is indexed and registered under
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn entry(&self) -> Option<Arc<NodeRegistryEntry>> {
        self.entry.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Client id from the greeting, or the session id before that
    pub fn client_id(&self) -> String {
        self.state
            .lock()
            .client_id
            .clone()
            .unwrap_or_else(|| self.id.to_string())
    }

    /// Effective IP address of the agent
    pub fn ip_address(&self) -> String {
        self.state.lock().ip_address.clone()
    }

    pub fn port(&self) -> u16 {
        self.state.lock().port
    }

    pub fn broker_url(&self) -> Option<String> {
        self.state.lock().broker_url.clone()
    }

    pub fn broker_username(&self) -> Option<String> {
        self.state.lock().broker_username.clone()
    }

    pub fn broker_password(&self) -> Option<String> {
        self.state.lock().broker_password.clone()
    }

    pub fn certificate(&self) -> Option<String> {
        self.state.lock().certificate.clone()
    }

    pub fn hostname(&self) -> Option<String> {
        self.state.lock().hostname.clone()
    }

    pub fn set_hostname(&self, hostname: Option<String>) {
        self.state.lock().hostname = hostname;
    }

    pub fn grouping(&self) -> Option<String> {
        self.state.lock().grouping.clone()
    }

    pub fn node_status(&self) -> Option<String> {
        self.state.lock().node_status.clone()
    }

    pub fn property(&self, name: &str) -> Option<String> {
        self.state.lock().properties.get(name).cloned()
    }

    pub fn properties(&self) -> BTreeMap<String, String> {
        self.state.lock().properties.clone()
    }

    /// Latest statistics snapshot
    pub fn statistics(&self) -> Option<Map<String, Value>> {
        self.state.lock().statistics.clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.state.lock().last_error.clone()
    }

    pub fn cluster_zone(&self) -> Option<String> {
        self.state.lock().cluster_zone.clone()
    }

    pub fn set_cluster_zone(&self, zone: Option<String>) {
        self.state.lock().cluster_zone = zone;
    }

    pub fn cluster_node_address(&self) -> Option<String> {
        self.state.lock().cluster_node_address.clone()
    }

    pub fn cluster_node_port(&self) -> Option<u16> {
        self.state.lock().cluster_node_port
    }

    pub fn cluster_node_hostname(&self) -> Option<String> {
        self.state.lock().cluster_node_hostname.clone()
    }

    /// Record where the agent's cluster node listens
    pub fn set_cluster_node(&self, address: String, hostname: String, port: u16) {
        let mut state = self.state.lock();
        state.cluster_node_address = Some(address);
        state.cluster_node_hostname = Some(hostname);
        state.cluster_node_port = Some(port);
    }

    /// `<address>:<port>` of the agent's cluster node
    pub fn cluster_endpoint(&self) -> String {
        let state = self.state.lock();
        format!(
            "{}:{}",
            state.cluster_node_address.as_deref().unwrap_or(&state.ip_address),
            state.cluster_node_port.unwrap_or_default()
        )
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("client_id", &self.client_id())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
