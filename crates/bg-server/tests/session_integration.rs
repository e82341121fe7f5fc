//! Session integration tests
//!
//! Drives `ClientSession` over an in-memory pipe the way the SSH transport
//! does, and the server facade over a real listener.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use bg_core::config::ServerConfig;
use bg_core::types::NodeInfo;
use bg_core::{ConfigError, NodeState, SessionError};
use bg_server::coordinator::{CoordinatorContext, NoopCoordinator};
use bg_server::events::{EventBus, ServerEvent};
use bg_server::resolver::SystemResolver;
use bg_server::session::{
    ActiveSessions, ClientSession, ExitHook, SessionContext, SessionSettings, EXIT_NORMAL,
    EXIT_REJECTED, EXIT_STOPPED, STATS_RECEIVED_AT,
};
use bg_server::truststore::MemoryTrustStore;
use bg_server::{BaguetteServer, BrokerEndpoint, NodeRegistry, ServerCoordinator, Topology, TranslationContext};

const WAIT: Duration = Duration::from_secs(5);

fn info(value: Value) -> NodeInfo {
    value.as_object().cloned().unwrap_or_default()
}

fn peer(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// Collaborators shared by the sessions of one test
struct Fixture {
    ctx: SessionContext,
}

impl Fixture {
    fn new() -> Self {
        Self::with_settings(SessionSettings::default())
    }

    fn with_settings(settings: SessionSettings) -> Self {
        let coordinator = Arc::new(NoopCoordinator::new());
        coordinator.start();
        Self::with_coordinator(coordinator, settings)
    }

    fn with_coordinator(coordinator: Arc<dyn ServerCoordinator>, settings: SessionSettings) -> Self {
        Self {
            ctx: SessionContext {
                coordinator,
                registry: Arc::new(NodeRegistry::new(Arc::new(SystemResolver))),
                sessions: Arc::new(ActiveSessions::new()),
                events: EventBus::default(),
                trust_store: Arc::new(MemoryTrustStore::new()),
                settings,
            },
        }
    }

    async fn preregister(&self, address: &str, client_id: &str) {
        self.ctx
            .registry
            .add_node(info(json!({"address": address, "type": "VM"})), client_id)
            .await
            .unwrap();
    }

    fn connect(&self, peer: SocketAddr) -> Agent {
        let (reader, writer) = tokio::io::duplex(64 * 1024);
        let (exit_tx, exit_rx) = oneshot::channel();
        let exit = ExitHook::new(Box::new(move |code| {
            let _ = exit_tx.send(code);
        }));
        let (session, outbound) = ClientSession::new(self.ctx.clone(), peer, exit);
        let task = tokio::spawn(Arc::clone(&session).run(reader));
        Agent {
            session,
            input: Some(writer),
            outbound,
            exit: exit_rx,
            task,
        }
    }
}

/// Keeps the session hooks it receives
#[derive(Default)]
struct RecordingCoordinator {
    calls: Mutex<Vec<String>>,
}

impl RecordingCoordinator {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

impl ServerCoordinator for RecordingCoordinator {
    fn name(&self) -> &str {
        "recording"
    }

    fn initialize(&self, _ctx: CoordinatorContext) -> Result<(), ConfigError> {
        Ok(())
    }

    fn topology(&self) -> Option<Arc<Topology>> {
        None
    }

    fn register(&self, session: &Arc<ClientSession>) -> Result<(), SessionError> {
        self.record(format!("register {}", session.client_id()));
        Ok(())
    }

    fn unregister(&self, _session: &Arc<ClientSession>) {
        self.record("unregister".into());
    }

    fn client_ready(&self, _session: &Arc<ClientSession>) {
        self.record("ready".into());
    }

    fn process_client_input(&self, _session: &Arc<ClientSession>, line: &str) -> bool {
        self.record(format!("input {}", line));
        true
    }
}

/// The agent end of a session
struct Agent {
    session: Arc<ClientSession>,
    input: Option<DuplexStream>,
    outbound: mpsc::UnboundedReceiver<String>,
    exit: oneshot::Receiver<i32>,
    task: JoinHandle<()>,
}

impl Agent {
    async fn send(&mut self, line: &str) {
        let input = self.input.as_mut().unwrap();
        input.write_all(line.as_bytes()).await.unwrap();
        input.write_all(b"\n").await.unwrap();
    }

    async fn recv(&mut self) -> String {
        timeout(WAIT, self.outbound.recv())
            .await
            .expect("timed out waiting for a server line")
            .expect("outbound channel closed")
    }

    /// Wait for the start line and complete the greeting
    async fn handshake(&mut self, greeting: &str) {
        let start = self.recv().await;
        assert!(start.starts_with("CLIENT (#"), "unexpected start line: {}", start);
        assert!(start.ends_with(") : START"));
        self.send(&format!("-HELLO FROM CLIENT: {}", greeting)).await;
        assert_eq!(self.recv().await, "SEND-STATS START");
    }

    /// Close the input side, as an agent disconnecting does
    fn hang_up(&mut self) {
        self.input.take();
    }

    async fn exit_code(&mut self) -> i32 {
        timeout(WAIT, &mut self.exit).await.unwrap().unwrap()
    }

    async fn finished(&mut self) {
        timeout(WAIT, &mut self.task).await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn test_registry_preregistration() {
    let fixture = Fixture::new();
    fixture.preregister("10.0.0.5", "client-1").await;

    let entry = fixture.ctx.registry.get_node_by_address("10.0.0.5").unwrap();
    assert_eq!(entry.state(), NodeState::Preregistered);
    assert_eq!(entry.ip_address(), "10.0.0.5");
    assert_eq!(entry.client_id(), "client-1");
}

#[tokio::test]
async fn test_greeting_keeps_peer_address_without_override() {
    let fixture = Fixture::new();
    fixture.preregister("127.0.0.1", "client-1").await;
    let mut agent = fixture.connect(peer(40001));

    agent
        .handshake("id=node1 broker=tcp://b:61616 address=10.9.9.9 port=2022 username=u password=p")
        .await;

    let session = &agent.session;
    assert_eq!(session.ip_address(), "127.0.0.1");
    assert_eq!(session.port(), 40001);
    assert_eq!(session.client_id(), "node1");
    assert_eq!(session.broker_url().as_deref(), Some("tcp://b:61616"));
    assert_eq!(session.broker_username().as_deref(), Some("u"));
    assert_eq!(session.broker_password().as_deref(), Some("p"));

    let entry = session.entry().unwrap();
    assert_eq!(entry.state(), NodeState::Registered);
}

#[tokio::test]
async fn test_greeting_override_when_allowed() {
    let fixture = Fixture::with_settings(SessionSettings {
        address_override_allowed: true,
        ..SessionSettings::default()
    });
    fixture.preregister("127.0.0.1", "client-1").await;
    let mut agent = fixture.connect(peer(40002));

    agent.handshake("id=node1 address=10.9.9.9 port=2022").await;

    assert_eq!(agent.session.ip_address(), "10.9.9.9");
    assert_eq!(agent.session.port(), 2022);
    // Still indexed under the transport address
    assert_eq!(agent.session.address(), "127.0.0.1");
    assert!(fixture.ctx.sessions.get_by_address("127.0.0.1").is_some());
}

#[tokio::test]
async fn test_read_from_client_returns_correlated_reply() {
    let fixture = Fixture::new();
    fixture.preregister("127.0.0.1", "client-1").await;
    let mut agent = fixture.connect(peer(40003));
    agent.handshake("id=node1").await;

    let session = Arc::clone(&agent.session);
    let read = tokio::spawn(async move { session.read_from_client("STAT_CMD").await });

    let request = agent.recv().await;
    let id = request.strip_prefix("STAT_CMD ").unwrap().to_string();
    // A reply for another request is ignored
    agent.send("-INPUT:someone-else:1").await;
    agent.send(&format!("-INPUT:{}:42", id)).await;

    let value = timeout(WAIT, read).await.unwrap().unwrap().unwrap();
    assert_eq!(value, json!(42));
}

#[tokio::test]
async fn test_concurrent_reads_get_their_own_replies() {
    let fixture = Fixture::new();
    fixture.preregister("127.0.0.1", "client-1").await;
    let mut agent = fixture.connect(peer(40015));
    agent.handshake("id=node1").await;

    let session = Arc::clone(&agent.session);
    let first = tokio::spawn(async move { session.read_from_client("CMD_A").await });
    let session = Arc::clone(&agent.session);
    let second = tokio::spawn(async move { session.read_from_client("CMD_B").await });

    let mut ids = BTreeMap::new();
    for _ in 0..2 {
        let request = agent.recv().await;
        let (command, id) = request.split_once(' ').unwrap();
        ids.insert(command.to_string(), id.to_string());
    }

    // Answer in the opposite order of the requests
    agent.send(&format!("-INPUT:{}:\"b\"", ids["CMD_B"])).await;
    agent.send(&format!("-INPUT:{}:\"a\"", ids["CMD_A"])).await;

    let second = timeout(WAIT, second).await.unwrap().unwrap().unwrap();
    let first = timeout(WAIT, first).await.unwrap().unwrap().unwrap();
    assert_eq!(first, json!("a"));
    assert_eq!(second, json!("b"));
}

#[tokio::test]
async fn test_read_from_client_times_out() {
    let fixture = Fixture::new();
    fixture.preregister("127.0.0.1", "client-1").await;
    let mut agent = fixture.connect(peer(40004));
    agent.handshake("id=node1").await;

    let result = agent
        .session
        .read_from_client_with_timeout("STAT_CMD", Duration::from_millis(50))
        .await;
    assert!(matches!(result, Err(SessionError::Timeout { .. })));

    // The session is still usable afterwards
    assert!(agent.recv().await.starts_with("STAT_CMD "));
    assert!(!agent.session.is_closed());
}

#[tokio::test]
async fn test_stop_cancels_pending_read_and_exits_once() {
    let fixture = Fixture::new();
    fixture.preregister("127.0.0.1", "client-1").await;
    let mut agent = fixture.connect(peer(40005));
    agent.handshake("id=node1").await;

    let session = Arc::clone(&agent.session);
    let read = tokio::spawn(async move { session.read_from_client("STAT_CMD").await });
    assert!(agent.recv().await.starts_with("STAT_CMD "));

    agent.session.stop("bye");
    agent.session.stop("again");

    let result = timeout(WAIT, read).await.unwrap().unwrap();
    assert!(matches!(result, Err(SessionError::Cancelled(_))));
    assert_eq!(agent.recv().await, "EXIT bye");
    assert_eq!(agent.exit_code().await, EXIT_STOPPED);

    agent.finished().await;
    assert!(fixture.ctx.sessions.is_empty());
    assert!(agent.session.is_closed());
    assert!(matches!(
        agent.session.read_from_client("STAT_CMD").await,
        Err(SessionError::Cancelled(_))
    ));
}

#[tokio::test]
async fn test_status_properties_and_latest_stats() {
    let fixture = Fixture::new();
    fixture.preregister("127.0.0.1", "client-1").await;
    let mut agent = fixture.connect(peer(40006));
    agent.handshake("id=node1").await;

    agent.send("-NOTIFY-STATUS-CHANGE: RUNNING").await;
    agent.send("-NOTIFY-GROUPING-CHANGE: PER_INSTANCE").await;
    agent.send("-CLIENT-PROPERTY-CHANGE:node-id n-17").await;
    agent.send("-STATS:{\"cpu\":1}").await;
    agent.send("-STATS:{\"cpu\":2}").await;
    // Replies are sent in order, so this one marks the lines above as handled
    agent.send("SERVER-GET-NODE-SSH-CREDENTIALS 10.1.1.1").await;
    assert_eq!(agent.recv().await, "{}");

    let session = &agent.session;
    assert_eq!(session.node_status().as_deref(), Some("RUNNING"));
    assert_eq!(session.grouping().as_deref(), Some("PER_INSTANCE"));
    assert_eq!(session.property("node-id").as_deref(), Some("n-17"));

    let stats = session.statistics().unwrap();
    assert_eq!(stats["cpu"], json!(2));
    assert!(stats.contains_key(STATS_RECEIVED_AT));
}

#[tokio::test]
async fn test_node_credentials_query() {
    let fixture = Fixture::new();
    fixture.preregister("127.0.0.1", "client-1").await;
    fixture.preregister("10.0.0.8", "client-2").await;
    let mut agent = fixture.connect(peer(40007));
    agent.handshake("id=node1").await;

    agent.send("server-get-node-ssh-credentials 10.0.0.8").await;
    let reply: Value = serde_json::from_str(&agent.recv().await).unwrap();
    assert_eq!(reply["address"], "10.0.0.8");
    assert_eq!(reply["type"], "VM");
    assert_eq!(reply["baguette-client-id"], "client-2");
}

#[tokio::test]
async fn test_disconnect_moves_node_to_exited() {
    let fixture = Fixture::new();
    fixture.preregister("127.0.0.1", "client-1").await;
    let mut events = fixture.ctx.events.subscribe();
    let mut agent = fixture.connect(peer(40008));
    agent.handshake("id=node1").await;

    agent.hang_up();
    assert_eq!(agent.recv().await, "EXIT");
    assert_eq!(agent.exit_code().await, EXIT_NORMAL);
    agent.finished().await;

    let entry = agent.session.entry().unwrap();
    assert_eq!(entry.state(), NodeState::Exited);
    assert!(fixture.ctx.sessions.is_empty());

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    let id = agent.session.id();
    let address = "127.0.0.1".to_string();
    assert!(seen.contains(&ServerEvent::ClientStarting {
        session: id,
        address: address.clone()
    }));
    assert!(seen.contains(&ServerEvent::ClientRegistered {
        session: id,
        address: address.clone(),
        client_id: "node1".into()
    }));
    assert_eq!(
        seen.last(),
        Some(&ServerEvent::ClientExited { session: id, address })
    );
}

#[tokio::test]
async fn test_malformed_stats_is_a_registration_error_before_greeting() {
    let fixture = Fixture::new();
    fixture.preregister("127.0.0.1", "client-1").await;
    let mut agent = fixture.connect(peer(40009));
    assert!(agent.recv().await.ends_with(": START"));

    agent.send("-STATS:not json").await;
    assert!(agent.recv().await.starts_with("EXCEPTION "));
    assert_eq!(agent.exit_code().await, EXIT_NORMAL);
    agent.finished().await;

    let entry = agent.session.entry().unwrap();
    assert_eq!(entry.state(), NodeState::RegistrationError);
    assert!(agent.session.last_error().is_some());
}

#[tokio::test]
async fn test_unknown_peer_is_closed_immediately() {
    let fixture = Fixture::new();
    let mut events = fixture.ctx.events.subscribe();
    let mut agent = fixture.connect(peer(40010));

    assert_eq!(agent.exit_code().await, EXIT_REJECTED);
    agent.finished().await;
    assert!(fixture.ctx.sessions.is_empty());
    assert!(agent.session.entry().is_none());

    let id = agent.session.id();
    assert_eq!(
        events.try_recv().unwrap(),
        ServerEvent::SessionClosingImmediately {
            session: id,
            address: "127.0.0.1".into()
        }
    );
    assert_eq!(
        events.try_recv().unwrap(),
        ServerEvent::SessionClosedImmediately {
            session: id,
            address: "127.0.0.1".into()
        }
    );
}

#[tokio::test]
async fn test_one_active_session_per_address() {
    let fixture = Fixture::new();
    fixture.preregister("127.0.0.1", "client-1").await;

    let mut first = fixture.connect(peer(40011));
    first.handshake("id=node1").await;
    let mut second = fixture.connect(peer(40012));
    second.handshake("id=node1").await;

    assert_eq!(first.recv().await, "EXIT Replaced by a new connection");
    assert_eq!(first.exit_code().await, EXIT_STOPPED);
    first.finished().await;

    assert_eq!(fixture.ctx.sessions.len(), 1);
    let active = fixture.ctx.sessions.get_by_address("127.0.0.1").unwrap();
    assert_eq!(active.id(), second.session.id());
    // The replaced session does not touch the node's state
    assert_eq!(second.session.entry().unwrap().state(), NodeState::Registered);
}

#[tokio::test]
async fn test_echo_mode() {
    let fixture = Fixture::with_settings(SessionSettings {
        echo: true,
        ..SessionSettings::default()
    });
    fixture.preregister("127.0.0.1", "client-1").await;
    let mut agent = fixture.connect(peer(40013));
    assert!(agent.recv().await.ends_with(": START"));

    agent.send("READY").await;
    assert_eq!(agent.recv().await, "ECHO READY");
}

#[tokio::test]
async fn test_ready_and_unrecognized_lines_reach_coordinator() {
    let coordinator = Arc::new(RecordingCoordinator::default());
    let fixture = Fixture::with_coordinator(coordinator.clone(), SessionSettings::default());
    fixture.preregister("127.0.0.1", "client-1").await;
    let mut agent = fixture.connect(peer(40016));
    agent.handshake("id=node1").await;

    agent.send("ready").await;
    agent.send("SOMETHING ELSE").await;
    agent.send("SERVER-GET-NODE-SSH-CREDENTIALS 10.1.1.1").await;
    assert_eq!(agent.recv().await, "{}");

    assert_eq!(
        coordinator.calls(),
        vec!["register node1", "ready", "input SOMETHING ELSE"]
    );

    agent.hang_up();
    assert_eq!(agent.exit_code().await, EXIT_NORMAL);
    agent.finished().await;
    assert_eq!(coordinator.calls().last().map(String::as_str), Some("unregister"));
}

#[tokio::test]
async fn test_lines_before_greeting_are_still_handled() {
    let coordinator = Arc::new(RecordingCoordinator::default());
    let fixture = Fixture::with_coordinator(coordinator.clone(), SessionSettings::default());
    fixture.preregister("127.0.0.1", "client-1").await;
    let mut agent = fixture.connect(peer(40017));
    assert!(agent.recv().await.ends_with(": START"));

    agent.send("READY").await;
    agent.send("EARLY LINE").await;
    agent.send("-HELLO FROM CLIENT: id=node1").await;
    assert_eq!(agent.recv().await, "SEND-STATS START");

    assert_eq!(
        coordinator.calls(),
        vec!["ready", "input EARLY LINE", "register node1"]
    );
    assert_eq!(agent.session.entry().unwrap().state(), NodeState::Registered);
    assert!(!agent.session.is_closed());
}

fn server_config(dir: &tempfile::TempDir) -> ServerConfig {
    ServerConfig {
        bind_address: "127.0.0.1".into(),
        port: 0,
        key_file: dir.path().join("host_key"),
        resolve_hostname: false,
        heartbeat_enabled: false,
        ..ServerConfig::default()
    }
}

#[tokio::test]
async fn test_reconfiguration_closes_active_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let server = BaguetteServer::builder(server_config(&dir)).build().unwrap();
    server
        .set_topology_configuration(
            TranslationContext::default(),
            BTreeMap::new(),
            "GLOBAL",
            BrokerEndpoint::default(),
        )
        .await
        .unwrap();
    assert!(server.is_server_running());
    assert!(server.local_addr().is_some());

    server
        .register_client(info(json!({"address": "127.0.0.1", "CLIENT_ID": "vm-1"})))
        .await
        .unwrap();
    assert_eq!(server.all_nodes().len(), 1);

    let coordinator: Arc<dyn ServerCoordinator> = server.coordinator().unwrap();
    let fixture = Fixture {
        ctx: SessionContext {
            coordinator,
            registry: Arc::clone(server.registry()),
            sessions: Arc::clone(server.sessions()),
            events: server.events().clone(),
            trust_store: Arc::clone(server.trust_store()),
            settings: SessionSettings::default(),
        },
    };
    let mut agent = fixture.connect(peer(40014));
    agent.handshake("id=vm-1").await;
    assert_eq!(server.active_client_lines().len(), 1);

    server
        .set_topology_configuration(
            TranslationContext::default(),
            BTreeMap::new(),
            "GLOBAL",
            BrokerEndpoint::default(),
        )
        .await
        .unwrap();

    assert_eq!(agent.recv().await, "EXIT Server exits");
    assert_eq!(agent.exit_code().await, EXIT_STOPPED);
    agent.finished().await;
    assert!(server.sessions().is_empty());
    assert!(server.registry().is_empty());
    assert!(server.is_server_running());

    server.stop_server().await;
    assert!(!server.is_server_running());
}

#[tokio::test]
async fn test_recovery_give_up_marks_node_failed() {
    let dir = tempfile::tempdir().unwrap();
    let server = BaguetteServer::builder(server_config(&dir)).build().unwrap();
    server
        .set_topology_configuration(
            TranslationContext::default(),
            BTreeMap::new(),
            "GLOBAL",
            BrokerEndpoint::default(),
        )
        .await
        .unwrap();
    server
        .register_client(info(json!({"address": "127.0.0.1", "CLIENT_ID": "vm-1"})))
        .await
        .unwrap();
    server
        .register_client(info(json!({"address": "10.0.0.9", "CLIENT_ID": "vm-9"})))
        .await
        .unwrap();

    let fixture = Fixture {
        ctx: SessionContext {
            coordinator: server.coordinator().unwrap(),
            registry: Arc::clone(server.registry()),
            sessions: Arc::clone(server.sessions()),
            events: server.events().clone(),
            trust_store: Arc::clone(server.trust_store()),
            settings: SessionSettings::default(),
        },
    };
    let mut events = server.events().subscribe();
    let mut agent = fixture.connect(peer(40018));
    agent.handshake("id=vm-1").await;

    agent.send("-NOTIFY-X:RECOVERY GIVE_UP node-9@10.0.0.9").await;

    let failed = server.registry().get_node_by_address("10.0.0.9").unwrap();
    timeout(WAIT, async {
        while failed.state() != NodeState::NodeFailed {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("node was not marked as failed");

    let sender = failed.registration().get("sender").cloned().unwrap();
    assert_eq!(sender, format!("Client_{}", agent.session.id()));

    let mut give_up = None;
    while let Ok(event) = events.try_recv() {
        if let ServerEvent::SelfHealingGiveUp { address, .. } = event {
            give_up = Some(address);
        }
    }
    assert_eq!(give_up.as_deref(), Some("10.0.0.9"));
    // The reporting node is untouched
    assert_eq!(agent.session.entry().unwrap().state(), NodeState::Registered);

    server.stop_server().await;
}
