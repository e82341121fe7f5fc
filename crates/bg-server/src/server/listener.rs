//! Agent SSH listener
//!
//! Accepts incoming connections and spawns a handler for each one. While
//! running it also owns the application heartbeat and the coordinator's
//! started state.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use russh_keys::key::KeyPair;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use bg_core::config::ServerConfig;
use bg_core::time::current_time_millis;
use bg_protocol::ServerCommand;

use crate::auth::Credentials;
use crate::server::handler::{AgentHandler, SshConfig};
use crate::session::SessionContext;

/// How long `stop` waits for stopped sessions to wind down
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// A running agent listener
pub struct Sshd {
    local_addr: SocketAddr,
    fingerprint: String,
    ctx: SessionContext,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Sshd {
    /// Bind the listener, start accepting and start the coordinator
    pub async fn start(config: &ServerConfig, ctx: SessionContext, credentials: Arc<Credentials>) -> Result<Self> {
        let host_key = load_or_generate_host_key(&config.key_file).await?;
        let fingerprint = host_key
            .clone_public_key()
            .map(|key| key.fingerprint())
            .context("Failed to read host public key")?;
        let ssh_config = SshConfig::new(host_key);

        let bind_addr = config.listen_address();
        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", bind_addr))?;
        let local_addr = listener.local_addr()?;
        tracing::info!("SSH server listening on {} (host key {})", local_addr, fingerprint);

        let cancel = CancellationToken::new();
        let mut tasks = vec![tokio::spawn(accept_loop(
            listener,
            ssh_config,
            ctx.clone(),
            credentials,
            cancel.clone(),
        ))];
        if config.heartbeat_enabled {
            tasks.push(tokio::spawn(heartbeat(
                ctx.clone(),
                config.heartbeat_period,
                cancel.clone(),
            )));
        }

        ctx.coordinator.start();

        Ok(Self {
            local_addr,
            fingerprint,
            ctx,
            cancel,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Fingerprint of the host key agents should expect
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Stop the coordinator, tell every agent to exit and stop listening
    pub async fn stop(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        tracing::info!("SSH server on {} stopping", self.local_addr);
        self.ctx.coordinator.stop();

        for session in self.ctx.sessions.list() {
            session.stop("Server exits");
        }
        let waited = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while !self.ctx.sessions.is_empty() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        if waited.is_err() {
            tracing::warn!("{} session(s) still active at shutdown", self.ctx.sessions.len());
        }

        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("Listener task failed: {}", e);
            }
        }
        tracing::info!("SSH server on {} stopped", self.local_addr);
    }
}

impl std::fmt::Debug for Sshd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sshd")
            .field("local_addr", &self.local_addr)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

async fn accept_loop(
    listener: TcpListener,
    ssh_config: SshConfig,
    ctx: SessionContext,
    credentials: Arc<Credentials>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("SSH server shutting down");
                break;
            }

            result = listener.accept() => {
                match result {
                    Ok((socket, peer_addr)) => {
                        handle_connection(socket, peer_addr, &ssh_config, &ctx, &credentials, &cancel);
                    }
                    Err(e) => {
                        tracing::error!("Failed to accept connection: {}", e);
                    }
                }
            }
        }
    }
}

fn handle_connection(
    socket: TcpStream,
    peer_addr: SocketAddr,
    ssh_config: &SshConfig,
    ctx: &SessionContext,
    credentials: &Arc<Credentials>,
    cancel: &CancellationToken,
) {
    tracing::info!("New connection from {}", peer_addr);

    let config = Arc::clone(&ssh_config.ssh_config);
    let handler = AgentHandler::new(ctx.clone(), Arc::clone(credentials), peer_addr);
    let cancel = cancel.clone();

    tokio::spawn(async move {
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("Connection handler cancelled for {}", peer_addr);
                return;
            }
            result = run_connection(config, socket, handler) => result
        };

        match result {
            Ok(()) => tracing::info!("Connection from {} closed normally", peer_addr),
            Err(e) => tracing::warn!("Connection from {} closed with error: {}", peer_addr, e),
        }
    });
}

async fn run_connection(
    config: Arc<russh::server::Config>,
    socket: TcpStream,
    handler: AgentHandler,
) -> Result<()> {
    let running = russh::server::run_stream(config, socket, handler).await?;
    running.await?;
    Ok(())
}

/// Send `Heartbeat <millis>` to every active session each period
async fn heartbeat(ctx: SessionContext, period: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let command = ServerCommand::Heartbeat(current_time_millis());
                for session in ctx.sessions.list() {
                    if let Err(e) = session.send_command(&command) {
                        tracing::debug!("{}==> Heartbeat not sent: {}", session.id(), e);
                    }
                }
            }
        }
    }
}

/// Load the host key, or generate and persist a new Ed25519 key
pub async fn load_or_generate_host_key(path: &Path) -> Result<KeyPair> {
    if path.exists() {
        tracing::info!("Loading host key from {:?}", path);
        let key = russh_keys::load_secret_key(path, None)
            .with_context(|| format!("Failed to load host key from {:?}", path))?;
        return Ok(key);
    }

    tracing::info!("Generating new host key at {:?}", path);
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory {:?}", parent))?;
    }

    let key = KeyPair::generate_ed25519().ok_or_else(|| anyhow::anyhow!("Failed to generate Ed25519 key"))?;

    let mut pem = Vec::new();
    russh_keys::encode_pkcs8_pem(&key, &mut pem).context("Failed to encode host key")?;
    tokio::fs::write(path, &pem)
        .await
        .with_context(|| format!("Failed to write host key to {:?}", path))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .await
            .with_context(|| format!("Failed to restrict permissions of {:?}", path))?;
    }

    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_host_key_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("host_key");

        let generated = load_or_generate_host_key(&path).await.unwrap();
        assert!(path.exists());

        let loaded = load_or_generate_host_key(&path).await.unwrap();
        assert_eq!(
            generated.clone_public_key().unwrap().fingerprint(),
            loaded.clone_public_key().unwrap().fingerprint()
        );
    }
}
