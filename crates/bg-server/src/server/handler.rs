//! SSH connection handler
//!
//! Authenticates agents by password and bridges their shell channel to a
//! [`ClientSession`]: channel data is written into an in-memory pipe the
//! session reads lines from, and a pump task writes the session's outbound
//! lines back to the channel. When the session's exit callback fires the pump
//! flushes what is queued, sends the exit status and closes the channel.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use russh::server::{Auth, Handle, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, oneshot};

use bg_protocol::SessionId;

use crate::auth::{mask_secret, Credentials};
use crate::session::{ClientSession, ExitHook, SessionContext, EXIT_NORMAL};

/// Bytes buffered between the channel and the session reader
const INPUT_BUFFER_SIZE: usize = 64 * 1024;

/// Handler for a single agent SSH connection
pub struct AgentHandler {
    ctx: SessionContext,
    credentials: Arc<Credentials>,
    peer: SocketAddr,
    /// The one shell channel this connection may open
    channel: Option<ChannelId>,
    /// Session handle for sending data (captured when the channel opens)
    handle: Option<Handle>,
    /// Write side of the pipe the session reads from
    input: Option<DuplexStream>,
    session: Option<Arc<ClientSession>>,
}

impl AgentHandler {
    pub fn new(ctx: SessionContext, credentials: Arc<Credentials>, peer: SocketAddr) -> Self {
        Self {
            ctx,
            credentials,
            peer,
            channel: None,
            handle: None,
            input: None,
            session: None,
        }
    }

    /// Start the protocol session on `channel`
    fn start_session(&mut self, channel: ChannelId) {
        let Some(handle) = self.handle.clone() else {
            tracing::error!("No session handle available for {}", self.peer);
            return;
        };

        let (reader, writer) = tokio::io::duplex(INPUT_BUFFER_SIZE);
        let (exit_tx, exit_rx) = oneshot::channel();
        let exit = ExitHook::new(Box::new(move |code| {
            let _ = exit_tx.send(code);
        }));

        let (session, outbound) = ClientSession::new(self.ctx.clone(), self.peer, exit);
        let id = session.id();
        self.input = Some(writer);
        self.session = Some(Arc::clone(&session));

        tokio::spawn(pump(handle, channel, id, outbound, exit_rx));
        tokio::spawn(session.run(reader));
    }

    fn close_input(&mut self) {
        if self.input.take().is_some() {
            tracing::debug!("Input closed for {}", self.peer);
        }
    }
}

/// Write outbound lines to the channel until the session exits, then close it
async fn pump(
    handle: Handle,
    channel: ChannelId,
    id: SessionId,
    mut outbound: mpsc::UnboundedReceiver<String>,
    mut exit: oneshot::Receiver<i32>,
) {
    let mut connected = true;
    let code = loop {
        tokio::select! {
            biased;

            line = outbound.recv() => match line {
                Some(line) => {
                    if connected && !write_line(&handle, channel, &line).await {
                        tracing::debug!("{}==> Channel gone, dropping output", id);
                        connected = false;
                    }
                }
                None => break (&mut exit).await.unwrap_or(EXIT_NORMAL),
            },
            code = &mut exit => break code.unwrap_or(EXIT_NORMAL),
        }
    };

    // Lines queued before the exit still go out.
    while let Ok(line) = outbound.try_recv() {
        if !connected || !write_line(&handle, channel, &line).await {
            connected = false;
            break;
        }
    }

    if connected {
        let _ = handle.exit_status_request(channel, code as u32).await;
        let _ = handle.eof(channel).await;
        let _ = handle.close(channel).await;
    }
    tracing::debug!("{}==> Channel closed with exit status {}", id, code);
}

async fn write_line(handle: &Handle, channel: ChannelId, line: &str) -> bool {
    let mut data = Vec::with_capacity(line.len() + 1);
    data.extend_from_slice(line.as_bytes());
    data.push(b'\n');
    handle.data(channel, CryptoVec::from_slice(&data)).await.is_ok()
}

#[async_trait]
impl Handler for AgentHandler {
    type Error = anyhow::Error;

    /// Agents log in with a username and password from the credential store
    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if self.credentials.authenticate(user, password) {
            tracing::info!("Authenticated {} from {}", user, self.peer);
            return Ok(Auth::Accept);
        }

        tracing::warn!(
            "Authentication REJECTED for {} from {} (password {})",
            user,
            self.peer,
            mask_secret(password)
        );
        Ok(Auth::Reject {
            proceed_with_methods: None,
        })
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if self.channel.is_some() {
            tracing::warn!("Refusing second channel from {}", self.peer);
            return Ok(false);
        }
        tracing::debug!("Channel opened: {:?}", channel.id());
        self.channel = Some(channel.id());
        self.handle = Some(session.handle());
        Ok(true)
    }

    async fn shell_request(&mut self, channel: ChannelId, session: &mut Session) -> Result<(), Self::Error> {
        if self.channel != Some(channel) || self.session.is_some() {
            tracing::warn!("Unexpected shell request from {} on {:?}", self.peer, channel);
            session.channel_failure(channel);
            return Ok(());
        }
        session.channel_success(channel);
        self.start_session(channel);
        Ok(())
    }

    async fn data(&mut self, channel: ChannelId, data: &[u8], _session: &mut Session) -> Result<(), Self::Error> {
        if self.channel != Some(channel) {
            return Ok(());
        }
        tracing::trace!("Received {} bytes on channel {:?}", data.len(), channel);

        let Some(input) = self.input.as_mut() else {
            return Ok(());
        };
        if let Err(e) = input.write_all(data).await {
            // The session has stopped reading.
            tracing::debug!("Dropping input from {}: {}", self.peer, e);
            self.close_input();
        }
        Ok(())
    }

    async fn channel_eof(&mut self, channel: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
        tracing::debug!("Channel EOF: {:?}", channel);
        self.close_input();
        Ok(())
    }

    async fn channel_close(&mut self, channel: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
        tracing::debug!("Channel closed: {:?}", channel);
        self.close_input();
        if self.channel == Some(channel) {
            self.channel = None;
        }
        Ok(())
    }
}

impl Drop for AgentHandler {
    fn drop(&mut self) {
        if let Some(session) = &self.session {
            tracing::debug!("{}--> Connection from {} dropped", session.id(), self.peer);
        }
    }
}

/// russh configuration for the agent listener
#[derive(Clone)]
pub struct SshConfig {
    pub ssh_config: Arc<russh::server::Config>,
}

impl SshConfig {
    /// Create a configuration serving the given host key
    pub fn new(host_key: russh_keys::key::KeyPair) -> Self {
        let mut config = russh::server::Config::default();
        config.keys.push(host_key);
        config.auth_rejection_time = std::time::Duration::from_secs(1);
        config.auth_rejection_time_initial = Some(std::time::Duration::from_secs(0));

        Self {
            ssh_config: Arc::new(config),
        }
    }
}
