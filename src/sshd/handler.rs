//! Per-connection SSH handler.
//!
//! Authenticates the handshake through the [`Authenticator`], then
//! routes every accepted `session` channel to either the proxy bridge
//! or the sandbox forwarder according to the authorization token.
//! Channel requests are whitelisted here: `env`, `x11-req` and
//! `subsystem` are refused on the proxy path because they could
//! escape the sudo boundary on the far side.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, info, warn};
use russh::keys::HashAlg;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, Sig};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::auth::{AccessMode, AuthToken, Authenticator};
use crate::configuration::Config;
use crate::error_handling::types::SshdError;
use crate::proxy::forwarder::{connect_outbound, OutboundHandler, ProxyCommand, ProxyForwarder};
use crate::recorder::ReplayWriter;
use crate::sandbox::forwarder::{run_attach, ChannelState};
use crate::sandbox::scripts::{seed_ssh_config, SshEntry};
use crate::sandbox::{Pty, Sandbox, SandboxManager, Window};
use crate::store::Store;

/// State shared by every connection of one listener.
pub struct SshdState {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub authenticator: Authenticator,
    pub sandbox_manager: SandboxManager,
    pub client_key: Arc<russh::keys::PrivateKey>,
}

/// Where an accepted channel's traffic goes.
enum ChannelBridge {
    Proxy {
        cmd_tx: mpsc::Sender<ProxyCommand>,
    },
    Sandbox(Box<SandboxChannel>),
}

struct SandboxChannel {
    state: ChannelState,
    recorder: Arc<ReplayWriter>,
    session_id: i64,
    window_tx: Option<watch::Sender<Window>>,
    window_rx: Option<watch::Receiver<Window>>,
    stdin_tx: Option<mpsc::Sender<Vec<u8>>>,
}

pub struct ConnectionHandler {
    state: Arc<SshdState>,
    conn_id: Uuid,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    token: Option<AuthToken>,
    outbound: Option<russh::client::Handle<OutboundHandler>>,
    sandbox: Option<Sandbox>,
    channels: HashMap<ChannelId, ChannelBridge>,
}

impl ConnectionHandler {
    pub fn new(state: Arc<SshdState>, peer_addr: SocketAddr, local_addr: SocketAddr) -> Self {
        let conn_id = Uuid::new_v4();
        debug!("[{}] new connection from {}", conn_id, peer_addr);
        Self {
            state,
            conn_id,
            peer_addr,
            local_addr,
            token: None,
            outbound: None,
            sandbox: None,
            channels: HashMap::new(),
        }
    }

    /// Opens (once per connection) the outbound client session for
    /// proxy mode.
    async fn ensure_outbound(&mut self, target_address: &str) -> Result<(), SshdError> {
        if self.outbound.is_none() {
            let handle =
                connect_outbound(target_address, self.state.client_key.clone()).await?;
            info!(
                "[{}] outbound connection to {} established",
                self.conn_id, target_address
            );
            self.outbound = Some(handle);
        }
        Ok(())
    }

    /// Ensures the operator's sandbox exists and performs the
    /// per-connection duties: ingest the sandbox public key as a
    /// sandbox-origin key and reseed `/root/.ssh/config` from the
    /// current grants. Both are best-effort.
    async fn ensure_sandbox(&mut self, account: &str) -> Result<Sandbox, SshdError> {
        if let Some(sandbox) = &self.sandbox {
            return Ok(sandbox.clone());
        }
        let sandbox = self.state.sandbox_manager.find_or_create(account).await?;
        if let Err(e) = self.register_sandbox_key(&sandbox, account).await {
            warn!(
                "[{}] failed to register sandbox key for {}: {}",
                self.conn_id, account, e
            );
        }
        if let Err(e) = self.seed_sandbox_ssh_config(&sandbox, account).await {
            warn!(
                "[{}] failed to seed sandbox ssh config for {}: {}",
                self.conn_id, account, e
            );
        }
        self.sandbox = Some(sandbox.clone());
        Ok(sandbox)
    }

    async fn register_sandbox_key(
        &self,
        sandbox: &Sandbox,
        account: &str,
    ) -> Result<(), SshdError> {
        let raw = sandbox.get_ssh_public_key().await?;
        let key = russh::keys::PublicKey::from_openssh(&raw)
            .map_err(|e| SshdError::KeyError(e.to_string()))?;
        let fingerprint = key.fingerprint(HashAlg::Sha256).to_string();
        self.state
            .store
            .upsert_sandbox_key(&fingerprint, account)
            .await?;
        Ok(())
    }

    async fn seed_sandbox_ssh_config(
        &self,
        sandbox: &Sandbox,
        account: &str,
    ) -> Result<(), SshdError> {
        let user = self
            .state
            .store
            .find_user_by_account(account)
            .await?
            .ok_or_else(|| {
                SshdError::KeyError(format!("user {:?} vanished during dispatch", account))
            })?;
        let grants = self.state.store.combined_grants(user.id).await?;
        let entries: Vec<SshEntry> = grants
            .iter()
            .map(|g| SshEntry {
                name: format!("{}-{}", g.server_name, g.target_account),
                host: self.state.config.sandbox.host.clone(),
                port: self.state.config.sshd.port,
                user: format!("{}@{}", g.target_account, g.server_name),
            })
            .collect();
        sandbox.exec_script(&seed_ssh_config(&entries)).await?;
        Ok(())
    }

    fn replay_path(&self, replay_file: &str) -> std::path::PathBuf {
        self.state.config.sshd.replay_dir.join(replay_file)
    }

    /// Commits a sandbox channel on its first shell/exec and launches
    /// the container attach.
    fn sandbox_commit(
        &mut self,
        channel_id: ChannelId,
        command: String,
        session: &mut Session,
    ) -> Result<(), SshdError> {
        let sandbox = match self.sandbox.clone() {
            Some(s) => s,
            None => {
                let _ = session.channel_failure(channel_id);
                return Ok(());
            }
        };
        let Some(ChannelBridge::Sandbox(sc)) = self.channels.get_mut(&channel_id) else {
            let _ = session.channel_failure(channel_id);
            return Ok(());
        };
        match sc.state.commit(command) {
            Some(spec) => {
                let _ = session.channel_success(channel_id);
                let (stdin_tx, stdin_rx) = mpsc::channel(64);
                sc.stdin_tx = Some(stdin_tx);
                let window_rx = sc.window_rx.take();
                tokio::spawn(run_attach(
                    sandbox,
                    spec,
                    window_rx,
                    stdin_rx,
                    sc.recorder.clone(),
                    session.handle(),
                    channel_id,
                    self.state.store.clone(),
                    sc.session_id,
                    self.conn_id,
                ));
            }
            None => {
                let _ = session.channel_failure(channel_id);
            }
        }
        Ok(())
    }
}

impl Handler for ConnectionHandler {
    type Error = SshdError;

    async fn auth_publickey_offered(
        &mut self,
        _user: &str,
        _public_key: &russh::keys::PublicKey,
    ) -> Result<Auth, Self::Error> {
        // decide only once the client has proven key ownership
        Ok(Auth::Accept)
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &russh::keys::PublicKey,
    ) -> Result<Auth, Self::Error> {
        let fingerprint = public_key.fingerprint(HashAlg::Sha256).to_string();
        match self
            .state
            .authenticator
            .authorize(user, self.local_addr, &fingerprint)
            .await
        {
            Ok(token) => {
                info!(
                    "[{}] accepted {} from {} ({:?})",
                    self.conn_id, token.account, self.peer_addr, token.mode
                );
                self.token = Some(token);
                Ok(Auth::Accept)
            }
            Err(reason) => {
                warn!(
                    "[{}] rejected {:?} from {}: {}",
                    self.conn_id, user, self.peer_addr, reason
                );
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                    partial_success: false,
                })
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let token = match self.token.clone() {
            Some(t) => t,
            None => return Ok(false),
        };
        match token.mode {
            AccessMode::Proxy {
                target_account,
                target_address,
            } => {
                if let Err(e) = self.ensure_outbound(&target_address).await {
                    warn!(
                        "[{}] outbound dial to {} failed: {}",
                        self.conn_id, target_address, e
                    );
                    return Ok(false);
                }
                let out_channel = match self
                    .outbound
                    .as_mut()
                    .unwrap()
                    .channel_open_session()
                    .await
                {
                    Ok(c) => c,
                    Err(e) => {
                        warn!("[{}] outbound channel open failed: {}", self.conn_id, e);
                        return Ok(false);
                    }
                };
                let record = match self.state.store.create_session(&token.account).await {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("[{}] session record creation failed: {}", self.conn_id, e);
                        return Ok(false);
                    }
                };
                let recorder =
                    Arc::new(ReplayWriter::new(self.replay_path(&record.replay_file)));
                let cmd_tx = ProxyForwarder::spawn(
                    out_channel,
                    session.handle(),
                    channel.id(),
                    target_account,
                    recorder,
                    self.state.store.clone(),
                    record.id,
                    self.conn_id,
                );
                self.channels
                    .insert(channel.id(), ChannelBridge::Proxy { cmd_tx });
                Ok(true)
            }
            AccessMode::Sandbox => {
                if let Err(e) = self.ensure_sandbox(&token.account).await {
                    warn!(
                        "[{}] sandbox unavailable for {}: {}",
                        self.conn_id, token.account, e
                    );
                    return Ok(false);
                }
                let record = match self.state.store.create_session(&token.account).await {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("[{}] session record creation failed: {}", self.conn_id, e);
                        return Ok(false);
                    }
                };
                let recorder =
                    Arc::new(ReplayWriter::new(self.replay_path(&record.replay_file)));
                self.channels.insert(
                    channel.id(),
                    ChannelBridge::Sandbox(Box::new(SandboxChannel {
                        state: ChannelState::new(),
                        recorder,
                        session_id: record.id,
                        window_tx: None,
                        window_rx: None,
                        stdin_tx: None,
                    })),
                );
                Ok(true)
            }
        }
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        _host_to_connect: &str,
        _port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        // port forwarding is policy-forbidden
        Ok(false)
    }

    async fn data(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        match self.channels.get(&channel_id) {
            Some(ChannelBridge::Proxy { cmd_tx }) => {
                let _ = cmd_tx.send(ProxyCommand::Data(data.to_vec())).await;
            }
            Some(ChannelBridge::Sandbox(sc)) => {
                if let Some(stdin_tx) = &sc.stdin_tx {
                    let _ = stdin_tx.send(data.to_vec()).await;
                } else {
                    debug!(
                        "[{}] dropping {} bytes before sandbox launch",
                        self.conn_id,
                        data.len()
                    );
                }
            }
            None => {}
        }
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).into_owned();
        match self.channels.get(&channel_id) {
            Some(ChannelBridge::Proxy { cmd_tx }) => {
                if cmd_tx.send(ProxyCommand::Exec { command }).await.is_ok() {
                    let _ = session.channel_success(channel_id);
                } else {
                    let _ = session.channel_failure(channel_id);
                }
                Ok(())
            }
            Some(ChannelBridge::Sandbox(_)) => self.sandbox_commit(channel_id, command, session),
            None => {
                let _ = session.channel_failure(channel_id);
                Ok(())
            }
        }
    }

    async fn shell_request(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        match self.channels.get(&channel_id) {
            Some(ChannelBridge::Proxy { cmd_tx }) => {
                if cmd_tx.send(ProxyCommand::Shell).await.is_ok() {
                    let _ = session.channel_success(channel_id);
                } else {
                    let _ = session.channel_failure(channel_id);
                }
                Ok(())
            }
            Some(ChannelBridge::Sandbox(_)) => {
                self.sandbox_commit(channel_id, String::new(), session)
            }
            None => {
                let _ = session.channel_failure(channel_id);
                Ok(())
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel_id: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        match self.channels.get_mut(&channel_id) {
            Some(ChannelBridge::Proxy { cmd_tx }) => {
                let forwarded = cmd_tx
                    .send(ProxyCommand::PtyRequest {
                        term: term.to_string(),
                        col_width,
                        row_height,
                        pix_width,
                        pix_height,
                        modes: modes.to_vec(),
                    })
                    .await
                    .is_ok();
                if forwarded {
                    let _ = session.channel_success(channel_id);
                } else {
                    let _ = session.channel_failure(channel_id);
                }
            }
            Some(ChannelBridge::Sandbox(sc)) => {
                let window = Window {
                    width: col_width,
                    height: row_height,
                };
                let accepted = col_width > 0
                    && row_height > 0
                    && sc.state.set_pty(Pty {
                        term: term.to_string(),
                        window,
                    });
                if accepted {
                    let (tx, rx) = watch::channel(window);
                    sc.window_tx = Some(tx);
                    sc.window_rx = Some(rx);
                    let _ = session.channel_success(channel_id);
                } else {
                    let _ = session.channel_failure(channel_id);
                }
            }
            None => {
                let _ = session.channel_failure(channel_id);
            }
        }
        Ok(())
    }

    // window-change is fire-and-forget on the wire: apply or drop,
    // never reply
    async fn window_change_request(
        &mut self,
        channel_id: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        match self.channels.get_mut(&channel_id) {
            Some(ChannelBridge::Proxy { cmd_tx }) => {
                if cmd_tx
                    .send(ProxyCommand::WindowChange {
                        col_width,
                        row_height,
                        pix_width,
                        pix_height,
                    })
                    .await
                    .is_err()
                {
                    debug!(
                        "[{}] dropping window-change, proxy bridge is gone",
                        self.conn_id
                    );
                }
            }
            Some(ChannelBridge::Sandbox(sc)) => {
                let window = Window {
                    width: col_width,
                    height: row_height,
                };
                if col_width > 0 && row_height > 0 && sc.state.window_change(window) {
                    if let Some(tx) = &sc.window_tx {
                        // size-1 slot with last-writer-wins semantics
                        let _ = tx.send(window);
                    }
                    sc.recorder.write_window_size(col_width, row_height);
                }
            }
            None => {}
        }
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel_id: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        match self.channels.get_mut(&channel_id) {
            // env never crosses the sudo boundary on the proxy path
            Some(ChannelBridge::Proxy { .. }) => {
                let _ = session.channel_failure(channel_id);
            }
            Some(ChannelBridge::Sandbox(sc)) => {
                if sc.state.push_env(variable_name, variable_value) {
                    let _ = session.channel_success(channel_id);
                } else {
                    let _ = session.channel_failure(channel_id);
                }
            }
            None => {
                let _ = session.channel_failure(channel_id);
            }
        }
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("[{}] refusing subsystem {:?}", self.conn_id, name);
        let _ = session.channel_failure(channel_id);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn x11_request(
        &mut self,
        channel_id: ChannelId,
        _single_connection: bool,
        _x11_auth_protocol: &str,
        _x11_auth_cookie: &str,
        _x11_screen_number: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = session.channel_failure(channel_id);
        Ok(())
    }

    async fn signal(
        &mut self,
        channel_id: ChannelId,
        signal: Sig,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(ChannelBridge::Proxy { cmd_tx }) = self.channels.get(&channel_id) {
            let _ = cmd_tx.send(ProxyCommand::Signal(signal)).await;
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel_id: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        match self.channels.get_mut(&channel_id) {
            Some(ChannelBridge::Proxy { cmd_tx }) => {
                let _ = cmd_tx.send(ProxyCommand::Eof).await;
            }
            Some(ChannelBridge::Sandbox(sc)) => {
                // dropping the sender closes the container's stdin
                sc.stdin_tx = None;
            }
            None => {}
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel_id: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(ChannelBridge::Proxy { cmd_tx }) = self.channels.remove(&channel_id) {
            let _ = cmd_tx.send(ProxyCommand::Close).await;
        }
        Ok(())
    }
}
