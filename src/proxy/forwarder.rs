//! Per-channel bridge between an accepted inbound session channel and
//! a freshly opened channel on the outbound SSH client connection.
//!
//! The inbound side (the russh server handler) feeds rewritten
//! requests and stdin bytes through a command channel; the forwarder
//! task owns the outbound channel, pumps its data/stderr/exit-status
//! back through the server handle, and tees stdout/stderr into the
//! session recorder. Either side closing tears the bridge down, which
//! closes the inbound channel, closes the recorder exactly once and
//! stamps the session row.

use std::sync::Arc;

use log::{debug, warn};
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg};
use russh::server::Handle as ServerHandle;
use russh::{client, ChannelId, ChannelMsg, CryptoVec, Pty, Sig};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error_handling::types::SshdError;
use crate::proxy::rewrite::modify_command;
use crate::recorder::ReplayWriter;
use crate::store::Store;

/// Requests and bytes travelling from the inbound channel to the
/// outbound one. Policy-forbidden request types never become
/// commands; the handler refuses them before this point.
#[derive(Debug)]
pub enum ProxyCommand {
    Data(Vec<u8>),
    Eof,
    Exec {
        command: String,
    },
    Shell,
    PtyRequest {
        term: String,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: Vec<(Pty, u32)>,
    },
    WindowChange {
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    },
    Signal(Sig),
    Close,
}

/// Accepts any host key: the bastion's trust boundary is the grant
/// table, not TOFU on the far side.
pub struct OutboundHandler;

impl client::Handler for OutboundHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Opens the outbound SSH connection to `target_address` as the fixed
/// system account `root` using the bastion-wide client signer.
pub async fn connect_outbound(
    target_address: &str,
    client_key: Arc<PrivateKey>,
) -> Result<client::Handle<OutboundHandler>, SshdError> {
    let config = Arc::new(client::Config::default());
    let mut handle = client::connect(config, target_address, OutboundHandler).await?;
    let auth = handle
        .authenticate_publickey("root", PrivateKeyWithHashAlg::new(client_key, None))
        .await?;
    match auth {
        client::AuthResult::Success => Ok(handle),
        client::AuthResult::Failure { .. } => Err(SshdError::KeyError(format!(
            "outbound authentication to {} was denied",
            target_address
        ))),
    }
}

pub struct ProxyForwarder {
    outbound: russh::Channel<client::Msg>,
    inbound: ServerHandle,
    inbound_id: ChannelId,
    target_account: String,
    recorder: Arc<ReplayWriter>,
    store: Arc<dyn Store>,
    session_id: i64,
    conn_id: Uuid,
}

impl ProxyForwarder {
    /// Spawns the bridge task and returns the command sender the
    /// handler feeds. Dropping the sender closes the bridge.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        outbound: russh::Channel<client::Msg>,
        inbound: ServerHandle,
        inbound_id: ChannelId,
        target_account: String,
        recorder: Arc<ReplayWriter>,
        store: Arc<dyn Store>,
        session_id: i64,
        conn_id: Uuid,
    ) -> mpsc::Sender<ProxyCommand> {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let forwarder = Self {
            outbound,
            inbound,
            inbound_id,
            target_account,
            recorder,
            store,
            session_id,
            conn_id,
        };
        tokio::spawn(forwarder.run(cmd_rx));
        cmd_tx
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<ProxyCommand>) {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let done = match cmd {
                        Some(cmd) => self.handle_command(cmd).await,
                        None => true,
                    };
                    if done {
                        break;
                    }
                }
                msg = self.outbound.wait() => {
                    let done = match msg {
                        Some(msg) => self.handle_outbound(msg).await,
                        None => true,
                    };
                    if done {
                        break;
                    }
                }
            }
        }

        let _ = self.inbound.close(self.inbound_id).await;
        self.recorder.close();
        if let Err(e) = self
            .store
            .update_session_closed(self.session_id, self.recorder.is_activated())
            .await
        {
            warn!("[{}] failed to stamp session end: {}", self.conn_id, e);
        }
        debug!("[{}] proxy channel bridge finished", self.conn_id);
    }

    /// Applies one inbound command to the outbound channel. Returns
    /// true when the bridge should tear down.
    async fn handle_command(&mut self, cmd: ProxyCommand) -> bool {
        match cmd {
            ProxyCommand::Data(data) => self.outbound.data(&data[..]).await.is_err(),
            ProxyCommand::Eof => {
                // half-close only; stdout may still be streaming back
                let _ = self.outbound.eof().await;
                false
            }
            ProxyCommand::Exec { command } => {
                if let Err(e) = self
                    .store
                    .update_session_command(self.session_id, &command)
                    .await
                {
                    warn!("[{}] failed to stamp session command: {}", self.conn_id, e);
                }
                let rewritten = modify_command(&self.target_account, &command);
                self.outbound.exec(true, rewritten).await.is_err()
            }
            ProxyCommand::Shell => {
                let rewritten = modify_command(&self.target_account, "");
                self.outbound.exec(true, rewritten).await.is_err()
            }
            ProxyCommand::PtyRequest {
                term,
                col_width,
                row_height,
                pix_width,
                pix_height,
                modes,
            } => {
                let failed = self
                    .outbound
                    .request_pty(
                        true,
                        &term,
                        col_width,
                        row_height,
                        pix_width,
                        pix_height,
                        &modes,
                    )
                    .await
                    .is_err();
                if !failed {
                    self.recorder.activate();
                    if col_width > 0 && row_height > 0 {
                        self.recorder.write_window_size(col_width, row_height);
                    }
                }
                failed
            }
            ProxyCommand::WindowChange {
                col_width,
                row_height,
                pix_width,
                pix_height,
            } => {
                let _ = self
                    .outbound
                    .window_change(col_width, row_height, pix_width, pix_height)
                    .await;
                self.recorder.write_window_size(col_width, row_height);
                false
            }
            ProxyCommand::Signal(sig) => {
                let _ = self.outbound.signal(sig).await;
                false
            }
            ProxyCommand::Close => true,
        }
    }

    /// Relays one outbound channel message back to the client.
    /// Returns true when the bridge should tear down.
    async fn handle_outbound(&mut self, msg: ChannelMsg) -> bool {
        match msg {
            ChannelMsg::Data { data } => {
                self.recorder.write_stdout(&data);
                self.inbound
                    .data(self.inbound_id, CryptoVec::from_slice(&data))
                    .await
                    .is_err()
            }
            ChannelMsg::ExtendedData { data, ext } if ext == 1 => {
                self.recorder.write_stderr(&data);
                self.inbound
                    .extended_data(self.inbound_id, 1, CryptoVec::from_slice(&data))
                    .await
                    .is_err()
            }
            ChannelMsg::ExitStatus { exit_status } => {
                let _ = self
                    .inbound
                    .exit_status_request(self.inbound_id, exit_status)
                    .await;
                false
            }
            ChannelMsg::Eof => {
                let _ = self.inbound.eof(self.inbound_id).await;
                false
            }
            ChannelMsg::Close => true,
            other => {
                debug!("[{}] ignoring outbound message {:?}", self.conn_id, other);
                false
            }
        }
    }
}
