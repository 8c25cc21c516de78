//! Per-channel sandbox bridge.
//!
//! A sandbox channel accumulates `env`, an optional `pty-req` and
//! window updates until the first `shell` or `exec` commits the state
//! and launches exactly one attach into the operator's container.
//! The accumulation is a small state record with pure transition
//! functions; the handler drives it and refuses whatever the
//! transitions reject.

use std::sync::Arc;

use log::{debug, warn};
use russh::server::Handle as ServerHandle;
use russh::{ChannelId, CryptoVec};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::proxy::rewrite::{should_record, tokenize_command};
use crate::recorder::ReplayWriter;
use crate::sandbox::container::Sandbox;
use crate::sandbox::types::{ExecAttachOptions, OutputChunk, Pty, Window};
use crate::store::Store;

/// Request-stream state of one sandbox channel before commit.
#[derive(Debug, Default)]
pub struct ChannelState {
    env: Vec<String>,
    pty: Option<Pty>,
    handled: bool,
}

/// Everything a committed channel needs to launch its attach.
#[derive(Debug, PartialEq)]
pub struct LaunchSpec {
    pub env: Vec<String>,
    pub pty: Option<Pty>,
    pub tokens: Vec<String>,
    pub record: bool,
    pub command: String,
}

impl ChannelState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulates one `env` request. Refused after commit.
    pub fn push_env(&mut self, name: &str, value: &str) -> bool {
        if self.handled {
            return false;
        }
        self.env.push(format!("{}={}", name, value));
        true
    }

    /// Records the pty negotiation. Refused after commit or when a
    /// pty was already negotiated.
    pub fn set_pty(&mut self, pty: Pty) -> bool {
        if self.handled || self.pty.is_some() {
            return false;
        }
        self.pty = Some(pty);
        true
    }

    /// Applies a window update. Refused without a prior `pty-req`;
    /// accepted both before and after commit.
    pub fn window_change(&mut self, window: Window) -> bool {
        match self.pty.as_mut() {
            Some(pty) => {
                pty.window = window;
                true
            }
            None => false,
        }
    }

    /// Commits the channel on its first `shell`/`exec`. Returns
    /// `None` once a launch already happened; later attempts must be
    /// refused.
    pub fn commit(&mut self, command: String) -> Option<LaunchSpec> {
        if self.handled {
            return None;
        }
        self.handled = true;
        let tokens = tokenize_command(&command);
        let record = should_record(&tokens);
        Some(LaunchSpec {
            env: std::mem::take(&mut self.env),
            pty: self.pty.clone(),
            tokens,
            record,
            command,
        })
    }

    pub fn is_handled(&self) -> bool {
        self.handled
    }
}

/// Runs one committed attach to completion: arms the recorder, pumps
/// container output back to the client (teeing into the recorder),
/// then signals `exit-status` (0 on success, 1 on any error) and
/// closes the channel.
#[allow(clippy::too_many_arguments)]
pub async fn run_attach(
    sandbox: Sandbox,
    spec: LaunchSpec,
    window_rx: Option<watch::Receiver<Window>>,
    stdin_rx: mpsc::Receiver<Vec<u8>>,
    recorder: Arc<ReplayWriter>,
    handle: ServerHandle,
    channel_id: ChannelId,
    store: Arc<dyn Store>,
    session_id: i64,
    conn_id: Uuid,
) {
    if let Err(e) = store.update_session_command(session_id, &spec.command).await {
        warn!("[{}] failed to stamp session command: {}", conn_id, e);
    }
    if spec.record {
        recorder.activate();
        if let Some(pty) = &spec.pty {
            if pty.window.width > 0 && pty.window.height > 0 {
                recorder.write_window_size(pty.window.width, pty.window.height);
            }
        }
    }

    let opts = ExecAttachOptions {
        env: spec.env,
        command: spec.tokens,
        is_pty: spec.pty.is_some(),
        term: spec.pty.map(|p| p.term),
        window: window_rx,
    };

    let (out_tx, mut out_rx) = mpsc::channel(32);
    let attach_sandbox = sandbox.clone();
    let attach = tokio::spawn(async move {
        attach_sandbox.exec_attach(opts, stdin_rx, out_tx).await
    });

    while let Some(chunk) = out_rx.recv().await {
        match chunk {
            OutputChunk::Stdout(data) => {
                recorder.write_stdout(&data);
                if handle
                    .data(channel_id, CryptoVec::from_slice(&data))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            OutputChunk::Stderr(data) => {
                recorder.write_stderr(&data);
                if handle
                    .extended_data(channel_id, 1, CryptoVec::from_slice(&data))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }

    let exit_code = match attach.await {
        Ok(Ok(())) => 0u32,
        Ok(Err(e)) => {
            warn!("[{}] sandbox attach failed: {}", conn_id, e);
            1
        }
        Err(e) => {
            warn!("[{}] sandbox attach task panicked: {}", conn_id, e);
            1
        }
    };

    let _ = handle.exit_status_request(channel_id, exit_code).await;
    let _ = handle.eof(channel_id).await;
    let _ = handle.close(channel_id).await;
    recorder.close();
    if let Err(e) = store
        .update_session_closed(session_id, recorder.is_activated())
        .await
    {
        warn!("[{}] failed to stamp session end: {}", conn_id, e);
    }
    debug!("[{}] sandbox channel finished (exit {})", conn_id, exit_code);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pty() -> Pty {
        Pty {
            term: "xterm-256color".into(),
            window: Window {
                width: 80,
                height: 24,
            },
        }
    }

    #[test]
    fn test_env_accumulates_until_commit() {
        let mut state = ChannelState::new();
        assert!(state.push_env("LANG", "C.UTF-8"));
        assert!(state.push_env("EDITOR", "vi"));
        let spec = state.commit("ls".into()).unwrap();
        assert_eq!(spec.env, vec!["LANG=C.UTF-8", "EDITOR=vi"]);
        assert!(!state.push_env("LATE", "nope"));
    }

    #[test]
    fn test_single_pty() {
        let mut state = ChannelState::new();
        assert!(state.set_pty(pty()));
        assert!(!state.set_pty(pty()));
    }

    #[test]
    fn test_window_change_requires_pty() {
        let mut state = ChannelState::new();
        let win = Window {
            width: 100,
            height: 30,
        };
        assert!(!state.window_change(win));
        state.set_pty(pty());
        assert!(state.window_change(win));
        // the committed spec carries the updated window
        let spec = state.commit(String::new()).unwrap();
        assert_eq!(spec.pty.unwrap().window, win);
        // resize passthrough continues after commit
        assert!(state.window_change(Window {
            width: 50,
            height: 20
        }));
    }

    #[test]
    fn test_commit_latch() {
        let mut state = ChannelState::new();
        assert!(state.commit("uptime".into()).is_some());
        assert!(state.is_handled());
        assert!(state.commit("uptime".into()).is_none());
        assert!(!state.set_pty(pty()));
    }

    #[test]
    fn test_shell_is_empty_exec() {
        let mut state = ChannelState::new();
        let spec = state.commit(String::new()).unwrap();
        assert_eq!(spec.tokens, vec!["/bin/bash"]);
        assert!(spec.record);
    }

    #[test]
    fn test_scp_is_not_recorded() {
        let mut state = ChannelState::new();
        let spec = state.commit("scp -t /tmp".into()).unwrap();
        assert_eq!(spec.tokens, vec!["scp", "-t", "/tmp"]);
        assert!(!spec.record);
        assert_eq!(spec.command, "scp -t /tmp");
    }
}
