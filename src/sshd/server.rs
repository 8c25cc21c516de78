//! Listener / dispatcher.
//!
//! Binds the configured address, upgrades every accepted TCP
//! connection to an SSH server connection with the handshake
//! authenticator, and leaves channel routing to the per-connection
//! handler. Shutdown closes the listener; in-flight connections drain
//! to natural completion.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::auth::Authenticator;
use crate::configuration::Config;
use crate::error_handling::types::SshdError;
use crate::sandbox::SandboxManager;
use crate::sshd::handler::{ConnectionHandler, SshdState};
use crate::store::Store;

pub struct Sshd {
    russh_config: Arc<russh::server::Config>,
    state: Arc<SshdState>,
    listener: Option<TcpListener>,
}

impl Sshd {
    /// Loads the host and client signers and prepares the shared
    /// connection state. Fails when either key file is unreadable or
    /// the container runtime client cannot be constructed.
    pub fn new(config: Config, store: Arc<dyn Store>) -> Result<Self, SshdError> {
        let host_key = russh::keys::load_secret_key(&config.sshd.host_key, None)
            .map_err(|e| SshdError::KeyError(format!("host key: {}", e)))?;
        let client_key = Arc::new(
            russh::keys::load_secret_key(&config.sshd.client_key, None)
                .map_err(|e| SshdError::KeyError(format!("client key: {}", e)))?,
        );
        let sandbox_manager = SandboxManager::new(config.sandbox.clone())?;
        let authenticator = Authenticator::new(store.clone(), &config.sandbox.host);

        let russh_config = Arc::new(russh::server::Config {
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::ZERO),
            keys: vec![host_key],
            ..Default::default()
        });

        let state = Arc::new(SshdState {
            config,
            store,
            authenticator,
            sandbox_manager,
            client_key,
        });

        Ok(Self {
            russh_config,
            state,
            listener: None,
        })
    }

    /// Binds the configured host:port and returns the bound address.
    pub async fn bind(&mut self) -> Result<SocketAddr, SshdError> {
        if self.listener.is_some() {
            return Err(SshdError::AlreadyRunning);
        }
        let addr = format!(
            "{}:{}",
            self.state.config.sshd.host, self.state.config.sshd.port
        );
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(SshdError::BindError)?;
        let local_addr = listener.local_addr().map_err(SshdError::BindError)?;
        info!("[+] sshd listening on {}", local_addr);
        self.listener = Some(listener);
        Ok(local_addr)
    }

    /// Accept loop. Each connection runs in its own task; a shutdown
    /// signal stops accepting and drops the listener while existing
    /// sessions complete on client hang-up.
    pub async fn run(
        &mut self,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<(), SshdError> {
        if self.listener.is_none() {
            self.bind().await?;
        }
        let listener = self.listener.take().unwrap();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            let local_addr = match stream.local_addr() {
                                Ok(a) => a,
                                Err(e) => {
                                    error!("[!] no local address for {}: {:?}", peer_addr, e);
                                    continue;
                                }
                            };
                            let state = self.state.clone();
                            let config = self.russh_config.clone();
                            tokio::spawn(async move {
                                let handler = ConnectionHandler::new(state, peer_addr, local_addr);
                                match russh::server::run_stream(config, stream, handler).await {
                                    Ok(session) => {
                                        if let Err(e) = session.await {
                                            debug!("session from {} ended: {}", peer_addr, e);
                                        }
                                    }
                                    Err(e) => {
                                        debug!("handshake with {} failed: {}", peer_addr, e);
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            error!("[!] failed to accept connection: {:?}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received, closing listener");
                    break;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::types::StoreBackend;
    use crate::store::MemoryStore;
    use russh::client;
    use russh::keys::ssh_key::rand_core::OsRng;
    use russh::keys::ssh_key::{Algorithm, LineEnding};
    use russh::keys::{HashAlg, PrivateKey, PrivateKeyWithHashAlg};

    struct AcceptAll;

    impl client::Handler for AcceptAll {
        type Error = russh::Error;

        async fn check_server_key(
            &mut self,
            _server_public_key: &russh::keys::PublicKey,
        ) -> Result<bool, Self::Error> {
            Ok(true)
        }
    }

    fn write_key(dir: &std::path::Path, name: &str) -> (std::path::PathBuf, PrivateKey) {
        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, key.to_openssh(LineEnding::LF).unwrap().as_bytes()).unwrap();
        (path, key)
    }

    fn test_config(dir: &std::path::Path) -> Config {
        let (host_key, _) = write_key(dir, "host_key");
        let (client_key, _) = write_key(dir, "client_key");
        let mut config = Config::default();
        config.sshd.host = "127.0.0.1".to_string();
        config.sshd.port = 0;
        config.sshd.host_key = host_key;
        config.sshd.client_key = client_key;
        config.sshd.replay_dir = dir.join("replays");
        config.store.backend = StoreBackend::Memory;
        config
    }

    async fn authenticate(
        addr: SocketAddr,
        user: &str,
        key: PrivateKey,
    ) -> client::AuthResult {
        let config = Arc::new(client::Config::default());
        let mut session = client::connect(config, addr, AcceptAll).await.unwrap();
        session
            .authenticate_publickey(
                user,
                PrivateKeyWithHashAlg::new(Arc::new(key), None),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_publickey_auth_against_store() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let mut sshd = Sshd::new(test_config(dir.path()), store.clone()).unwrap();
        let addr = sshd.bind().await.unwrap();

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let server = tokio::spawn(async move { sshd.run(shutdown_rx).await });

        let operator_key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let fingerprint = operator_key
            .public_key()
            .fingerprint(HashAlg::Sha256)
            .to_string();

        // unknown key is rejected
        let result = authenticate(addr, "alice", operator_key.clone()).await;
        assert!(matches!(result, client::AuthResult::Failure { .. }));

        // registered key is accepted
        let user = store.add_user("alice", false).unwrap();
        store.add_key(user.id, &fingerprint, false).unwrap();
        let result = authenticate(addr, "alice", operator_key.clone()).await;
        assert!(matches!(result, client::AuthResult::Success));

        // a blocked user authenticates to nothing
        let blocked = store.add_user("mallory", true).unwrap();
        let blocked_key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        store
            .add_key(
                blocked.id,
                &blocked_key
                    .public_key()
                    .fingerprint(HashAlg::Sha256)
                    .to_string(),
                false,
            )
            .unwrap();
        let result = authenticate(addr, "mallory", blocked_key).await;
        assert!(matches!(result, client::AuthResult::Failure { .. }));

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_bind_twice_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let mut sshd = Sshd::new(test_config(dir.path()), store).unwrap();
        sshd.bind().await.unwrap();
        assert!(matches!(
            sshd.bind().await,
            Err(SshdError::AlreadyRunning)
        ));
    }

    #[tokio::test]
    async fn test_missing_host_key() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = test_config(dir.path());
        config.sshd.host_key = dir.path().join("nope");
        let store = Arc::new(MemoryStore::new());
        assert!(matches!(
            Sshd::new(config, store),
            Err(SshdError::KeyError(_))
        ));
    }
}
