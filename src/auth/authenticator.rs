//! Handshake authorization.
//!
//! The public-key callback of the SSH front door: given the requested
//! user string, the connection addresses and the presented key
//! fingerprint, decide whether the connection is allowed and how to
//! route it (proxy to a granted target, or into the operator's
//! sandbox).

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use log::{debug, warn};

use crate::error_handling::types::AuthError;
use crate::store::Store;

/// Routing decision attached to an authenticated connection.
#[derive(Debug, Clone, PartialEq)]
pub enum AccessMode {
    /// Bridge every session channel to an outbound SSH session on
    /// `target_address`, forcing execution as `target_account`.
    Proxy {
        target_account: String,
        target_address: String,
    },
    /// Terminate session channels in the operator's sandbox container.
    Sandbox,
}

/// What the dispatcher needs to route an authenticated connection.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthToken {
    pub account: String,
    pub mode: AccessMode,
}

/// Splits the requested SSH user string into
/// `(target_account, target_server)` iff it contains exactly one `@`
/// with non-empty parts. Anything else requests sandbox mode.
pub fn decode_target(input: &str) -> Option<(&str, &str)> {
    let mut parts = input.split('@');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(account), Some(server), None) if !account.is_empty() && !server.is_empty() => {
            Some((account, server))
        }
        _ => None,
    }
}

pub struct Authenticator {
    store: Arc<dyn Store>,
    sandbox_host: Option<IpAddr>,
}

impl Authenticator {
    pub fn new(store: Arc<dyn Store>, sandbox_host: &str) -> Self {
        let sandbox_host = match sandbox_host.parse() {
            Ok(ip) => Some(ip),
            Err(_) => {
                warn!(
                    "[!] sandbox host {:?} is not an IP address, sandbox loop-back disabled",
                    sandbox_host
                );
                None
            }
        };
        Self {
            store,
            sandbox_host,
        }
    }

    fn from_sandbox_host(&self, local_addr: SocketAddr) -> bool {
        self.sandbox_host == Some(local_addr.ip())
    }

    /// Decides whether the presented key may open this connection and
    /// how to route it. Fails closed: any store read failure is
    /// reported as the rejection of the step it occurred in. Touches
    /// are fire-and-forget.
    pub async fn authorize(
        &self,
        ssh_user: &str,
        local_addr: SocketAddr,
        fingerprint: &str,
    ) -> Result<AuthToken, AuthError> {
        let target = decode_target(ssh_user);

        let key = self
            .store
            .find_key(fingerprint)
            .await
            .map_err(|_| AuthError::UnknownKey)?
            .ok_or(AuthError::UnknownKey)?;

        let user = self
            .store
            .find_user(key.user_id)
            .await
            .map_err(|_| AuthError::UnknownOrBlockedUser)?
            .ok_or(AuthError::UnknownOrBlockedUser)?;
        if user.is_blocked {
            return Err(AuthError::UnknownOrBlockedUser);
        }

        let _ = self.store.touch_key(key.id).await;
        let _ = self.store.touch_user(user.id).await;

        if self.from_sandbox_host(local_addr) {
            // loop-back from inside a sandbox: only sandbox-origin
            // keys requesting a concrete target are acceptable
            if !key.is_sandbox || target.is_none() {
                return Err(AuthError::SandboxKeyMisuse);
            }
        } else if key.is_sandbox {
            // sandbox keys never leave the sandbox host
            return Err(AuthError::SandboxKeyMisuse);
        }

        match target {
            Some((target_account, target_server)) => {
                let server = self
                    .store
                    .find_server_by_name(target_server)
                    .await
                    .map_err(|_| AuthError::TargetNotFound)?
                    .ok_or(AuthError::TargetNotFound)?;
                let granted = self
                    .store
                    .check_grant(&user, &server, target_account)
                    .await
                    .map_err(|_| AuthError::NoPermission)?;
                if !granted {
                    return Err(AuthError::NoPermission);
                }
                let _ = self.store.touch_server(server.id).await;
                debug!(
                    "authorized {} as {}@{} ({})",
                    user.account, target_account, target_server, server.address
                );
                Ok(AuthToken {
                    account: user.account,
                    mode: AccessMode::Proxy {
                        target_account: target_account.to_string(),
                        target_address: server.address,
                    },
                })
            }
            None => {
                debug!("authorized {} for sandbox", user.account);
                Ok(AuthToken {
                    account: user.account,
                    mode: AccessMode::Sandbox,
                })
            }
        }
    }
}
