//! SSH front door
//!
//! The listener accepts TCP, upgrades to SSH server connections using
//! the host signer and the handshake authenticator, and routes every
//! accepted `session` channel to the proxy or sandbox forwarder.

pub mod handler;
pub mod server;

pub use handler::{ConnectionHandler, SshdState};
pub use server::Sshd;
