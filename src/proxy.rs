//! Proxy engine
//!
//! Bridges accepted inbound session channels to outbound SSH sessions
//! on granted targets, rewriting request semantics so everything runs
//! under the granted target account.

pub mod forwarder;
pub mod rewrite;

pub use forwarder::{connect_outbound, OutboundHandler, ProxyCommand, ProxyForwarder};
pub use rewrite::{modify_command, should_record, tokenize_command};
