//! Sandbox subsystem
//!
//! Gives each operator a persistent shell container the bastion can
//! itself proxy to. The manager owns find-or-create of the per-account
//! container, the container handle drives exec attaches and scripts,
//! and the forwarder terminates accepted session channels against the
//! container exec endpoint.

pub mod container;
pub mod forwarder;
pub mod manager;
pub mod scripts;
pub mod types;

pub use container::Sandbox;
pub use forwarder::{run_attach, ChannelState, LaunchSpec};
pub use manager::{container_name, SandboxManager};
pub use types::{ExecAttachOptions, OutputChunk, Pty, Window};
