//! Identity & grant store
//!
//! Persistence surface over users, public keys, target servers,
//! grants and recorded sessions.
//!
//! Components:
//! - `store_trait`: the narrow `Store` verb surface the core consumes.
//! - `types`: domain records plus name validation, wildcard matching
//!   and grant combination.
//! - `database_store`: ORM-based SQLite implementation using SeaORM.
//! - `memory_store`: mutex-guarded in-memory implementation for tests
//!   and throwaway deployments.
//! - `db_entities`: SeaORM entity models for the database backend.

pub mod database_store;
pub mod db_entities;
pub mod memory_store;
pub mod store_trait;
pub mod types;

pub use database_store::DatabaseStore;
pub use memory_store::MemoryStore;
pub use store_trait::Store;
pub use types::{CombinedGrant, Grant, PublicKey, Server, SessionRecord, User};
