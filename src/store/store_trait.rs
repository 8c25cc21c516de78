//! Store Trait
//!
//! The narrow read/mutation surface the bastion core consults during
//! handshakes and session bookkeeping. Query composition stays inside
//! the backend implementations; the core only speaks these verbs.

use crate::error_handling::types::StoreError;
use crate::store::types::{CombinedGrant, PublicKey, Server, SessionRecord, User};
use async_trait::async_trait;

/// Persistence surface consumed by the authenticator, the forwarders
/// and the sandbox dispatcher.
///
/// The `touch_*` verbs update last-used timestamps and are
/// fire-and-forget for callers: their failure must never affect an
/// authentication decision.
#[async_trait]
pub trait Store: Send + Sync {
    /// Looks up a public key by SHA-256 fingerprint.
    async fn find_key(&self, fingerprint: &str) -> Result<Option<PublicKey>, StoreError>;

    /// Looks up a user by id.
    async fn find_user(&self, id: i64) -> Result<Option<User>, StoreError>;

    /// Looks up a user by account name.
    async fn find_user_by_account(&self, account: &str) -> Result<Option<User>, StoreError>;

    /// Looks up a server by name.
    async fn find_server_by_name(&self, name: &str) -> Result<Option<Server>, StoreError>;

    async fn touch_user(&self, id: i64) -> Result<(), StoreError>;
    async fn touch_key(&self, id: i64) -> Result<(), StoreError>;
    async fn touch_server(&self, id: i64) -> Result<(), StoreError>;

    /// Returns whether `user` may act as `target_account` on `server`:
    /// true iff some non-expired grant of the user has a pattern
    /// matching the server name and the requested target account.
    async fn check_grant(
        &self,
        user: &User,
        server: &Server,
        target_account: &str,
    ) -> Result<bool, StoreError>;

    /// The de-duplicated grants view for one user: wildcard patterns
    /// are expanded against the current server set; each reachable
    /// (server, account) pair appears once with the latest expiry
    /// among contributing grants, permanent grants dominating.
    async fn combined_grants(&self, user_id: i64) -> Result<Vec<CombinedGrant>, StoreError>;

    /// Creates a session row for an accepted channel and returns it
    /// with its id and replay file path populated.
    async fn create_session(&self, operator: &str) -> Result<SessionRecord, StoreError>;

    /// Stamps the command string the operator ran.
    async fn update_session_command(&self, id: i64, command: &str) -> Result<(), StoreError>;

    /// Stamps the end time and whether a replay was recorded.
    async fn update_session_closed(&self, id: i64, recorded: bool) -> Result<(), StoreError>;

    /// Registers `fingerprint` as the sandbox-origin key of `account`,
    /// replacing any previous sandbox-origin key of that account.
    async fn upsert_sandbox_key(&self, fingerprint: &str, account: &str)
        -> Result<(), StoreError>;
}
