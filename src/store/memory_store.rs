use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::error_handling::types::StoreError;
use crate::store::store_trait::Store;
use crate::store::types::{
    combine_grants, valid_name, wildcard_match, CombinedGrant, Grant, PublicKey, Server,
    SessionRecord, User,
};

/// In-memory store backend.
///
/// Keeps every table in a mutex-guarded block of vectors. Used by the
/// `memory` backend for throwaway deployments and by the test suite;
/// the seeding helpers (`add_user`, `add_key`, ...) stand in for the
/// administrative surface.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    next_id: i64,
    users: Vec<User>,
    keys: Vec<PublicKey>,
    servers: Vec<Server>,
    grants: Vec<Grant>,
    sessions: Vec<SessionRecord>,
}

impl Inner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, account: &str, is_blocked: bool) -> Result<User, StoreError> {
        if !valid_name(account) {
            return Err(StoreError::InvalidRecord(format!(
                "invalid account name {:?}",
                account
            )));
        }
        let mut inner = self.inner.lock().unwrap();
        let user = User {
            id: inner.next_id(),
            account: account.to_string(),
            password_digest: String::new(),
            is_admin: false,
            is_blocked,
            created_at: Utc::now(),
            used_at: None,
        };
        inner.users.push(user.clone());
        Ok(user)
    }

    pub fn add_key(
        &self,
        user_id: i64,
        fingerprint: &str,
        is_sandbox: bool,
    ) -> Result<PublicKey, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.keys.iter().any(|k| k.fingerprint == fingerprint) {
            return Err(StoreError::InvalidRecord(format!(
                "duplicate fingerprint {}",
                fingerprint
            )));
        }
        let key = PublicKey {
            id: inner.next_id(),
            user_id,
            name: String::new(),
            fingerprint: fingerprint.to_string(),
            is_sandbox,
            created_at: Utc::now(),
            used_at: None,
        };
        inner.keys.push(key.clone());
        Ok(key)
    }

    pub fn add_server(&self, name: &str, address: &str) -> Result<Server, StoreError> {
        if !valid_name(name) {
            return Err(StoreError::InvalidRecord(format!(
                "invalid server name {:?}",
                name
            )));
        }
        let mut inner = self.inner.lock().unwrap();
        let server = Server {
            id: inner.next_id(),
            name: name.to_string(),
            address: address.to_string(),
            is_auto: false,
            created_at: Utc::now(),
            used_at: None,
        };
        inner.servers.push(server.clone());
        Ok(server)
    }

    pub fn add_grant(
        &self,
        user_id: i64,
        pattern: &str,
        target_account: &str,
        expires_at: Option<chrono::DateTime<Utc>>,
    ) -> Result<Grant, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let grant = Grant {
            id: inner.next_id(),
            user_id,
            pattern: pattern.to_string(),
            target_account: target_account.to_string(),
            expires_at,
            created_at: Utc::now(),
        };
        inner.grants.push(grant.clone());
        Ok(grant)
    }

    /// Snapshot of a session row, for assertions.
    pub fn session(&self, id: i64) -> Option<SessionRecord> {
        self.inner
            .lock()
            .unwrap()
            .sessions
            .iter()
            .find(|s| s.id == id)
            .cloned()
    }

    /// Snapshot of a key row by fingerprint, for assertions.
    pub fn key(&self, fingerprint: &str) -> Option<PublicKey> {
        self.inner
            .lock()
            .unwrap()
            .keys
            .iter()
            .find(|k| k.fingerprint == fingerprint)
            .cloned()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn find_key(&self, fingerprint: &str) -> Result<Option<PublicKey>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .keys
            .iter()
            .find(|k| k.fingerprint == fingerprint)
            .cloned())
    }

    async fn find_user(&self, id: i64) -> Result<Option<User>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.users.iter().find(|u| u.id == id).cloned())
    }

    async fn find_user_by_account(&self, account: &str) -> Result<Option<User>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.users.iter().find(|u| u.account == account).cloned())
    }

    async fn find_server_by_name(&self, name: &str) -> Result<Option<Server>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.servers.iter().find(|s| s.name == name).cloned())
    }

    async fn touch_user(&self, id: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(u) = inner.users.iter_mut().find(|u| u.id == id) {
            u.used_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn touch_key(&self, id: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(k) = inner.keys.iter_mut().find(|k| k.id == id) {
            k.used_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn touch_server(&self, id: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(s) = inner.servers.iter_mut().find(|s| s.id == id) {
            s.used_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn check_grant(
        &self,
        user: &User,
        server: &Server,
        target_account: &str,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let inner = self.inner.lock().unwrap();
        Ok(inner.grants.iter().any(|g| {
            g.user_id == user.id
                && g.target_account == target_account
                && !g.is_expired(now)
                && wildcard_match(&g.pattern, &server.name)
        }))
    }

    async fn combined_grants(&self, user_id: i64) -> Result<Vec<CombinedGrant>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let grants: Vec<Grant> = inner
            .grants
            .iter()
            .filter(|g| g.user_id == user_id)
            .cloned()
            .collect();
        Ok(combine_grants(&grants, &inner.servers, Utc::now()))
    }

    async fn create_session(&self, operator: &str) -> Result<SessionRecord, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id();
        let started_at = Utc::now();
        let session = SessionRecord {
            id,
            user_account: operator.to_string(),
            command: String::new(),
            started_at,
            ended_at: None,
            is_recorded: false,
            replay_file: SessionRecord::generate_replay_file(started_at, id),
        };
        inner.sessions.push(session.clone());
        Ok(session)
    }

    async fn update_session_command(&self, id: i64, command: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.sessions.iter_mut().find(|s| s.id == id) {
            Some(s) => {
                s.command = command.to_string();
                Ok(())
            }
            None => Err(StoreError::WriteFailed),
        }
    }

    async fn update_session_closed(&self, id: i64, recorded: bool) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.sessions.iter_mut().find(|s| s.id == id) {
            Some(s) => {
                s.ended_at = Some(Utc::now());
                s.is_recorded = recorded;
                Ok(())
            }
            None => Err(StoreError::WriteFailed),
        }
    }

    async fn upsert_sandbox_key(
        &self,
        fingerprint: &str,
        account: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let user_id = match inner.users.iter().find(|u| u.account == account) {
            Some(u) => u.id,
            None => {
                return Err(StoreError::InvalidRecord(format!(
                    "no user with account {:?}",
                    account
                )))
            }
        };
        // a non-sandbox key already owning this fingerprint must not
        // silently become a sandbox key
        if inner
            .keys
            .iter()
            .any(|k| k.fingerprint == fingerprint && !k.is_sandbox)
        {
            return Err(StoreError::InvalidRecord(format!(
                "fingerprint {} already registered as a regular key",
                fingerprint
            )));
        }
        inner
            .keys
            .retain(|k| !(k.is_sandbox && k.user_id == user_id));
        let key = PublicKey {
            id: inner.next_id(),
            user_id,
            name: "sandbox".to_string(),
            fingerprint: fingerprint.to_string(),
            is_sandbox: true,
            created_at: Utc::now(),
            used_at: None,
        };
        inner.keys.push(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_key_and_user_lookup() {
        let store = MemoryStore::new();
        let user = store.add_user("alice", false).unwrap();
        store.add_key(user.id, "SHA256:AAA", false).unwrap();

        let key = store.find_key("SHA256:AAA").await.unwrap().unwrap();
        assert_eq!(key.user_id, user.id);
        assert!(store.find_key("SHA256:BBB").await.unwrap().is_none());
        assert_eq!(
            store.find_user(user.id).await.unwrap().unwrap().account,
            "alice"
        );
        assert!(store
            .find_user_by_account("nobody1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_check_grant_wildcard_and_expiry() {
        let store = MemoryStore::new();
        let user = store.add_user("alice", false).unwrap();
        let web1 = store.add_server("web1", "10.0.0.5:22").unwrap();
        let webdb = store.add_server("webdb", "10.0.0.6:22").unwrap();
        store.add_grant(user.id, "web*", "deploy", None).unwrap();

        assert!(store.check_grant(&user, &web1, "deploy").await.unwrap());
        assert!(store.check_grant(&user, &webdb, "deploy").await.unwrap());
        assert!(!store.check_grant(&user, &web1, "root").await.unwrap());

        // db* must not match webdb
        let other = store.add_user("bobby", false).unwrap();
        store.add_grant(other.id, "db*", "deploy", None).unwrap();
        assert!(!store.check_grant(&other, &webdb, "deploy").await.unwrap());

        // expired grant authorises nothing
        let carol = store.add_user("carol", false).unwrap();
        store
            .add_grant(
                carol.id,
                "web*",
                "deploy",
                Some(Utc::now() - chrono::Duration::seconds(1)),
            )
            .unwrap();
        assert!(!store.check_grant(&carol, &web1, "deploy").await.unwrap());
    }

    #[tokio::test]
    async fn test_combined_grants_latest_expiry() {
        let store = MemoryStore::new();
        let user = store.add_user("alice", false).unwrap();
        store.add_server("web1", "10.0.0.5:22").unwrap();
        let soon = Utc::now() + chrono::Duration::hours(1);
        store
            .add_grant(user.id, "web1", "deploy", Some(soon))
            .unwrap();
        store.add_grant(user.id, "web*", "deploy", None).unwrap();

        let combined = store.combined_grants(user.id).await.unwrap();
        assert_eq!(combined.len(), 1);
        assert_eq!(combined[0].server_name, "web1");
        assert_eq!(combined[0].target_account, "deploy");
        assert_eq!(combined[0].expires_at, None);
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let store = MemoryStore::new();
        let session = store.create_session("alice").await.unwrap();
        assert!(session.ended_at.is_none());
        assert!(!session.replay_file.is_empty());

        store
            .update_session_command(session.id, "ls -la")
            .await
            .unwrap();
        store.update_session_closed(session.id, true).await.unwrap();

        let stored = store.session(session.id).unwrap();
        assert_eq!(stored.command, "ls -la");
        assert!(stored.ended_at.is_some());
        assert!(stored.is_recorded);
    }

    #[tokio::test]
    async fn test_upsert_sandbox_key_replaces_previous() {
        let store = MemoryStore::new();
        store.add_user("alice", false).unwrap();

        store.upsert_sandbox_key("SHA256:S1", "alice").await.unwrap();
        store.upsert_sandbox_key("SHA256:S2", "alice").await.unwrap();

        assert!(store.find_key("SHA256:S1").await.unwrap().is_none());
        let key = store.find_key("SHA256:S2").await.unwrap().unwrap();
        assert!(key.is_sandbox);
    }

    #[tokio::test]
    async fn test_upsert_sandbox_key_rejects_foreign_fingerprint() {
        let store = MemoryStore::new();
        let user = store.add_user("alice", false).unwrap();
        store.add_key(user.id, "SHA256:AAA", false).unwrap();

        let result = store.upsert_sandbox_key("SHA256:AAA", "alice").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_touch_updates_used_at() {
        let store = MemoryStore::new();
        let user = store.add_user("alice", false).unwrap();
        assert!(user.used_at.is_none());
        store.touch_user(user.id).await.unwrap();
        assert!(store
            .find_user(user.id)
            .await
            .unwrap()
            .unwrap()
            .used_at
            .is_some());
    }
}
