use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::warn;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Database, DatabaseConnection, DbBackend, EntityTrait,
    QueryFilter, Set, Statement,
};

use crate::error_handling::types::StoreError;
use crate::store::db_entities::{grants, keys, servers, sessions, users};
use crate::store::store_trait::Store;
use crate::store::types::{
    combine_grants, valid_name, wildcard_match, CombinedGrant, Grant, PublicKey, Server,
    SessionRecord, User,
};

/// SQLite-backed store using SeaORM.
///
/// The schema is created on open with `CREATE TABLE IF NOT EXISTS`,
/// so pointing the bastion at a fresh path bootstraps an empty
/// database. Wildcard grant evaluation happens in code on top of
/// narrow per-user queries; the SQL layer never sees the patterns.
pub struct DatabaseStore {
    conn: DatabaseConnection,
}

fn fmt_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339()
}

fn parse_time(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| StoreError::ReadFailed)
}

fn parse_opt_time(s: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    match s {
        Some(s) => Ok(Some(parse_time(&s)?)),
        None => Ok(None),
    }
}

impl DatabaseStore {
    pub async fn new_file<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path_ref = path.as_ref();
        if let Some(parent) = path_ref.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|_| StoreError::WriteFailed)?;
            }
        }
        // DSN understood by the sqlx sqlite driver; creates the file if needed
        let dsn = format!("sqlite://{}?mode=rwc", path_ref.to_string_lossy());
        let conn = Database::connect(dsn)
            .await
            .map_err(|_| StoreError::ConnectionFailed)?;
        conn.execute(Statement::from_string(
            DbBackend::Sqlite,
            "PRAGMA foreign_keys = ON".to_string(),
        ))
        .await
        .map_err(|_| StoreError::WriteFailed)?;
        for ddl in [
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account TEXT NOT NULL UNIQUE,
                password_digest TEXT NOT NULL,
                is_admin INTEGER NOT NULL,
                is_blocked INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                used_at TEXT
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS keys (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                fingerprint TEXT NOT NULL UNIQUE,
                is_sandbox INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                used_at TEXT,
                FOREIGN KEY(user_id) REFERENCES users(id) ON DELETE CASCADE
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS servers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                address TEXT NOT NULL,
                is_auto INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                used_at TEXT
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS grants (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                pattern TEXT NOT NULL,
                target_account TEXT NOT NULL,
                expires_at TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY(user_id) REFERENCES users(id) ON DELETE CASCADE
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_account TEXT NOT NULL,
                command TEXT NOT NULL,
                started_at TEXT NOT NULL,
                ended_at TEXT,
                is_recorded INTEGER NOT NULL,
                replay_file TEXT NOT NULL
            );
            "#,
        ] {
            conn.execute(Statement::from_string(DbBackend::Sqlite, ddl.to_string()))
                .await
                .map_err(|_| StoreError::WriteFailed)?;
        }
        Ok(Self { conn })
    }

    fn user_from_model(m: users::Model) -> Result<User, StoreError> {
        Ok(User {
            id: m.id,
            account: m.account,
            password_digest: m.password_digest,
            is_admin: m.is_admin,
            is_blocked: m.is_blocked,
            created_at: parse_time(&m.created_at)?,
            used_at: parse_opt_time(m.used_at)?,
        })
    }

    fn key_from_model(m: keys::Model) -> Result<PublicKey, StoreError> {
        Ok(PublicKey {
            id: m.id,
            user_id: m.user_id,
            name: m.name,
            fingerprint: m.fingerprint,
            is_sandbox: m.is_sandbox,
            created_at: parse_time(&m.created_at)?,
            used_at: parse_opt_time(m.used_at)?,
        })
    }

    fn server_from_model(m: servers::Model) -> Result<Server, StoreError> {
        Ok(Server {
            id: m.id,
            name: m.name,
            address: m.address,
            is_auto: m.is_auto,
            created_at: parse_time(&m.created_at)?,
            used_at: parse_opt_time(m.used_at)?,
        })
    }

    fn grant_from_model(m: grants::Model) -> Result<Grant, StoreError> {
        Ok(Grant {
            id: m.id,
            user_id: m.user_id,
            pattern: m.pattern,
            target_account: m.target_account,
            expires_at: parse_opt_time(m.expires_at)?,
            created_at: parse_time(&m.created_at)?,
        })
    }

    fn session_from_model(m: sessions::Model) -> Result<SessionRecord, StoreError> {
        Ok(SessionRecord {
            id: m.id,
            user_account: m.user_account,
            command: m.command,
            started_at: parse_time(&m.started_at)?,
            ended_at: parse_opt_time(m.ended_at)?,
            is_recorded: m.is_recorded,
            replay_file: m.replay_file,
        })
    }

    pub async fn add_user(&self, account: &str, is_blocked: bool) -> Result<User, StoreError> {
        if !valid_name(account) {
            return Err(StoreError::InvalidRecord(format!(
                "invalid account name {:?}",
                account
            )));
        }
        let am = users::ActiveModel {
            account: Set(account.to_string()),
            password_digest: Set(String::new()),
            is_admin: Set(false),
            is_blocked: Set(is_blocked),
            created_at: Set(fmt_time(Utc::now())),
            used_at: Set(None),
            ..Default::default()
        };
        let res = users::Entity::insert(am)
            .exec(&self.conn)
            .await
            .map_err(|_| StoreError::WriteFailed)?;
        self.find_user(res.last_insert_id)
            .await?
            .ok_or(StoreError::ReadFailed)
    }

    pub async fn add_key(
        &self,
        user_id: i64,
        fingerprint: &str,
        is_sandbox: bool,
    ) -> Result<PublicKey, StoreError> {
        let am = keys::ActiveModel {
            user_id: Set(user_id),
            name: Set(String::new()),
            fingerprint: Set(fingerprint.to_string()),
            is_sandbox: Set(is_sandbox),
            created_at: Set(fmt_time(Utc::now())),
            used_at: Set(None),
            ..Default::default()
        };
        let res = keys::Entity::insert(am)
            .exec(&self.conn)
            .await
            .map_err(|_| StoreError::WriteFailed)?;
        let m = keys::Entity::find_by_id(res.last_insert_id)
            .one(&self.conn)
            .await
            .map_err(|_| StoreError::ReadFailed)?
            .ok_or(StoreError::ReadFailed)?;
        Self::key_from_model(m)
    }

    pub async fn add_server(&self, name: &str, address: &str) -> Result<Server, StoreError> {
        if !valid_name(name) {
            return Err(StoreError::InvalidRecord(format!(
                "invalid server name {:?}",
                name
            )));
        }
        let am = servers::ActiveModel {
            name: Set(name.to_string()),
            address: Set(address.to_string()),
            is_auto: Set(false),
            created_at: Set(fmt_time(Utc::now())),
            used_at: Set(None),
            ..Default::default()
        };
        let res = servers::Entity::insert(am)
            .exec(&self.conn)
            .await
            .map_err(|_| StoreError::WriteFailed)?;
        let m = servers::Entity::find_by_id(res.last_insert_id)
            .one(&self.conn)
            .await
            .map_err(|_| StoreError::ReadFailed)?
            .ok_or(StoreError::ReadFailed)?;
        Self::server_from_model(m)
    }

    pub async fn add_grant(
        &self,
        user_id: i64,
        pattern: &str,
        target_account: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Grant, StoreError> {
        let am = grants::ActiveModel {
            user_id: Set(user_id),
            pattern: Set(pattern.to_string()),
            target_account: Set(target_account.to_string()),
            expires_at: Set(expires_at.map(fmt_time)),
            created_at: Set(fmt_time(Utc::now())),
            ..Default::default()
        };
        let res = grants::Entity::insert(am)
            .exec(&self.conn)
            .await
            .map_err(|_| StoreError::WriteFailed)?;
        let m = grants::Entity::find_by_id(res.last_insert_id)
            .one(&self.conn)
            .await
            .map_err(|_| StoreError::ReadFailed)?
            .ok_or(StoreError::ReadFailed)?;
        Self::grant_from_model(m)
    }

    async fn user_grants(&self, user_id: i64) -> Result<Vec<Grant>, StoreError> {
        let rows = grants::Entity::find()
            .filter(grants::Column::UserId.eq(user_id))
            .all(&self.conn)
            .await
            .map_err(|_| StoreError::ReadFailed)?;
        rows.into_iter().map(Self::grant_from_model).collect()
    }
}

#[async_trait]
impl Store for DatabaseStore {
    async fn find_key(&self, fingerprint: &str) -> Result<Option<PublicKey>, StoreError> {
        let m = keys::Entity::find()
            .filter(keys::Column::Fingerprint.eq(fingerprint))
            .one(&self.conn)
            .await
            .map_err(|_| StoreError::ReadFailed)?;
        m.map(Self::key_from_model).transpose()
    }

    async fn find_user(&self, id: i64) -> Result<Option<User>, StoreError> {
        let m = users::Entity::find_by_id(id)
            .one(&self.conn)
            .await
            .map_err(|_| StoreError::ReadFailed)?;
        m.map(Self::user_from_model).transpose()
    }

    async fn find_user_by_account(&self, account: &str) -> Result<Option<User>, StoreError> {
        let m = users::Entity::find()
            .filter(users::Column::Account.eq(account))
            .one(&self.conn)
            .await
            .map_err(|_| StoreError::ReadFailed)?;
        m.map(Self::user_from_model).transpose()
    }

    async fn find_server_by_name(&self, name: &str) -> Result<Option<Server>, StoreError> {
        let m = servers::Entity::find()
            .filter(servers::Column::Name.eq(name))
            .one(&self.conn)
            .await
            .map_err(|_| StoreError::ReadFailed)?;
        m.map(Self::server_from_model).transpose()
    }

    async fn touch_user(&self, id: i64) -> Result<(), StoreError> {
        let am = users::ActiveModel {
            id: Set(id),
            used_at: Set(Some(fmt_time(Utc::now()))),
            ..Default::default()
        };
        if let Err(e) = am.update(&self.conn).await {
            warn!("failed to touch user {}: {}", id, e);
        }
        Ok(())
    }

    async fn touch_key(&self, id: i64) -> Result<(), StoreError> {
        let am = keys::ActiveModel {
            id: Set(id),
            used_at: Set(Some(fmt_time(Utc::now()))),
            ..Default::default()
        };
        if let Err(e) = am.update(&self.conn).await {
            warn!("failed to touch key {}: {}", id, e);
        }
        Ok(())
    }

    async fn touch_server(&self, id: i64) -> Result<(), StoreError> {
        let am = servers::ActiveModel {
            id: Set(id),
            used_at: Set(Some(fmt_time(Utc::now()))),
            ..Default::default()
        };
        if let Err(e) = am.update(&self.conn).await {
            warn!("failed to touch server {}: {}", id, e);
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
        let rows = grants::Entity::find()
            .filter(grants::Column::UserId.eq(user.id))
            .filter(grants::Column::TargetAccount.eq(target_account))
            .all(&self.conn)
            .await
            .map_err(|_| StoreError::ReadFailed)?;
        for row in rows {
            let grant = Self::grant_from_model(row)?;
            if !grant.is_expired(now) && wildcard_match(&grant.pattern, &server.name) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn combined_grants(&self, user_id: i64) -> Result<Vec<CombinedGrant>, StoreError> {
        let user_grants = self.user_grants(user_id).await?;
        let server_rows = servers::Entity::find()
            .all(&self.conn)
            .await
            .map_err(|_| StoreError::ReadFailed)?;
        let all_servers: Vec<Server> = server_rows
            .into_iter()
            .map(Self::server_from_model)
            .collect::<Result<_, _>>()?;
        Ok(combine_grants(&user_grants, &all_servers, Utc::now()))
    }

    async fn create_session(&self, operator: &str) -> Result<SessionRecord, StoreError> {
        let started_at = Utc::now();
        let am = sessions::ActiveModel {
            user_account: Set(operator.to_string()),
            command: Set(String::new()),
            started_at: Set(fmt_time(started_at)),
            ended_at: Set(None),
            is_recorded: Set(false),
            replay_file: Set(String::new()),
            ..Default::default()
        };
        let res = sessions::Entity::insert(am)
            .exec(&self.conn)
            .await
            .map_err(|_| StoreError::WriteFailed)?;
        let id = res.last_insert_id;
        // the replay path depends on the id the insert produced
        let replay_file = SessionRecord::generate_replay_file(started_at, id);
        let am = sessions::ActiveModel {
            id: Set(id),
            replay_file: Set(replay_file.clone()),
            ..Default::default()
        };
        am.update(&self.conn)
            .await
            .map_err(|_| StoreError::WriteFailed)?;
        Ok(SessionRecord {
            id,
            user_account: operator.to_string(),
            command: String::new(),
            started_at,
            ended_at: None,
            is_recorded: false,
            replay_file,
        })
    }

    async fn update_session_command(&self, id: i64, command: &str) -> Result<(), StoreError> {
        let am = sessions::ActiveModel {
            id: Set(id),
            command: Set(command.to_string()),
            ..Default::default()
        };
        am.update(&self.conn)
            .await
            .map_err(|_| StoreError::WriteFailed)?;
        Ok(())
    }

    async fn update_session_closed(&self, id: i64, recorded: bool) -> Result<(), StoreError> {
        let am = sessions::ActiveModel {
            id: Set(id),
            ended_at: Set(Some(fmt_time(Utc::now()))),
            is_recorded: Set(recorded),
            ..Default::default()
        };
        am.update(&self.conn)
            .await
            .map_err(|_| StoreError::WriteFailed)?;
        Ok(())
    }

    async fn upsert_sandbox_key(
        &self,
        fingerprint: &str,
        account: &str,
    ) -> Result<(), StoreError> {
        let user = self
            .find_user_by_account(account)
            .await?
            .ok_or_else(|| StoreError::InvalidRecord(format!("no user {:?}", account)))?;
        if let Some(existing) = self.find_key(fingerprint).await? {
            if !existing.is_sandbox {
                return Err(StoreError::InvalidRecord(format!(
                    "fingerprint {} already registered as a regular key",
                    fingerprint
                )));
            }
            if existing.user_id == user.id {
                return Ok(());
            }
        }
        keys::Entity::delete_many()
            .filter(keys::Column::UserId.eq(user.id))
            .filter(keys::Column::IsSandbox.eq(true))
            .exec(&self.conn)
            .await
            .map_err(|_| StoreError::WriteFailed)?;
        let am = keys::ActiveModel {
            user_id: Set(user.id),
            name: Set("sandbox".to_string()),
            fingerprint: Set(fingerprint.to_string()),
            is_sandbox: Set(true),
            created_at: Set(fmt_time(Utc::now())),
            used_at: Set(None),
            ..Default::default()
        };
        keys::Entity::insert(am)
            .exec(&self.conn)
            .await
            .map_err(|_| StoreError::WriteFailed)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn temp_store() -> (TempDir, DatabaseStore) {
        let dir = TempDir::new().unwrap();
        let store = DatabaseStore::new_file(dir.path().join("test.sqlite3"))
            .await
            .unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_db_key_and_user_roundtrip() {
        let (_dir, store) = temp_store().await;
        let user = store.add_user("alice", false).await.unwrap();
        store.add_key(user.id, "SHA256:AAA", false).await.unwrap();

        let key = store.find_key("SHA256:AAA").await.unwrap().unwrap();
        assert_eq!(key.user_id, user.id);
        assert!(!key.is_sandbox);
        assert!(store.find_key("SHA256:BBB").await.unwrap().is_none());

        let found = store
            .find_user_by_account("alice")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, user.id);
    }

    #[tokio::test]
    async fn test_db_check_grant() {
        let (_dir, store) = temp_store().await;
        let user = store.add_user("alice", false).await.unwrap();
        let web1 = store.add_server("web1", "10.0.0.5:22").await.unwrap();
        let webdb = store.add_server("webdb", "10.0.0.6:22").await.unwrap();
        store
            .add_grant(user.id, "web*", "deploy", None)
            .await
            .unwrap();

        assert!(store.check_grant(&user, &web1, "deploy").await.unwrap());
        assert!(!store.check_grant(&user, &web1, "root").await.unwrap());

        let bob = store.add_user("bobby", false).await.unwrap();
        store.add_grant(bob.id, "db*", "deploy", None).await.unwrap();
        assert!(!store.check_grant(&bob, &webdb, "deploy").await.unwrap());

        let carol = store.add_user("carol", false).await.unwrap();
        store
            .add_grant(
                carol.id,
                "web1",
                "deploy",
                Some(Utc::now() - chrono::Duration::seconds(1)),
            )
            .await
            .unwrap();
        assert!(!store.check_grant(&carol, &web1, "deploy").await.unwrap());
    }

    #[tokio::test]
    async fn test_db_combined_grants() {
        let (_dir, store) = temp_store().await;
        let user = store.add_user("alice", false).await.unwrap();
        store.add_server("web1", "10.0.0.5:22").await.unwrap();
        store.add_server("web2", "10.0.0.6:22").await.unwrap();
        let soon = Utc::now() + chrono::Duration::hours(1);
        store
            .add_grant(user.id, "web1", "deploy", Some(soon))
            .await
            .unwrap();
        store
            .add_grant(user.id, "web*", "deploy", None)
            .await
            .unwrap();

        let mut combined = store.combined_grants(user.id).await.unwrap();
        combined.sort_by(|a, b| a.server_name.cmp(&b.server_name));
        assert_eq!(combined.len(), 2);
        assert_eq!(combined[0].server_name, "web1");
        assert_eq!(combined[0].expires_at, None);
    }

    #[tokio::test]
    async fn test_db_session_lifecycle() {
        let (_dir, store) = temp_store().await;
        let session = store.create_session("alice").await.unwrap();
        assert!(!session.replay_file.is_empty());
        assert_eq!(
            session.replay_file,
            SessionRecord::generate_replay_file(session.started_at, session.id)
        );

        store
            .update_session_command(session.id, "uptime")
            .await
            .unwrap();
        store.update_session_closed(session.id, false).await.unwrap();

        let m = sessions::Entity::find_by_id(session.id)
            .one(&store.conn)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(m.command, "uptime");
        assert!(m.ended_at.is_some());
        assert!(!m.is_recorded);
    }

    #[tokio::test]
    async fn test_db_upsert_sandbox_key() {
        let (_dir, store) = temp_store().await;
        let user = store.add_user("alice", false).await.unwrap();
        store.add_key(user.id, "SHA256:AAA", false).await.unwrap();

        store.upsert_sandbox_key("SHA256:S1", "alice").await.unwrap();
        store.upsert_sandbox_key("SHA256:S2", "alice").await.unwrap();

        assert!(store.find_key("SHA256:S1").await.unwrap().is_none());
        assert!(store.find_key("SHA256:S2").await.unwrap().unwrap().is_sandbox);
        // the operator's regular key is untouched
        assert!(store.find_key("SHA256:AAA").await.unwrap().is_some());
        // a regular key's fingerprint cannot be converted
        assert!(store.upsert_sandbox_key("SHA256:AAA", "alice").await.is_err());
    }

    #[tokio::test]
    async fn test_db_touch() {
        let (_dir, store) = temp_store().await;
        let user = store.add_user("alice", false).await.unwrap();
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
