use chrono::{DateTime, Datelike, Utc};
use std::path::PathBuf;

/// Checks the general name charset shared by user accounts and server
/// names: a leading letter followed by letters, digits, `.`, `_` or
/// `-`, 4 to 16 characters in total.
pub fn valid_name(name: &str) -> bool {
    let len = name.chars().count();
    if !(4..=16).contains(&len) {
        return false;
    }
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
}

/// Matches `name` against `pattern`, where `*` matches any sequence
/// of characters (including the empty one). Used for grant target
/// patterns over server names.
pub fn wildcard_match(pattern: &str, name: &str) -> bool {
    let pat: Vec<char> = pattern.chars().collect();
    let txt: Vec<char> = name.chars().collect();
    // classic two-pointer wildcard walk with backtracking to the last star
    let (mut p, mut t) = (0usize, 0usize);
    let (mut star, mut mark) = (None::<usize>, 0usize);
    while t < txt.len() {
        if p < pat.len() && (pat[p] == txt[t]) {
            p += 1;
            t += 1;
        } else if p < pat.len() && pat[p] == '*' {
            star = Some(p);
            mark = t;
            p += 1;
        } else if let Some(s) = star {
            p = s + 1;
            mark += 1;
            t = mark;
        } else {
            return false;
        }
    }
    while p < pat.len() && pat[p] == '*' {
        p += 1;
    }
    p == pat.len()
}

/// An operator account known to the bastion.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: i64,
    pub account: String,
    pub password_digest: String,
    pub is_admin: bool,
    pub is_blocked: bool,
    pub created_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
}

impl User {
    /// Replaces the password digest. bcrypt output is self-describing
    /// text, no further encoding needed.
    pub fn set_password(&mut self, password: &str) -> Result<(), bcrypt::BcryptError> {
        self.password_digest = bcrypt::hash(password, bcrypt::DEFAULT_COST)?;
        Ok(())
    }

    pub fn check_password(&self, password: &str) -> bool {
        bcrypt::verify(password, &self.password_digest).unwrap_or(false)
    }
}

/// An SSH public key registered for a user, identified by its SHA-256
/// fingerprint. Keys generated inside a sandbox carry `is_sandbox`
/// and are only usable from the sandbox host address.
#[derive(Debug, Clone, PartialEq)]
pub struct PublicKey {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub fingerprint: String,
    pub is_sandbox: bool,
    pub created_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
}

/// A reachable target host.
#[derive(Debug, Clone, PartialEq)]
pub struct Server {
    pub id: i64,
    pub name: String,
    /// `host:port` of the target's SSH endpoint.
    pub address: String,
    /// Set for servers imported by service discovery; such servers
    /// cannot be deleted while the flag holds.
    pub is_auto: bool,
    pub created_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
}

/// A rule authorising one user to act as `target_account` on every
/// server whose name matches `pattern` (`*` wildcard), optionally
/// bounded in time.
#[derive(Debug, Clone, PartialEq)]
pub struct Grant {
    pub id: i64,
    pub user_id: i64,
    pub pattern: String,
    pub target_account: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Grant {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(t) if t <= now)
    }
}

/// One row of the de-duplicated grants view: a (server, account) pair
/// the operator can reach, with the latest expiry among contributing
/// grants (`None` meaning permanent, which dominates).
#[derive(Debug, Clone, PartialEq)]
pub struct CombinedGrant {
    pub server_name: String,
    pub target_account: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Expands a user's non-expired grants against the current server set
/// and folds them into one row per (server, account) pair, keeping the
/// latest expiry. A permanent grant (`expires_at == None`) dominates
/// every bounded one.
pub fn combine_grants(
    grants: &[Grant],
    servers: &[Server],
    now: DateTime<Utc>,
) -> Vec<CombinedGrant> {
    let mut out: Vec<CombinedGrant> = Vec::new();
    for grant in grants.iter().filter(|g| !g.is_expired(now)) {
        for server in servers.iter().filter(|s| wildcard_match(&grant.pattern, &s.name)) {
            match out
                .iter_mut()
                .find(|c| c.server_name == server.name && c.target_account == grant.target_account)
            {
                Some(existing) => {
                    let later = match (existing.expires_at, grant.expires_at) {
                        (None, _) | (_, None) => None,
                        (Some(a), Some(b)) => Some(a.max(b)),
                    };
                    existing.expires_at = later;
                }
                None => out.push(CombinedGrant {
                    server_name: server.name.clone(),
                    target_account: grant.target_account.clone(),
                    expires_at: grant.expires_at,
                }),
            }
        }
    }
    out
}

/// A recorded interactive session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub id: i64,
    pub user_account: String,
    pub command: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub is_recorded: bool,
    pub replay_file: String,
}

impl SessionRecord {
    /// Relative replay file path, deterministic from the start time
    /// and session id: `YYYY/MM/DD/<id-as-8-hex>`.
    pub fn generate_replay_file(started_at: DateTime<Utc>, id: i64) -> String {
        let mut path = PathBuf::new();
        path.push(format!("{:04}", started_at.year()));
        path.push(format!("{:02}", started_at.month()));
        path.push(format!("{:02}", started_at.day()));
        path.push(format!("{:08x}", id as u32));
        path.to_string_lossy().into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_valid_name() {
        assert!(valid_name("alice"));
        assert!(valid_name("web1.prod"));
        assert!(valid_name("a_b-c.d"));
        assert!(!valid_name("abc")); // too short
        assert!(!valid_name("1abcd")); // digit-led
        assert!(!valid_name("_abcd")); // symbol-led
        assert!(!valid_name("ab cd")); // space
        assert!(!valid_name("abcdefghijklmnopq")); // 17 chars
        assert!(valid_name("abcdefghijklmnop")); // 16 chars
    }

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match("web*", "web1"));
        assert!(wildcard_match("web*", "web"));
        assert!(wildcard_match("db*", "db7"));
        assert!(!wildcard_match("db*", "webdb"));
        assert!(wildcard_match("*", "anything"));
        assert!(wildcard_match("*db*", "webdb7"));
        assert!(wildcard_match("w*1", "web1"));
        assert!(!wildcard_match("w*1", "web2"));
        assert!(wildcard_match("web1", "web1"));
        assert!(!wildcard_match("web1", "web12"));
        assert!(!wildcard_match("", "x"));
        assert!(wildcard_match("", ""));
    }

    #[test]
    fn test_replay_file_path() {
        let t = Utc.with_ymd_and_hms(2018, 3, 9, 12, 0, 0).unwrap();
        assert_eq!(
            SessionRecord::generate_replay_file(t, 0x1234),
            "2018/03/09/00001234"
        );
        // deterministic
        assert_eq!(
            SessionRecord::generate_replay_file(t, 0x1234),
            SessionRecord::generate_replay_file(t, 0x1234)
        );
    }

    #[test]
    fn test_grant_expiry() {
        let now = Utc::now();
        let g = Grant {
            id: 1,
            user_id: 1,
            pattern: "web*".into(),
            target_account: "deploy".into(),
            expires_at: None,
            created_at: now,
        };
        assert!(!g.is_expired(now));
        let expired = Grant {
            expires_at: Some(now - chrono::Duration::seconds(1)),
            ..g.clone()
        };
        assert!(expired.is_expired(now));
        let future = Grant {
            expires_at: Some(now + chrono::Duration::seconds(60)),
            ..g
        };
        assert!(!future.is_expired(now));
    }

    fn server(id: i64, name: &str) -> Server {
        Server {
            id,
            name: name.into(),
            address: format!("10.0.0.{}:22", id),
            is_auto: false,
            created_at: Utc::now(),
            used_at: None,
        }
    }

    fn grant(pattern: &str, account: &str, expires_at: Option<DateTime<Utc>>) -> Grant {
        Grant {
            id: 0,
            user_id: 1,
            pattern: pattern.into(),
            target_account: account.into(),
            expires_at,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_combine_grants_dedup_and_max_expiry() {
        let now = Utc::now();
        let soon = Some(now + chrono::Duration::hours(1));
        let later = Some(now + chrono::Duration::hours(2));
        let servers = vec![server(1, "web1"), server(2, "web2"), server(3, "db1")];

        // two overlapping grants onto web1: the later expiry wins
        let grants = vec![
            grant("web1", "deploy", soon),
            grant("web*", "deploy", later),
        ];
        let combined = combine_grants(&grants, &servers, now);
        assert_eq!(combined.len(), 2); // web1 + web2, deduped
        let web1 = combined.iter().find(|c| c.server_name == "web1").unwrap();
        assert_eq!(web1.expires_at, later);
    }

    #[test]
    fn test_combine_grants_permanent_dominates() {
        let now = Utc::now();
        let soon = Some(now + chrono::Duration::hours(1));
        let servers = vec![server(1, "web1")];
        let grants = vec![
            grant("web1", "deploy", soon),
            grant("web*", "deploy", None),
        ];
        let combined = combine_grants(&grants, &servers, now);
        assert_eq!(combined.len(), 1);
        assert_eq!(combined[0].expires_at, None);
    }

    #[test]
    fn test_combine_grants_skips_expired() {
        let now = Utc::now();
        let grants = vec![grant("web*", "deploy", Some(now - chrono::Duration::seconds(1)))];
        let servers = vec![server(1, "web1")];
        assert!(combine_grants(&grants, &servers, now).is_empty());
    }

    #[test]
    fn test_combine_grants_distinct_accounts_kept() {
        let now = Utc::now();
        let servers = vec![server(1, "web1")];
        let grants = vec![grant("web1", "deploy", None), grant("web1", "ops", None)];
        assert_eq!(combine_grants(&grants, &servers, now).len(), 2);
    }

    #[test]
    fn test_password_digest_roundtrip() {
        let mut u = User {
            id: 1,
            account: "alice".into(),
            password_digest: String::new(),
            is_admin: false,
            is_blocked: false,
            created_at: Utc::now(),
            used_at: None,
        };
        u.set_password("hunter22").unwrap();
        assert!(u.check_password("hunter22"));
        assert!(!u.check_password("hunter23"));
    }
}
