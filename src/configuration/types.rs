use serde::Deserialize;
use std::path::PathBuf;

/// Storage backend options for the bastion.
#[derive(Debug, PartialEq, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Database,
    Memory,
}

impl Default for StoreBackend {
    fn default() -> Self {
        Self::Database
    }
}

#[derive(Debug, PartialEq, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Which backend to persist into.
    pub backend: StoreBackend,
    /// SQLite database file, used by the `database` backend.
    pub db_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            db_path: PathBuf::from("gatehouse.sqlite3"),
        }
    }
}

/// Settings for the inbound SSH front door.
#[derive(Debug, PartialEq, Clone, Deserialize)]
#[serde(default)]
pub struct SshdConfig {
    /// Address to bind the listener to.
    pub host: String,
    /// Port to bind the listener to.
    pub port: u16,
    /// OpenSSH PEM private key presented as the bastion host key.
    pub host_key: PathBuf,
    /// OpenSSH PEM private key used to authenticate the outbound hop.
    pub client_key: PathBuf,
    /// Root directory for session replay files.
    pub replay_dir: PathBuf,
}

impl Default for SshdConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 2222,
            host_key: PathBuf::from("host_key"),
            client_key: PathBuf::from("client_key"),
            replay_dir: PathBuf::from("replays"),
        }
    }
}

/// Settings for the per-operator sandbox containers.
#[derive(Debug, PartialEq, Clone, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Address of the bastion as seen from inside a sandbox. Inbound
    /// connections whose local address equals this one are treated as
    /// coming from a sandbox.
    pub host: String,
    /// Container image the sandboxes are created from.
    pub image: String,
    /// Directory holding per-account data directories and the shared
    /// directory, bind-mounted into the containers.
    pub data_dir: PathBuf,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            image: "gatehouse-sandbox".to_string(),
            data_dir: PathBuf::from("sandboxes"),
        }
    }
}
