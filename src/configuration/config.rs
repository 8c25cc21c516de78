use super::types::{SandboxConfig, SshdConfig, StoreConfig};
use crate::error_handling::types::ConfigError;
use serde::Deserialize;
use std::path::Path;

/// Application configuration, decoded from a TOML file.
///
/// Every section has a default so a minimal (even empty) file is
/// enough to boot against a local database with generated paths.
///
/// # Fields Overview
///
/// - `sshd`: listener address, host/client key paths, replay root
/// - `sandbox`: sandbox host address, container image, data directory
/// - `store`: persistence backend selection
#[derive(Debug, PartialEq, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sshd: SshdConfig,
    pub sandbox: SandboxConfig,
    pub store: StoreConfig,
}

impl Config {
    /// Reads and decodes the configuration from `path`.
    pub fn from_file(path: &Path) -> Result<Config, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config = toml::from_str(&raw)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        write!(
            f,
            r#"
[sshd]
host = "127.0.0.1"
port = 2022
replay_dir = "/var/lib/gatehouse/replays"

[sandbox]
host = "10.1.2.3"
image = "sandbox:latest"

[store]
backend = "memory"
"#
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.sshd.host, "127.0.0.1");
        assert_eq!(config.sshd.port, 2022);
        assert_eq!(
            config.sshd.replay_dir,
            std::path::PathBuf::from("/var/lib/gatehouse/replays")
        );
        assert_eq!(config.sandbox.host, "10.1.2.3");
        assert_eq!(config.sandbox.image, "sandbox:latest");
        assert_eq!(config.store.backend, super::super::types::StoreBackend::Memory);
        // untouched sections keep their defaults
        assert_eq!(config.sshd.host_key, std::path::PathBuf::from("host_key"));
    }

    #[test]
    fn test_from_file_empty_is_default() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_file_missing() {
        let result = Config::from_file(Path::new("/nonexistent/config.toml"));
        assert!(matches!(
            result,
            Err(crate::error_handling::types::ConfigError::IoError(_))
        ));
    }
}
