#[derive(Debug)]
pub enum ConfigError {
    IoError(std::io::Error),
    ParseError(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(err) => write!(f, "failed to read configuration: {}", err),
            ConfigError::ParseError(err) => write!(f, "failed to parse configuration: {}", err),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::IoError(err)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::ParseError(err)
    }
}

#[derive(Debug)]
pub enum StoreError {
    ConnectionFailed,
    ReadFailed,
    WriteFailed,
    InvalidRecord(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::ConnectionFailed => write!(f, "store connection failed"),
            StoreError::ReadFailed => write!(f, "store read failed"),
            StoreError::WriteFailed => write!(f, "store write failed"),
            StoreError::InvalidRecord(msg) => write!(f, "invalid record: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<sea_orm::DbErr> for StoreError {
    fn from(_: sea_orm::DbErr) -> Self {
        StoreError::ReadFailed
    }
}

/// Authentication rejections surfaced to the SSH client. The display
/// strings are the exact reason codes logged on rejection; nothing
/// about the store internals leaks through them.
#[derive(Debug, PartialEq, Eq)]
pub enum AuthError {
    UnknownKey,
    UnknownOrBlockedUser,
    SandboxKeyMisuse,
    TargetNotFound,
    NoPermission,
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::UnknownKey => write!(f, "unknown-key"),
            AuthError::UnknownOrBlockedUser => write!(f, "unknown-or-blocked-user"),
            AuthError::SandboxKeyMisuse => write!(f, "sandbox-key-misuse"),
            AuthError::TargetNotFound => write!(f, "target-not-found"),
            AuthError::NoPermission => write!(f, "no-permission"),
        }
    }
}

impl std::error::Error for AuthError {}

#[derive(Debug)]
pub enum SandboxError {
    RuntimeNotAvailable,
    CreationFailed(String),
    StartFailed(String),
    ExecFailed(String),
    IoError(std::io::Error),
}

impl std::fmt::Display for SandboxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SandboxError::RuntimeNotAvailable => write!(f, "container runtime is not available"),
            SandboxError::CreationFailed(msg) => write!(f, "sandbox creation failed: {}", msg),
            SandboxError::StartFailed(msg) => write!(f, "sandbox start failed: {}", msg),
            SandboxError::ExecFailed(msg) => write!(f, "sandbox exec failed: {}", msg),
            SandboxError::IoError(err) => write!(f, "IO error: {}", err),
        }
    }
}

impl std::error::Error for SandboxError {}

impl From<std::io::Error> for SandboxError {
    fn from(err: std::io::Error) -> Self {
        SandboxError::IoError(err)
    }
}

impl From<bollard::errors::Error> for SandboxError {
    fn from(err: bollard::errors::Error) -> Self {
        SandboxError::ExecFailed(err.to_string())
    }
}

#[derive(Debug)]
pub enum SshdError {
    AlreadyRunning,
    BindError(std::io::Error),
    KeyError(String),
    SshError(russh::Error),
    StoreError(StoreError),
    SandboxError(SandboxError),
}

impl std::fmt::Display for SshdError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SshdError::AlreadyRunning => write!(f, "sshd is already running"),
            SshdError::BindError(err) => write!(f, "failed to bind listener: {}", err),
            SshdError::KeyError(msg) => write!(f, "key error: {}", msg),
            SshdError::SshError(err) => write!(f, "ssh error: {}", err),
            SshdError::StoreError(err) => write!(f, "store error: {}", err),
            SshdError::SandboxError(err) => write!(f, "sandbox error: {}", err),
        }
    }
}

impl std::error::Error for SshdError {}

impl From<russh::Error> for SshdError {
    fn from(err: russh::Error) -> Self {
        SshdError::SshError(err)
    }
}

impl From<StoreError> for SshdError {
    fn from(err: StoreError) -> Self {
        SshdError::StoreError(err)
    }
}

impl From<SandboxError> for SshdError {
    fn from(err: SandboxError) -> Self {
        SshdError::SandboxError(err)
    }
}
