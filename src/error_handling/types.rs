use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug)]
pub enum ConfigError {
    IoError(std::io::Error),
    TomlError(String),
    NoListeners,
    InvalidPort(String),
    DuplicatePort(u16),
    BadIPFormatting(String),
    NotInRange(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {}", e),
            ConfigError::TomlError(e) => write!(f, "TOML parsing error: {}", e),
            ConfigError::NoListeners => write!(f, "No listener configured"),
            ConfigError::InvalidPort(e) => write!(f, "Invalid port: {}", e),
            ConfigError::DuplicatePort(p) => write!(f, "Port {} is configured more than once", p),
            ConfigError::BadIPFormatting(e) => write!(f, "IP formatting error: {}", e),
            ConfigError::NotInRange(e) => write!(f, "Value out of range: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::IoError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::IoError(err)
    }
}

/// Listener-level failures. Each one is fatal for a single listener and is
/// reported upward as a status, never as a process abort.
#[derive(Debug)]
pub enum NetworkError {
    /// The port could not be bound (already in use, privileged, invalid).
    BindError { port: u16, source: std::io::Error },
    /// The accept mechanism itself is broken.
    ListenerFailed { port: u16, source: std::io::Error },
}

impl NetworkError {
    pub fn port(&self) -> u16 {
        match self {
            NetworkError::BindError { port, .. } | NetworkError::ListenerFailed { port, .. } => {
                *port
            }
        }
    }
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkError::BindError { port, source } => {
                write!(f, "Unable to bind port {}: {}", port, source)
            }
            NetworkError::ListenerFailed { port, source } => {
                write!(f, "Listener on port {} failed: {}", port, source)
            }
        }
    }
}

impl std::error::Error for NetworkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NetworkError::BindError { source, .. } | NetworkError::ListenerFailed { source, .. } => {
                Some(source)
            }
        }
    }
}

/// Category of a fault raised while handling one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// Bytes that could not be parsed as the emulated protocol.
    Malformed,
    /// A line or header block larger than the emulator accepts.
    Oversized,
    /// Syntactically valid input used out of sequence.
    ProtocolViolation,
    /// The stream itself failed (reset, broken pipe).
    Io,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FaultKind::Malformed => "malformed",
            FaultKind::Oversized => "oversized",
            FaultKind::ProtocolViolation => "protocol_violation",
            FaultKind::Io => "io",
        };
        f.write_str(s)
    }
}

/// Fault confined to a single connection session. Always resolved by
/// terminating that session with a terminal record describing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionFault {
    pub kind: FaultKind,
    pub detail: String,
}

impl SessionFault {
    pub fn new(kind: FaultKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn malformed(detail: impl Into<String>) -> Self {
        Self::new(FaultKind::Malformed, detail)
    }

    pub fn oversized(detail: impl Into<String>) -> Self {
        Self::new(FaultKind::Oversized, detail)
    }
}

impl fmt::Display for SessionFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Session fault ({}): {}", self.kind, self.detail)
    }
}

impl std::error::Error for SessionFault {}

impl From<std::io::Error> for SessionFault {
    fn from(err: std::io::Error) -> Self {
        SessionFault::new(FaultKind::Io, err.to_string())
    }
}

/// Persistence backend failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    Unavailable(String),
    WriteFailed(String),
    ReadFailed(String),
    Corrupt(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Unavailable(e) => write!(f, "Storage unavailable: {}", e),
            StorageError::WriteFailed(e) => write!(f, "Storage write failed: {}", e),
            StorageError::ReadFailed(e) => write!(f, "Storage read failed: {}", e),
            StorageError::Corrupt(e) => write!(f, "Storage entry corrupt: {}", e),
        }
    }
}

impl std::error::Error for StorageError {}

#[derive(Debug)]
pub enum ControllerError {
    ConfigurationError(ConfigError),
    StorageError(StorageError),
    NoListenerRunning,
}

impl fmt::Display for ControllerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerError::ConfigurationError(e) => write!(f, "Configuration error: {}", e),
            ControllerError::StorageError(e) => write!(f, "Storage error: {}", e),
            ControllerError::NoListenerRunning => write!(f, "No listener could be started"),
        }
    }
}

impl std::error::Error for ControllerError {}

impl From<ConfigError> for ControllerError {
    fn from(err: ConfigError) -> Self {
        ControllerError::ConfigurationError(err)
    }
}

impl From<StorageError> for ControllerError {
    fn from(err: StorageError) -> Self {
        ControllerError::StorageError(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_network_error_reports_port() {
        let err = NetworkError::BindError {
            port: 2121,
            source: io::Error::new(io::ErrorKind::AddrInUse, "in use"),
        };
        assert_eq!(err.port(), 2121);
        assert!(err.to_string().contains("2121"));
    }

    #[test]
    fn test_io_error_becomes_io_fault() {
        let fault: SessionFault = io::Error::new(io::ErrorKind::ConnectionReset, "reset").into();
        assert_eq!(fault.kind, FaultKind::Io);
        assert_eq!(fault.to_string(), "Session fault (io): reset");
    }
}
