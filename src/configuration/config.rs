use super::types::*;
use crate::error_handling::types::ConfigError;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_bind_address() -> String {
    String::from("0.0.0.0")
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("./leurre-data")
}

fn default_shutdown_grace_ms() -> u64 {
    2000
}

/// Application configuration loaded from a TOML file.
///
/// # Fields Overview
///
/// - `bind_address`: IP address every listener binds to
/// - `storage_path`: directory holding the persisted event log
/// - `shutdown_grace_ms`: how long in-flight sessions get to emit their closing
///   record when a listener stops, before they are aborted
/// - `retention_days`: when set, records older than this are purged at startup
/// - `sink`: event sink sizing and persistence retry budget
/// - `listeners`: one entry per port to impersonate
///
/// # Examples
///
/// ```
/// use leurre::configuration::config::Config;
///
/// let config = Config::from_toml_str(r#"
///     [[listeners]]
///     port = 8080
///     protocol = "http"
///     max_concurrent_connections = 32
///     per_connection_timeout_secs = 10
///     per_connection_byte_cap = 16384
/// "#).unwrap();
/// assert_eq!(config.listeners[0].port, 8080);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,

    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    #[serde(default)]
    pub retention_days: Option<u32>,

    #[serde(default)]
    pub sink: SinkConfig,

    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
}

impl Config {
    /// Reads, parses and validates a configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!("Reading configuration from {}", path.display());
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parses and validates a configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::TomlError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bind_ip()?;

        if self.listeners.is_empty() {
            return Err(ConfigError::NoListeners);
        }

        if self.sink.subscriber_buffer == 0 {
            return Err(ConfigError::NotInRange(
                "sink.subscriber_buffer must be at least 1".to_string(),
            ));
        }
        if self.sink.persistence_queue == 0 {
            return Err(ConfigError::NotInRange(
                "sink.persistence_queue must be at least 1".to_string(),
            ));
        }
        if self.sink.persistence_max_attempts == 0 {
            return Err(ConfigError::NotInRange(
                "sink.persistence_max_attempts must be at least 1".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for listener in &self.listeners {
            if listener.port == 0 {
                return Err(ConfigError::InvalidPort(format!(
                    "port 0 is not allowed for the {} listener",
                    listener.protocol
                )));
            }
            if !seen.insert(listener.port) {
                return Err(ConfigError::DuplicatePort(listener.port));
            }
            if listener.max_concurrent_connections == 0 {
                return Err(ConfigError::NotInRange(format!(
                    "max_concurrent_connections of port {} must be at least 1",
                    listener.port
                )));
            }
            if listener.per_connection_timeout_secs == 0 {
                return Err(ConfigError::NotInRange(format!(
                    "per_connection_timeout_secs of port {} must be at least 1",
                    listener.port
                )));
            }
            if listener.per_connection_byte_cap == 0 {
                return Err(ConfigError::NotInRange(format!(
                    "per_connection_byte_cap of port {} must be at least 1",
                    listener.port
                )));
            }
            if listener.max_records_per_session == 0 {
                return Err(ConfigError::NotInRange(format!(
                    "max_records_per_session of port {} must be at least 1",
                    listener.port
                )));
            }
        }

        Ok(())
    }

    pub fn bind_ip(&self) -> Result<IpAddr, ConfigError> {
        self.bind_address
            .parse()
            .map_err(|_| ConfigError::BadIPFormatting(self.bind_address.clone()))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"
bind_address = "127.0.0.1"
storage_path = "/tmp/leurre"
retention_days = 7

[sink]
subscriber_buffer = 8
persistence_max_attempts = 5

[[listeners]]
port = 2121
protocol = "ftp"
max_concurrent_connections = 4
per_connection_timeout_secs = 30
per_connection_byte_cap = 4096
banner = "220 (vsFTPd 3.0.3)\r\n"

[[listeners]]
port = 8080
protocol = "http"
max_concurrent_connections = 16
per_connection_timeout_secs = 5
per_connection_byte_cap = 16384
raw_excerpt_cap = 128
"#;

    #[test]
    fn test_from_toml_str() {
        let config = Config::from_toml_str(SAMPLE).unwrap();

        assert_eq!(config.bind_ip().unwrap().to_string(), "127.0.0.1");
        assert_eq!(config.storage_path, PathBuf::from("/tmp/leurre"));
        assert_eq!(config.retention_days, Some(7));
        assert_eq!(config.shutdown_grace_ms, 2000);
        assert_eq!(config.sink.subscriber_buffer, 8);
        assert_eq!(config.sink.persistence_max_attempts, 5);
        assert_eq!(config.sink.persistence_queue, 1024);

        assert_eq!(config.listeners.len(), 2);
        let ftp = &config.listeners[0];
        assert_eq!(ftp.protocol, ProtocolTag::Ftp);
        assert_eq!(ftp.raw_excerpt_cap, 512);
        assert_eq!(ftp.max_records_per_session, 64);
        assert_eq!(ftp.banner.as_deref(), Some("220 (vsFTPd 3.0.3)\r\n"));
        let http = &config.listeners[1];
        assert_eq!(http.protocol, ProtocolTag::Http);
        assert_eq!(http.raw_excerpt_cap, 128);
        assert_eq!(http.per_connection_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.listeners.len(), 2);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = Config::from_file(Path::new("/nonexistent/leurre.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::IoError(_)));
    }

    #[test]
    fn test_rejects_empty_listener_list() {
        let err = Config::from_toml_str("bind_address = \"0.0.0.0\"").unwrap_err();
        assert!(matches!(err, ConfigError::NoListeners));
    }

    #[test]
    fn test_rejects_duplicate_ports() {
        let mut config = Config::from_toml_str(SAMPLE).unwrap();
        config.listeners[1].port = 2121;
        assert!(matches!(config.validate(), Err(ConfigError::DuplicatePort(2121))));
    }

    #[test]
    fn test_rejects_port_zero_and_zero_limits() {
        let mut config = Config::from_toml_str(SAMPLE).unwrap();
        config.listeners[0].port = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidPort(_))));

        let mut config = Config::from_toml_str(SAMPLE).unwrap();
        config.listeners[0].max_concurrent_connections = 0;
        assert!(matches!(config.validate(), Err(ConfigError::NotInRange(_))));

        let mut config = Config::from_toml_str(SAMPLE).unwrap();
        config.sink.persistence_max_attempts = 0;
        assert!(matches!(config.validate(), Err(ConfigError::NotInRange(_))));

        let mut config = Config::from_toml_str(SAMPLE).unwrap();
        config.listeners[1].max_records_per_session = 0;
        assert!(matches!(config.validate(), Err(ConfigError::NotInRange(_))));
    }

    #[test]
    fn test_rejects_bad_bind_address() {
        let mut config = Config::from_toml_str(SAMPLE).unwrap();
        config.bind_address = "not-an-ip".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::BadIPFormatting(_))));
    }

    #[test]
    fn test_rejects_unknown_protocol() {
        let text = SAMPLE.replace("protocol = \"ftp\"", "protocol = \"gopher\"");
        assert!(matches!(
            Config::from_toml_str(&text),
            Err(ConfigError::TomlError(_))
        ));
    }

    #[test]
    fn test_protocol_tag_from_str() {
        assert_eq!("telnet".parse::<ProtocolTag>().unwrap(), ProtocolTag::Shell);
        assert_eq!("HTTP".parse::<ProtocolTag>().unwrap(), ProtocolTag::Http);
        assert!("smtp".parse::<ProtocolTag>().is_err());
    }
}
