use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Identifies which protocol emulator handles a listener's connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolTag {
    Ftp,
    Shell,
    Http,
}

impl ProtocolTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolTag::Ftp => "ftp",
            ProtocolTag::Shell => "shell",
            ProtocolTag::Http => "http",
        }
    }
}

impl fmt::Display for ProtocolTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolTag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ftp" => Ok(ProtocolTag::Ftp),
            "shell" | "telnet" => Ok(ProtocolTag::Shell),
            "http" | "web" => Ok(ProtocolTag::Http),
            other => Err(format!("unknown protocol '{}'", other)),
        }
    }
}

fn default_raw_excerpt_cap() -> usize {
    512
}

fn default_max_records_per_session() -> usize {
    64
}

/// Static configuration of one listener, loaded once at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub port: u16,
    pub protocol: ProtocolTag,
    pub max_concurrent_connections: usize,
    pub per_connection_timeout_secs: u64,
    pub per_connection_byte_cap: u64,
    /// Upper bound on the raw bytes copied into each record.
    #[serde(default = "default_raw_excerpt_cap")]
    pub raw_excerpt_cap: usize,
    /// Intermediate records one session may publish. Later interactions are
    /// only counted in the terminal record.
    #[serde(default = "default_max_records_per_session")]
    pub max_records_per_session: usize,
    /// Replaces the emulator's default greeting when set.
    #[serde(default)]
    pub banner: Option<String>,
}

impl ListenerConfig {
    pub fn new(port: u16, protocol: ProtocolTag) -> Self {
        Self {
            port,
            protocol,
            max_concurrent_connections: 64,
            per_connection_timeout_secs: 30,
            per_connection_byte_cap: 64 * 1024,
            raw_excerpt_cap: default_raw_excerpt_cap(),
            max_records_per_session: default_max_records_per_session(),
            banner: None,
        }
    }

    pub fn per_connection_timeout(&self) -> Duration {
        Duration::from_secs(self.per_connection_timeout_secs)
    }
}

fn default_subscriber_buffer() -> usize {
    256
}

fn default_persistence_queue() -> usize {
    1024
}

fn default_persistence_max_attempts() -> u32 {
    3
}

fn default_persistence_backoff_ms() -> u64 {
    100
}

fn default_alert_buffer() -> usize {
    64
}

/// Sizing and retry budget of the event sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Outstanding records kept per live subscriber before the oldest is evicted.
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
    /// Records waiting for the persistence worker.
    #[serde(default = "default_persistence_queue")]
    pub persistence_queue: usize,
    #[serde(default = "default_persistence_max_attempts")]
    pub persistence_max_attempts: u32,
    /// Delay before the first retry; doubled on each subsequent attempt.
    #[serde(default = "default_persistence_backoff_ms")]
    pub persistence_backoff_ms: u64,
    #[serde(default = "default_alert_buffer")]
    pub alert_buffer: usize,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: default_subscriber_buffer(),
            persistence_queue: default_persistence_queue(),
            persistence_max_attempts: default_persistence_max_attempts(),
            persistence_backoff_ms: default_persistence_backoff_ms(),
            alert_buffer: default_alert_buffer(),
        }
    }
}

impl SinkConfig {
    pub fn persistence_backoff(&self) -> Duration {
        Duration::from_millis(self.persistence_backoff_ms)
    }
}
