use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use uuid::Uuid;

use super::summary::Summary;
use crate::configuration::types::ProtocolTag;
use crate::error_handling::types::SessionFault;

/// Why a connection session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "kebab-case")]
pub enum TerminationReason {
    NormalClose,
    Timeout,
    QuotaExceeded,
    Fault(SessionFault),
}

impl TerminationReason {
    pub fn label(&self) -> &'static str {
        match self {
            TerminationReason::NormalClose => "normal-close",
            TerminationReason::Timeout => "timeout",
            TerminationReason::QuotaExceeded => "quota-exceeded",
            TerminationReason::Fault(_) => "fault",
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::Fault(fault) => write!(f, "fault ({})", fault.kind),
            other => f.write_str(other.label()),
        }
    }
}

/// Which side closed the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClosedBy {
    Peer,
    Emulator,
    Listener,
}

/// Outcome attached to the last record of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Termination {
    #[serde(flatten)]
    pub reason: TerminationReason,
    pub closed_by: ClosedBy,
    pub bytes_received: u64,
}

/// Immutable unit of observation.
///
/// Records are shared as `Arc<EventRecord>` once published; nothing downstream
/// edits them in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: u64,
    pub session_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub source_address: SocketAddr,
    pub protocol: ProtocolTag,
    pub port: u16,
    pub summary: Summary,
    pub raw_excerpt: Vec<u8>,
    /// Present only on the terminal record of a session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination: Option<Termination>,
}

impl EventRecord {
    pub fn is_terminal(&self) -> bool {
        self.termination.is_some()
    }

    pub fn termination_reason(&self) -> Option<&TerminationReason> {
        self.termination.as_ref().map(|t| &t.reason)
    }

    /// Ordering used across sessions: `occurred_at`, then `id`.
    pub fn order_key(&self) -> (DateTime<Utc>, u64) {
        (self.occurred_at, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_handling::types::FaultKind;

    fn record(id: u64, termination: Option<Termination>) -> EventRecord {
        EventRecord {
            id,
            session_id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            source_address: "203.0.113.45:51234".parse().unwrap(),
            protocol: ProtocolTag::Http,
            port: 8080,
            summary: Summary::new().with("request_line", "GET / HTTP/1.0"),
            raw_excerpt: b"GET / HTTP/1.0\r\n\r\n".to_vec(),
            termination,
        }
    }

    #[test]
    fn test_termination_serializes_flat() {
        let rec = record(
            1,
            Some(Termination {
                reason: TerminationReason::Fault(SessionFault::new(FaultKind::Malformed, "bad")),
                closed_by: ClosedBy::Listener,
                bytes_received: 12,
            }),
        );
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["termination"]["reason"], "fault");
        assert_eq!(json["termination"]["kind"], "malformed");
        assert_eq!(json["termination"]["closed_by"], "listener");

        let back: EventRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, rec);
    }

    #[test]
    fn test_intermediate_record_has_no_termination() {
        let rec = record(2, None);
        assert!(!rec.is_terminal());
        let json = serde_json::to_value(&rec).unwrap();
        assert!(json.get("termination").is_none());
    }

    #[test]
    fn test_order_key_breaks_ties_by_id() {
        let a = record(3, None);
        let mut b = record(4, None);
        b.occurred_at = a.occurred_at;
        assert!(a.order_key() < b.order_key());
    }
}
