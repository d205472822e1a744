//! Helpers for building `EventFilter` values.
//!
//! This module re-exports `EventFilter` and provides convenience builders
//! for common query criteria.

use chrono::{DateTime, Utc};
use std::net::IpAddr;

use crate::configuration::types::ProtocolTag;
pub use crate::storage::types::EventFilter;

/// Build an `EventFilter` that matches records from one protocol emulator.
pub fn by_protocol(protocol: ProtocolTag) -> EventFilter {
    EventFilter {
        protocol: Some(protocol),
        ..Default::default()
    }
}

/// Build an `EventFilter` that matches records from one remote IP.
pub fn by_source_ip(ip: IpAddr) -> EventFilter {
    EventFilter {
        source_ip: Some(ip),
        ..Default::default()
    }
}

/// Build an `EventFilter` that matches records received on one local port.
pub fn by_port(port: u16) -> EventFilter {
    EventFilter {
        port: Some(port),
        ..Default::default()
    }
}

/// Build an `EventFilter` over the half-open range `[since, until)`.
pub fn between(since: DateTime<Utc>, until: DateTime<Utc>) -> EventFilter {
    EventFilter {
        since: Some(since),
        until: Some(until),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventRecord, Summary};
    use chrono::Duration;
    use uuid::Uuid;

    fn record(ip: &str, protocol: ProtocolTag, port: u16) -> EventRecord {
        EventRecord {
            id: 1,
            session_id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            source_address: format!("{}:40000", ip).parse().unwrap(),
            protocol,
            port,
            summary: Summary::new(),
            raw_excerpt: Vec::new(),
            termination: None,
        }
    }

    #[test]
    fn test_default_filter_matches_everything() {
        let rec = record("198.51.100.7", ProtocolTag::Ftp, 21);
        assert!(EventFilter::default().matches(&rec));
    }

    #[test]
    fn test_single_criteria() {
        let rec = record("198.51.100.7", ProtocolTag::Ftp, 21);

        assert!(by_protocol(ProtocolTag::Ftp).matches(&rec));
        assert!(!by_protocol(ProtocolTag::Http).matches(&rec));
        assert!(by_source_ip("198.51.100.7".parse().unwrap()).matches(&rec));
        assert!(!by_source_ip("198.51.100.8".parse().unwrap()).matches(&rec));
        assert!(by_port(21).matches(&rec));
        assert!(!by_port(22).matches(&rec));
    }

    #[test]
    fn test_time_range_is_half_open() {
        let rec = record("198.51.100.7", ProtocolTag::Shell, 23);
        let at = rec.occurred_at;

        assert!(between(at, at + Duration::seconds(1)).matches(&rec));
        assert!(!between(at - Duration::seconds(1), at).matches(&rec));
    }
}
