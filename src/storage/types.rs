use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::configuration::types::ProtocolTag;
use crate::event::EventRecord;

/// Criteria for historical queries. Unset fields match everything.
///
/// The time range is half-open: `since <= occurred_at < until`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFilter {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub source_ip: Option<IpAddr>,
    pub protocol: Option<ProtocolTag>,
    pub port: Option<u16>,
}

impl EventFilter {
    pub fn matches(&self, record: &EventRecord) -> bool {
        if let Some(since) = self.since {
            if record.occurred_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if record.occurred_at >= until {
                return false;
            }
        }
        if let Some(ip) = self.source_ip {
            if record.source_address.ip() != ip {
                return false;
            }
        }
        if let Some(protocol) = self.protocol {
            if record.protocol != protocol {
                return false;
            }
        }
        if let Some(port) = self.port {
            if record.port != port {
                return false;
            }
        }
        true
    }
}
