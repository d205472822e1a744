//! Values handed out by the event sink to its subscribers and owner.

use std::fmt;
use std::sync::Arc;

use crate::error_handling::types::StorageError;
use crate::event::EventRecord;

/// One item read from a live subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// A published record with this subscriber's sequence number.
    Record { seq: u64, record: Arc<EventRecord> },
    /// `missed` records were evicted because the subscriber fell behind; the
    /// next record carries `resume_seq`.
    Gap { missed: u64, resume_seq: u64 },
}

impl Delivery {
    pub fn record(&self) -> Option<&Arc<EventRecord>> {
        match self {
            Delivery::Record { record, .. } => Some(record),
            Delivery::Gap { .. } => None,
        }
    }

    pub fn is_gap(&self) -> bool {
        matches!(self, Delivery::Gap { .. })
    }
}

/// Recoverable persistence problems reported to the sink's owner.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkAlert {
    /// One append attempt failed; the record will be retried if budget remains.
    AppendFailed {
        record_id: u64,
        attempt: u32,
        error: StorageError,
    },
    /// The record exhausted its retry budget and will not be persisted.
    RecordDropped { record_id: u64, error: StorageError },
    /// The persistence queue was full or closed; the record was broadcast only.
    QueueRejected { record_id: u64 },
}

impl fmt::Display for SinkAlert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkAlert::AppendFailed {
                record_id,
                attempt,
                error,
            } => write!(
                f,
                "append of record {} failed (attempt {}): {}",
                record_id, attempt, error
            ),
            SinkAlert::RecordDropped { record_id, error } => write!(
                f,
                "record {} dropped after exhausting retries: {}",
                record_id, error
            ),
            SinkAlert::QueueRejected { record_id } => {
                write!(f, "record {} not queued for persistence", record_id)
            }
        }
    }
}

/// Point-in-time view of the sink counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub published: u64,
    pub persisted: u64,
    pub persistence_failures: u64,
    pub persistence_dropped: u64,
    pub subscribers: usize,
    pub subscriber_overruns: u64,
}
