use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};

use crate::error_handling::types::StorageError;
use crate::event::EventRecord;
use crate::storage::storage_trait::{EventStore, RecordIter};
use crate::storage::types::EventFilter;

/// Volatile store keyed by record id. Useful for dry runs and tests.
#[derive(Default)]
pub struct MemoryStorage {
    records: Mutex<BTreeMap<u64, EventRecord>>,
    failing_appends: AtomicUsize,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Makes the next `n` appends fail with `StorageError::Unavailable`.
    pub fn fail_next_appends(&self, n: usize) {
        self.failing_appends.store(n, Ordering::SeqCst);
    }
}

impl EventStore for MemoryStorage {
    fn append(&self, record: &EventRecord) -> Result<(), StorageError> {
        if self
            .failing_appends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StorageError::Unavailable(
                "memory store configured to fail".to_string(),
            ));
        }
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.entry(record.id).or_insert_with(|| record.clone());
        Ok(())
    }

    fn query(&self, filter: &EventFilter) -> Result<RecordIter<'_>, StorageError> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let matched: Vec<EventRecord> = records
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        Ok(Box::new(matched.into_iter()))
    }

    fn max_id(&self) -> Result<Option<u64>, StorageError> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records.keys().next_back().copied())
    }

    fn cleanup_older_than(&self, older_than: DateTime<Utc>) -> Result<usize, StorageError> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let before = records.len();
        records.retain(|_, r| r.occurred_at >= older_than);
        Ok(before - records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::types::ProtocolTag;
    use crate::event::Summary;
    use crate::storage::event_filter::by_port;
    use chrono::Duration;
    use uuid::Uuid;

    fn record(id: u64, port: u16, occurred_at: DateTime<Utc>) -> EventRecord {
        EventRecord {
            id,
            session_id: Uuid::new_v4(),
            occurred_at,
            source_address: "192.0.2.10:5000".parse().unwrap(),
            protocol: ProtocolTag::Http,
            port,
            summary: Summary::new(),
            raw_excerpt: Vec::new(),
            termination: None,
        }
    }

    #[test]
    fn test_query_orders_by_id_and_filters() {
        let storage = MemoryStorage::new();
        let now = Utc::now();
        storage.append(&record(5, 80, now)).unwrap();
        storage.append(&record(1, 8080, now)).unwrap();
        storage.append(&record(3, 80, now)).unwrap();

        let ids: Vec<u64> = storage.query(&by_port(80)).unwrap().map(|r| r.id).collect();
        assert_eq!(ids, vec![3, 5]);
    }

    #[test]
    fn test_resend_does_not_duplicate() {
        let storage = MemoryStorage::new();
        let rec = record(1, 80, Utc::now());
        storage.append(&rec).unwrap();
        storage.append(&rec).unwrap();
        assert_eq!(storage.len(), 1);
    }

    #[test]
    fn test_injected_failures_run_out() {
        let storage = MemoryStorage::new();
        storage.fail_next_appends(2);
        let rec = record(1, 80, Utc::now());
        assert!(storage.append(&rec).is_err());
        assert!(storage.append(&rec).is_err());
        assert!(storage.append(&rec).is_ok());
        assert_eq!(storage.len(), 1);
    }

    #[test]
    fn test_cleanup() {
        let storage = MemoryStorage::new();
        let now = Utc::now();
        storage.append(&record(1, 80, now - Duration::hours(2))).unwrap();
        storage.append(&record(2, 80, now)).unwrap();

        assert_eq!(storage.cleanup_older_than(now - Duration::hours(1)).unwrap(), 1);
        assert_eq!(storage.len(), 1);
    }
}
