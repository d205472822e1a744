//! Storage Trait
//!
//! This module defines the `EventStore` trait, the persistence interface the
//! event sink writes through and the historical query surface reads from.
//!
//! Implementors are responsible for:
//! - Appending event records durably
//! - Answering filtered queries in `id` ascending order
//! - Purging records past their retention window
//!
//! All methods return a `Result` to handle potential storage errors.

use crate::error_handling::types::StorageError;
use crate::event::EventRecord;
use crate::storage::types::EventFilter;
use chrono::{DateTime, Utc};

/// Finite sequence of records returned by [`EventStore::query`].
pub type RecordIter<'a> = Box<dyn Iterator<Item = EventRecord> + Send + 'a>;

/// The `EventStore` trait defines the interface for persistence backends.
///
/// Only the event sink calls [`EventStore::append`]; every other component
/// treats the store as read-only.
pub trait EventStore: Send + Sync {
    /// Appends a record. Appending a record whose `id` is already stored must
    /// not produce a duplicate in later queries.
    fn append(&self, record: &EventRecord) -> Result<(), StorageError>;

    /// Returns every stored record matching `filter`, `id` ascending.
    ///
    /// Two calls with the same filter and no append in between yield identical
    /// sequences.
    fn query(&self, filter: &EventFilter) -> Result<RecordIter<'_>, StorageError>;

    /// Highest id stored so far, `None` for an empty store.
    fn max_id(&self) -> Result<Option<u64>, StorageError>;

    /// Removes records that occurred before `older_than` and returns how many
    /// were removed.
    fn cleanup_older_than(&self, older_than: DateTime<Utc>) -> Result<usize, StorageError>;
}
