//! Storage subsystem
//!
//! This module provides the persistence interface behind the event sink and
//! the historical query surface, along with two backends.
//!
//! Components:
//! - `storage_trait`: the EventStore trait defining a uniform API.
//! - `types`: the query filter shared by all backends.
//! - `file_storage`: append-only JSON-lines log on the filesystem.
//! - `memory_storage`: volatile in-process backend.
//! - `event_filter`: helpers to build queries.

pub mod event_filter;
pub mod file_storage;
pub mod memory_storage;
pub mod storage_trait;
pub mod types;

pub use file_storage::FileStorage;
pub use memory_storage::MemoryStorage;
pub use storage_trait::{EventStore, RecordIter};
pub use types::EventFilter;
