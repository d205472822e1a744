//! Event records: the immutable output of every protocol emulator.

pub mod record;
pub mod summary;

pub use record::{ClosedBy, EventRecord, Termination, TerminationReason};
pub use summary::Summary;
