//! Error taxonomy shared by every subsystem.
//!
//! Listener-level errors ([`types::NetworkError`]) and persistence errors
//! ([`types::StorageError`]) are the only ones that reach the process owner.
//! [`types::SessionFault`] never leaves the connection session it was raised in.

pub mod types;
