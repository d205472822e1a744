//! Network core module.
//!
//! Listeners bound to configured ports, the manager that owns them, and the
//! per-connection sessions that drive protocol emulators.

/// Submodule for the per-connection driving loop.
pub mod connection_session;
/// Submodule for a single port's accept loop.
pub mod listener;
/// Submodule for starting and stopping the set of listeners.
pub mod listener_manager;
/// Submodule for shared network types.
pub mod types;

pub use connection_session::ConnectionSession;
pub use listener::{Listener, ListenerHandle};
pub use listener_manager::ListenerManager;
pub use types::{ListenerEvent, ListenerStats, ListenerStatus, SessionRequest};
