//! Process orchestration: wires the configuration, the event store, the event
//! sink and the listener manager together and owns their lifetime.

pub mod controller_handler;

pub use controller_handler::Controller;
