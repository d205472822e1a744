//! Event sink: persistence and live fan-out of event records.
//!
//! ```text
//!                          ┌──────────────────────┐   bounded queue   ┌────────────┐
//! sessions ── publish ───▶ │      EventSink       │ ────────────────▶ │ persistence│──▶ EventStore
//!                          │  id allocation       │                   │  worker    │   (retry/backoff)
//!                          │  subscriber registry │                   └────────────┘
//!                          └──────────┬───────────┘
//!                                     │ per-subscriber bounded buffers
//!                                     ▼ (evict oldest + gap marker)
//!                              Subscription::recv
//! ```

pub mod persistence;
pub mod sink;
pub mod subscription;
pub mod types;

pub use persistence::RetryPolicy;
pub use sink::EventSink;
pub use subscription::Subscription;
pub use types::{Delivery, SinkAlert, SinkStats};
