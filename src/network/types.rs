use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::watch;

use crate::configuration::types::ProtocolTag;

/// An accepted connection handed from a listener to its connection session.
///
/// Generic over the stream so sessions can be driven by in-memory mocks.
pub struct SessionRequest<S = TcpStream> {
    pub stream: S,
    pub client_addr: SocketAddr,
    pub timestamp: DateTime<Utc>,
}

impl<S> SessionRequest<S> {
    pub fn new(stream: S, client_addr: SocketAddr) -> Self {
        Self {
            stream,
            client_addr,
            timestamp: Utc::now(),
        }
    }
}

/// Resolves once `shutdown` carries `true` or its sender is gone.
///
/// The borrowed value is released before returning, so the caller's future
/// stays `Send` and the receiver is free again for the caller's next use.
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Lifecycle state of one listener as seen by the manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ListenerStatus {
    Running,
    BindFailed(String),
    Failed(String),
    Stopped,
}

impl fmt::Display for ListenerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerStatus::Running => write!(f, "running"),
            ListenerStatus::BindFailed(reason) => write!(f, "bind failed: {}", reason),
            ListenerStatus::Failed(reason) => write!(f, "failed: {}", reason),
            ListenerStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// Emitted by a listener task to its manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    /// The accept loop died; no new connections will be taken on this port.
    Failed { port: u16, reason: String },
}

/// Point-in-time counters of one listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListenerStats {
    pub port: u16,
    pub protocol: ProtocolTag,
    pub active: usize,
    pub accepted: u64,
    pub rejected_at_capacity: u64,
    pub completed: u64,
}

/// Counters shared between a listener's accept loop and its sessions.
#[derive(Debug, Default)]
pub(crate) struct ListenerCounters {
    pub(crate) active: AtomicUsize,
    pub(crate) accepted: AtomicU64,
    pub(crate) rejected_at_capacity: AtomicU64,
    pub(crate) completed: AtomicU64,
}

impl ListenerCounters {
    /// Claims one connection slot unless `max` are already taken.
    pub(crate) fn try_acquire(self: &Arc<Self>, max: usize) -> Option<SlotGuard> {
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .ok()
            .map(|_| SlotGuard {
                counters: Arc::clone(self),
            })
    }

    pub(crate) fn snapshot(&self, port: u16, protocol: ProtocolTag) -> ListenerStats {
        ListenerStats {
            port,
            protocol,
            active: self.active.load(Ordering::Acquire),
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected_at_capacity: self.rejected_at_capacity.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
        }
    }
}

/// Releases its connection slot when dropped, including when the owning
/// session task is aborted.
#[derive(Debug)]
pub(crate) struct SlotGuard {
    counters: Arc<ListenerCounters>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.counters.active.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slots_are_capped_and_released() {
        let counters = Arc::new(ListenerCounters::default());
        let first = counters.try_acquire(2).unwrap();
        let second = counters.try_acquire(2).unwrap();
        assert!(counters.try_acquire(2).is_none());
        assert_eq!(counters.active.load(Ordering::SeqCst), 2);

        drop(first);
        let third = counters.try_acquire(2);
        assert!(third.is_some());
        drop(second);
        drop(third);
        assert_eq!(counters.active.load(Ordering::SeqCst), 0);
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn test_shutdown_requested_resolves_on_signal_or_drop() {
        let (tx, mut rx) = watch::channel(false);
        let mut waiting = Box::pin(shutdown_requested(&mut rx));
        assert_send(&waiting);
        assert!(poll_briefly(waiting.as_mut()).await.is_none());
        tx.send(true).unwrap();
        waiting.await;
        // usable again right away, since nothing stays borrowed
        assert!(*rx.borrow());

        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        shutdown_requested(&mut rx).await;
    }

    async fn poll_briefly<F: std::future::Future + Unpin>(fut: F) -> Option<F::Output> {
        tokio::time::timeout(std::time::Duration::from_millis(20), fut)
            .await
            .ok()
    }

    #[test]
    fn test_status_display() {
        assert_eq!(ListenerStatus::Running.to_string(), "running");
        assert_eq!(
            ListenerStatus::BindFailed("address in use".into()).to_string(),
            "bind failed: address in use"
        );
    }
}
