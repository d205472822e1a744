//! Live subscriptions with bounded per-subscriber buffers.
//!
//! Each subscriber owns a queue of at most `capacity` records. Publishing into
//! a full queue evicts that subscriber's oldest unread record, so a slow
//! reader only ever loses its own data and never slows the publisher. Every
//! enqueued record carries a per-subscriber sequence number; a hole in the
//! sequence is reported to the reader as [`Delivery::Gap`] before the next
//! record.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use log::{debug, trace};
use tokio::sync::Notify;

use super::types::Delivery;
use crate::event::EventRecord;

struct QueueState {
    buf: VecDeque<(u64, Arc<EventRecord>)>,
    /// Sequence number assigned to the next enqueued record.
    next_seq: u64,
    overruns: u64,
    closed: bool,
}

pub(crate) struct SubscriberQueue {
    id: u64,
    capacity: usize,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl SubscriberQueue {
    fn new(id: u64, capacity: usize) -> Self {
        Self {
            id,
            capacity: capacity.max(1),
            state: Mutex::new(QueueState {
                buf: VecDeque::with_capacity(capacity.max(1)),
                next_seq: 1,
                overruns: 0,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueues `record`, evicting the oldest unread entry when full.
    /// Returns `true` if an entry was evicted.
    pub(crate) fn push(&self, record: Arc<EventRecord>) -> bool {
        let evicted = {
            let mut state = self.lock();
            if state.closed {
                return false;
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            let evicted = if state.buf.len() >= self.capacity {
                state.buf.pop_front();
                state.overruns += 1;
                true
            } else {
                false
            };
            state.buf.push_back((seq, record));
            evicted
        };
        if evicted {
            trace!("Subscriber {} overrun, oldest record evicted", self.id);
        }
        self.notify.notify_one();
        evicted
    }

    pub(crate) fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }
}

/// Registry of live subscribers.
///
/// Copy-on-write: registration swaps in a new list under the lock, publishers
/// clone the current `Arc` and iterate without holding it.
pub(crate) struct Registry {
    next_id: AtomicU64,
    capacity: usize,
    subscribers: Mutex<Arc<Vec<Arc<SubscriberQueue>>>>,
}

impl Registry {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            capacity,
            subscribers: Mutex::new(Arc::new(Vec::new())),
        }
    }

    fn list(&self) -> MutexGuard<'_, Arc<Vec<Arc<SubscriberQueue>>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register(self: &Arc<Self>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(SubscriberQueue::new(id, self.capacity));
        {
            let mut list = self.list();
            let mut next: Vec<_> = list.iter().cloned().collect();
            next.push(Arc::clone(&queue));
            *list = Arc::new(next);
        }
        debug!("Subscriber {} registered", id);
        Subscription {
            queue,
            registry: Arc::downgrade(self),
            expected_seq: 1,
        }
    }

    pub(crate) fn remove(&self, id: u64) -> bool {
        let removed = {
            let mut list = self.list();
            if !list.iter().any(|q| q.id == id) {
                return false;
            }
            let next: Vec<_> = list.iter().filter(|q| q.id != id).cloned().collect();
            let removed = list.iter().find(|q| q.id == id).cloned();
            *list = Arc::new(next);
            removed
        };
        if let Some(queue) = removed {
            queue.close();
        }
        debug!("Subscriber {} removed", id);
        true
    }

    pub(crate) fn snapshot(&self) -> Arc<Vec<Arc<SubscriberQueue>>> {
        Arc::clone(&self.list())
    }

    pub(crate) fn close_all(&self) {
        let previous = std::mem::replace(&mut *self.list(), Arc::new(Vec::new()));
        for queue in previous.iter() {
            queue.close();
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.list().len()
    }
}

/// Handle of one live consumer of the event sink.
///
/// Dropping it deregisters the subscriber.
pub struct Subscription {
    queue: Arc<SubscriberQueue>,
    registry: Weak<Registry>,
    /// Sequence number the reader expects next.
    expected_seq: u64,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.queue.id
    }

    /// Number of records evicted from this subscriber's buffer so far.
    pub fn overruns(&self) -> u64 {
        self.queue.lock().overruns
    }

    /// Returns the next delivery without waiting.
    pub fn try_recv(&mut self) -> Option<Delivery> {
        let mut state = self.queue.lock();
        let front_seq = state.buf.front()?.0;
        if front_seq > self.expected_seq {
            let missed = front_seq - self.expected_seq;
            self.expected_seq = front_seq;
            return Some(Delivery::Gap {
                missed,
                resume_seq: front_seq,
            });
        }
        let (seq, record) = state.buf.pop_front()?;
        self.expected_seq = seq + 1;
        Some(Delivery::Record { seq, record })
    }

    /// Waits for the next delivery. Returns `None` once the subscription was
    /// removed or the sink shut down and everything buffered was read.
    pub async fn recv(&mut self) -> Option<Delivery> {
        loop {
            if let Some(delivery) = self.try_recv() {
                return Some(delivery);
            }
            if self.queue.lock().closed {
                return None;
            }
            self.queue.notify.notified().await;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.queue.id);
        }
    }
}
