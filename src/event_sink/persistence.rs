use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, warn};
use tokio::sync::mpsc;

use super::types::SinkAlert;
use crate::error_handling::types::StorageError;
use crate::event::EventRecord;
use crate::storage::EventStore;

/// Fixed retry budget for one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt` (1-based): the base backoff
    /// doubled for every previous failure.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.backoff.saturating_mul(1u32 << exp)
    }
}

#[derive(Default)]
pub(crate) struct SinkCounters {
    pub(crate) published: AtomicU64,
    pub(crate) persisted: AtomicU64,
    pub(crate) persistence_failures: AtomicU64,
    pub(crate) persistence_dropped: AtomicU64,
    pub(crate) subscriber_overruns: AtomicU64,
}

/// Drains the persistence queue into the store, one record at a time.
pub(crate) struct PersistenceWorker {
    pub(crate) store: Arc<dyn EventStore>,
    pub(crate) policy: RetryPolicy,
    pub(crate) counters: Arc<SinkCounters>,
    pub(crate) alerts: mpsc::Sender<SinkAlert>,
}

impl PersistenceWorker {
    pub(crate) async fn run(self, mut queue: mpsc::Receiver<Arc<EventRecord>>) {
        debug!("Persistence worker started");
        while let Some(record) = queue.recv().await {
            self.persist(record).await;
        }
        debug!("Persistence worker drained, exiting");
    }

    async fn persist(&self, record: Arc<EventRecord>) {
        let mut last_error = StorageError::WriteFailed("no attempt made".to_string());

        for attempt in 1..=self.policy.max_attempts {
            let store = Arc::clone(&self.store);
            let rec = Arc::clone(&record);
            let result = tokio::task::spawn_blocking(move || store.append(&rec))
                .await
                .unwrap_or_else(|e| Err(StorageError::WriteFailed(e.to_string())));

            match result {
                Ok(()) => {
                    self.counters.persisted.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(e) => {
                    self.counters
                        .persistence_failures
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Persisting record {} failed (attempt {}/{}): {}",
                        record.id, attempt, self.policy.max_attempts, e
                    );
                    let _ = self.alerts.try_send(SinkAlert::AppendFailed {
                        record_id: record.id,
                        attempt,
                        error: e.clone(),
                    });
                    last_error = e;
                }
            }

            if attempt < self.policy.max_attempts {
                tokio::time::sleep(self.policy.delay_after(attempt)).await;
            }
        }

        self.counters
            .persistence_dropped
            .fetch_add(1, Ordering::Relaxed);
        error!(
            "Dropping record {} after {} failed attempt(s): {}",
            record.id, self.policy.max_attempts, last_error
        );
        let _ = self.alerts.try_send(SinkAlert::RecordDropped {
            record_id: record.id,
            error: last_error,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy {
            max_attempts: 4,
            backoff: Duration::from_millis(100),
        };
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_does_not_overflow() {
        let policy = RetryPolicy {
            max_attempts: u32::MAX,
            backoff: Duration::from_secs(u64::MAX / 2),
        };
        assert_eq!(policy.delay_after(40), Duration::MAX);
    }
}
