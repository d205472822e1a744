use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, error, info, warn};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use super::persistence::{PersistenceWorker, RetryPolicy, SinkCounters};
use super::subscription::{Registry, Subscription};
use super::types::{SinkAlert, SinkStats};
use crate::configuration::types::SinkConfig;
use crate::error_handling::types::StorageError;
use crate::event::EventRecord;
use crate::storage::EventStore;

/// The single persistence-and-broadcast point for event records.
///
/// Owned explicitly and shared as `Arc<EventSink>` by every listener and
/// session. Nothing else writes to the store or talks to live subscribers.
///
/// `publish` never waits: the record is offered to a bounded persistence queue
/// drained by a background worker, then pushed into each subscriber's bounded
/// buffer. A failing store or a slow subscriber therefore never delays the
/// caller or the other subscribers.
pub struct EventSink {
    next_id: AtomicU64,
    store: Arc<dyn EventStore>,
    persist_tx: Mutex<Option<mpsc::Sender<Arc<EventRecord>>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    registry: Arc<Registry>,
    counters: Arc<SinkCounters>,
    alerts_tx: mpsc::Sender<SinkAlert>,
    alerts_rx: Mutex<Option<mpsc::Receiver<SinkAlert>>>,
}

impl EventSink {
    /// Creates the sink and spawns its persistence worker on the current Tokio
    /// runtime.
    ///
    /// Ids continue after the highest one already in `store`, so a store that
    /// outlives the process never sees an id twice.
    pub fn new(store: Arc<dyn EventStore>, config: &SinkConfig) -> Result<Arc<Self>, StorageError> {
        let first_id = match store.max_id() {
            Ok(max) => max.map_or(1, |id| id.saturating_add(1)),
            Err(e) => {
                error!("[!] Unable to read the highest stored record id: {}", e);
                return Err(e);
            }
        };

        let (persist_tx, persist_rx) = mpsc::channel(config.persistence_queue.max(1));
        let (alerts_tx, alerts_rx) = mpsc::channel(config.alert_buffer.max(1));
        let counters = Arc::new(SinkCounters::default());

        let worker = PersistenceWorker {
            store: Arc::clone(&store),
            policy: RetryPolicy {
                max_attempts: config.persistence_max_attempts.max(1),
                backoff: config.persistence_backoff(),
            },
            counters: Arc::clone(&counters),
            alerts: alerts_tx.clone(),
        };
        let handle = tokio::spawn(worker.run(persist_rx));

        info!(
            "Event sink ready (next id {}, subscriber buffer {}, persistence queue {}, {} attempt(s) per record)",
            first_id,
            config.subscriber_buffer,
            config.persistence_queue,
            config.persistence_max_attempts
        );

        Ok(Arc::new(Self {
            next_id: AtomicU64::new(first_id),
            store,
            persist_tx: Mutex::new(Some(persist_tx)),
            worker: Mutex::new(Some(handle)),
            registry: Arc::new(Registry::new(config.subscriber_buffer)),
            counters,
            alerts_tx,
            alerts_rx: Mutex::new(Some(alerts_rx)),
        }))
    }

    /// Allocates the id of the next record. Ids are unique and increasing,
    /// also across sinks opened in turn over the same store.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Persists (asynchronously) and broadcasts `record`.
    pub fn publish(&self, record: EventRecord) -> Arc<EventRecord> {
        let record = Arc::new(record);
        self.counters.published.fetch_add(1, Ordering::Relaxed);

        let queued = {
            let tx = self.persist_tx.lock().unwrap_or_else(PoisonError::into_inner);
            match tx.as_ref() {
                Some(tx) => match tx.try_send(Arc::clone(&record)) {
                    Ok(()) => true,
                    Err(TrySendError::Full(_)) => {
                        warn!("Persistence queue full, record {} not persisted", record.id);
                        false
                    }
                    Err(TrySendError::Closed(_)) => false,
                },
                None => false,
            }
        };
        if !queued {
            self.counters
                .persistence_dropped
                .fetch_add(1, Ordering::Relaxed);
            let _ = self
                .alerts_tx
                .try_send(SinkAlert::QueueRejected { record_id: record.id });
        }

        for queue in self.registry.snapshot().iter() {
            if queue.push(Arc::clone(&record)) {
                self.counters
                    .subscriber_overruns
                    .fetch_add(1, Ordering::Relaxed);
            }
        }

        debug!(
            "Published record {} ({} on port {})",
            record.id, record.protocol, record.port
        );
        record
    }

    /// Registers a live consumer. It receives every record published from now
    /// on; there is no replay of earlier records.
    pub fn subscribe(&self) -> Subscription {
        self.registry.register()
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        self.registry.remove(subscription.id());
    }

    /// Takes the receiver of persistence alerts. Only the first call gets it.
    pub fn take_alerts(&self) -> Option<mpsc::Receiver<SinkAlert>> {
        self.alerts_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// The backing store, for historical queries.
    pub fn store(&self) -> Arc<dyn EventStore> {
        Arc::clone(&self.store)
    }

    pub fn stats(&self) -> SinkStats {
        SinkStats {
            published: self.counters.published.load(Ordering::Relaxed),
            persisted: self.counters.persisted.load(Ordering::Relaxed),
            persistence_failures: self.counters.persistence_failures.load(Ordering::Relaxed),
            persistence_dropped: self.counters.persistence_dropped.load(Ordering::Relaxed),
            subscribers: self.registry.len(),
            subscriber_overruns: self.counters.subscriber_overruns.load(Ordering::Relaxed),
        }
    }

    /// Stops accepting records for persistence, waits for the queue to drain
    /// and ends every live subscription.
    pub async fn shutdown(&self) {
        let tx = self
            .persist_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(tx);

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!("Persistence worker ended abnormally: {}", e);
            }
        }

        self.registry.close_all();
        info!("Event sink shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::types::ProtocolTag;
    use crate::event::{ClosedBy, Summary, Termination, TerminationReason};
    use crate::event_sink::types::Delivery;
    use crate::storage::{EventFilter, FileStorage, MemoryStorage, RecordIter};
    use chrono::{DateTime, Utc};
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;
    use uuid::Uuid;

    /// Fails the first `failures` appends, then delegates to memory.
    struct FlakyStore {
        failures: AtomicUsize,
        attempts: AtomicUsize,
        inner: MemoryStorage,
    }

    impl FlakyStore {
        fn new(failures: usize) -> Self {
            Self {
                failures: AtomicUsize::new(failures),
                attempts: AtomicUsize::new(0),
                inner: MemoryStorage::new(),
            }
        }
    }

    impl EventStore for FlakyStore {
        fn append(&self, record: &EventRecord) -> Result<(), StorageError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(StorageError::WriteFailed("disk full".to_string()));
            }
            self.inner.append(record)
        }

        fn query(&self, filter: &EventFilter) -> Result<RecordIter<'_>, StorageError> {
            self.inner.query(filter)
        }

        fn max_id(&self) -> Result<Option<u64>, StorageError> {
            self.inner.max_id()
        }

        fn cleanup_older_than(&self, older_than: DateTime<Utc>) -> Result<usize, StorageError> {
            self.inner.cleanup_older_than(older_than)
        }
    }

    struct UnreadableStore;

    impl EventStore for UnreadableStore {
        fn append(&self, _record: &EventRecord) -> Result<(), StorageError> {
            Err(StorageError::WriteFailed("read-only".to_string()))
        }

        fn query(&self, _filter: &EventFilter) -> Result<RecordIter<'_>, StorageError> {
            Err(StorageError::ReadFailed("permission denied".to_string()))
        }

        fn max_id(&self) -> Result<Option<u64>, StorageError> {
            Err(StorageError::ReadFailed("permission denied".to_string()))
        }

        fn cleanup_older_than(&self, _older_than: DateTime<Utc>) -> Result<usize, StorageError> {
            Ok(0)
        }
    }

    fn config() -> SinkConfig {
        SinkConfig {
            subscriber_buffer: 4,
            persistence_queue: 16,
            persistence_max_attempts: 3,
            persistence_backoff_ms: 10,
            alert_buffer: 16,
        }
    }

    fn record(sink: &EventSink) -> EventRecord {
        EventRecord {
            id: sink.next_id(),
            session_id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            source_address: "198.51.100.20:33000".parse().unwrap(),
            protocol: ProtocolTag::Ftp,
            port: 2121,
            summary: Summary::new(),
            raw_excerpt: Vec::new(),
            termination: Some(Termination {
                reason: TerminationReason::NormalClose,
                closed_by: ClosedBy::Peer,
                bytes_received: 0,
            }),
        }
    }

    #[tokio::test]
    async fn test_publish_persists_and_broadcasts() {
        let store = Arc::new(MemoryStorage::new());
        let sink = EventSink::new(store.clone(), &config()).unwrap();
        let mut a = sink.subscribe();
        let mut b = sink.subscribe();

        let published = sink.publish(record(&sink));

        for sub in [&mut a, &mut b] {
            match sub.recv().await {
                Some(Delivery::Record { seq, record }) => {
                    assert_eq!(seq, 1);
                    assert_eq!(record, published);
                }
                other => panic!("unexpected delivery: {:?}", other),
            }
        }

        sink.shutdown().await;
        let stored: Vec<EventRecord> = store.query(&EventFilter::default()).unwrap().collect();
        assert_eq!(stored, vec![(*published).clone()]);
        assert_eq!(sink.stats().persisted, 1);
        assert!(a.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_ids_are_monotonic() {
        let sink = EventSink::new(Arc::new(MemoryStorage::new()), &config()).unwrap();
        let first = sink.next_id();
        let second = sink.next_id();
        assert!(second > first);
        sink.shutdown().await;
    }

    #[tokio::test]
    async fn test_ids_continue_after_stored_records() {
        let store = Arc::new(MemoryStorage::new());
        let seed = EventSink::new(store.clone(), &config()).unwrap();
        let mut old = record(&seed);
        seed.shutdown().await;
        old.id = 41;
        store.append(&old).unwrap();

        let sink = EventSink::new(store.clone(), &config()).unwrap();
        assert_eq!(sink.next_id(), 42);
        sink.shutdown().await;
    }

    #[tokio::test]
    async fn test_ids_stay_unique_across_restarts_on_file_storage() {
        let dir = TempDir::new().unwrap();
        for run in ["first", "second"] {
            let store = Arc::new(FileStorage::new(dir.path()).unwrap());
            let sink = EventSink::new(store, &config()).unwrap();
            let mut rec = record(&sink);
            rec.summary = Summary::new().with("run", run);
            sink.publish(rec);
            sink.shutdown().await;
        }

        let store = FileStorage::new(dir.path()).unwrap();
        let stored: Vec<(u64, String)> = store
            .query(&EventFilter::default())
            .unwrap()
            .map(|r| (r.id, r.summary.get("run").unwrap_or_default().to_string()))
            .collect();
        assert_eq!(
            stored,
            vec![(1, "first".to_string()), (2, "second".to_string())]
        );
    }

    #[tokio::test]
    async fn test_unreadable_store_is_rejected() {
        let result = EventSink::new(Arc::new(UnreadableStore), &config());
        assert!(matches!(result, Err(StorageError::ReadFailed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_persistence_failure_is_retried() {
        let store = Arc::new(FlakyStore::new(2));
        let sink = EventSink::new(store.clone(), &config()).unwrap();
        let mut alerts = sink.take_alerts().unwrap();
        let mut sub = sink.subscribe();

        sink.publish(record(&sink));

        // broadcast does not wait for persistence
        assert!(sub.try_recv().is_some());

        sink.shutdown().await;
        assert_eq!(store.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(store.inner.len(), 1);

        let stats = sink.stats();
        assert_eq!(stats.persisted, 1);
        assert_eq!(stats.persistence_failures, 2);
        assert_eq!(stats.persistence_dropped, 0);

        assert!(matches!(
            alerts.recv().await,
            Some(SinkAlert::AppendFailed { attempt: 1, .. })
        ));
        assert!(matches!(
            alerts.recv().await,
            Some(SinkAlert::AppendFailed { attempt: 2, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistence_gives_up_after_budget() {
        let store = Arc::new(FlakyStore::new(usize::MAX));
        let sink = EventSink::new(store.clone(), &config()).unwrap();
        let mut alerts = sink.take_alerts().unwrap();
        let mut sub = sink.subscribe();

        let published = sink.publish(record(&sink));
        assert_eq!(sub.try_recv().unwrap().record(), Some(&published));

        sink.shutdown().await;
        assert_eq!(store.attempts.load(Ordering::SeqCst), 3);
        assert!(store.inner.is_empty());
        assert_eq!(sink.stats().persistence_dropped, 1);

        let mut dropped = false;
        while let Ok(alert) = alerts.try_recv() {
            if let SinkAlert::RecordDropped { record_id, .. } = alert {
                assert_eq!(record_id, published.id);
                dropped = true;
            }
        }
        assert!(dropped);
    }

    #[tokio::test]
    async fn test_slow_subscriber_gets_gap_without_affecting_others() {
        let sink = EventSink::new(Arc::new(MemoryStorage::new()), &config()).unwrap();
        let mut slow = sink.subscribe();
        let mut fast = sink.subscribe();

        let mut fast_ids = Vec::new();
        for _ in 0..10 {
            let rec = sink.publish(record(&sink));
            let got = fast.try_recv().unwrap();
            assert_eq!(got.record(), Some(&rec));
            fast_ids.push(rec.id);
        }

        // buffer of 4: the six oldest were evicted for the slow reader only
        assert_eq!(
            slow.try_recv(),
            Some(Delivery::Gap {
                missed: 6,
                resume_seq: 7
            })
        );
        let slow_ids: Vec<u64> = std::iter::from_fn(|| slow.try_recv())
            .map(|d| d.record().unwrap().id)
            .collect();
        assert_eq!(slow_ids, fast_ids[6..].to_vec());
        assert_eq!(sink.stats().subscriber_overruns, 6);

        sink.shutdown().await;
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let sink = EventSink::new(Arc::new(MemoryStorage::new()), &config()).unwrap();
        let sub = sink.subscribe();
        assert_eq!(sink.stats().subscribers, 1);
        sink.unsubscribe(sub);
        assert_eq!(sink.stats().subscribers, 0);

        // publishing with no subscriber is fine
        sink.publish(record(&sink));
        sink.shutdown().await;
        assert_eq!(sink.stats().persisted, 1);
    }

    #[tokio::test]
    async fn test_publish_after_shutdown_is_counted_not_lost_silently() {
        let sink = EventSink::new(Arc::new(MemoryStorage::new()), &config()).unwrap();
        let mut alerts = sink.take_alerts().unwrap();
        sink.shutdown().await;

        let rec = sink.publish(record(&sink));
        assert_eq!(sink.stats().persistence_dropped, 1);
        assert_eq!(
            alerts.try_recv().ok(),
            Some(SinkAlert::QueueRejected { record_id: rec.id })
        );
        assert!(sink.take_alerts().is_none());
    }
}
