use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{error, info, warn};

use crate::configuration::config::Config;
use crate::error_handling::types::{ControllerError, StorageError};
use crate::event_sink::EventSink;
use crate::network::ListenerManager;
use crate::storage::{EventStore, FileStorage};

/// How often retention runs while the process is up.
const RETENTION_INTERVAL: Duration = Duration::from_secs(3600);

/// Owns the configuration, the event store, the event sink and the listener
/// manager for the lifetime of the process.
pub struct Controller {
    config: Config,
    store: Arc<dyn EventStore>,
    sink: Arc<EventSink>,
    manager: ListenerManager,
}

impl Controller {
    /// Opens the file store under `config.storage_path`. Must be called within
    /// a Tokio runtime.
    pub fn new(config: Config) -> Result<Self, ControllerError> {
        info!("[+] Opening event store in {}", config.storage_path.display());
        let store = Arc::new(FileStorage::new(&config.storage_path)?);
        Self::with_store(config, store)
    }

    /// Same as [`Controller::new`] with an explicit backend.
    pub fn with_store(config: Config, store: Arc<dyn EventStore>) -> Result<Self, ControllerError> {
        let bind_ip = config.bind_ip()?;
        let sink = EventSink::new(Arc::clone(&store), &config.sink)?;
        let manager = ListenerManager::new(bind_ip, Arc::clone(&sink), config.shutdown_grace());
        Ok(Self {
            config,
            store,
            sink,
            manager,
        })
    }

    pub fn sink(&self) -> Arc<EventSink> {
        Arc::clone(&self.sink)
    }

    pub fn listeners(&self) -> &ListenerManager {
        &self.manager
    }

    /// Deletes records older than the configured retention. Returns the
    /// number removed, 0 when retention is disabled.
    pub async fn purge_expired(&self) -> Result<usize, StorageError> {
        let Some(days) = self.config.retention_days else {
            return Ok(0);
        };
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));
        let store = Arc::clone(&self.store);
        let removed = tokio::task::spawn_blocking(move || store.cleanup_older_than(cutoff))
            .await
            .map_err(|e| StorageError::WriteFailed(e.to_string()))??;
        if removed > 0 {
            info!("Retention removed {} record(s) older than {} day(s)", removed, days);
        }
        Ok(removed)
    }

    /// Applies retention and starts every configured listener.
    ///
    /// Bind failures are logged and kept as listener statuses; only the case
    /// where nothing could be bound is an error.
    pub async fn start(&mut self) -> Result<(), ControllerError> {
        if let Err(e) = self.purge_expired().await {
            warn!("Retention at startup failed: {}", e);
        }

        let listeners = self.config.listeners.clone();
        let failures = self.manager.start_all(&listeners);
        for failure in &failures {
            error!("[!] {}", failure);
        }
        if self.manager.running_count() == 0 {
            self.shutdown().await;
            return Err(ControllerError::NoListenerRunning);
        }
        Ok(())
    }

    /// Starts, then serves until ctrl-c.
    pub async fn run(&mut self) -> Result<(), ControllerError> {
        self.start().await?;
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("[!] Unable to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Serves until `shutdown` resolves or every listener has failed, then
    /// stops listeners and drains the sink.
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<(), ControllerError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut retention = tokio::time::interval(RETENTION_INTERVAL);
        retention.tick().await;

        let result = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break Ok(());
                }
                Some(_) = self.manager.next_event() => {
                    if self.manager.running_count() == 0 {
                        error!("[!] Every listener has failed");
                        break Err(ControllerError::NoListenerRunning);
                    }
                }
                _ = retention.tick(), if self.config.retention_days.is_some() => {
                    if let Err(e) = self.purge_expired().await {
                        warn!("Retention failed: {}", e);
                    }
                }
            }
        };

        self.shutdown().await;
        result
    }

    /// Stops listeners (with their grace period) and drains the sink.
    pub async fn shutdown(&mut self) {
        for stats in self.manager.stats() {
            info!(
                "Port {} ({}): {} accepted, {} rejected at capacity",
                stats.port, stats.protocol, stats.accepted, stats.rejected_at_capacity
            );
        }
        self.manager.stop_all().await;
        self.sink.shutdown().await;
        let stats = self.sink.stats();
        info!(
            "Published {} record(s), persisted {}, dropped {}",
            stats.published, stats.persisted, stats.persistence_dropped
        );
    }
}
