use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use super::listener::{Listener, ListenerHandle};
use super::types::{ListenerEvent, ListenerStats, ListenerStatus};
use crate::configuration::types::ListenerConfig;
use crate::error_handling::types::NetworkError;
use crate::event_sink::EventSink;

struct ManagedListener {
    status: ListenerStatus,
    handle: Option<ListenerHandle>,
}

/// Starts, tracks and stops the set of listeners.
///
/// Listener failures are isolated: a port that cannot be bound or whose accept
/// loop dies is recorded with its own status while every other listener keeps
/// running.
pub struct ListenerManager {
    bind_ip: IpAddr,
    sink: Arc<EventSink>,
    grace: Duration,
    listeners: BTreeMap<u16, ManagedListener>,
    events_tx: mpsc::Sender<ListenerEvent>,
    events_rx: mpsc::Receiver<ListenerEvent>,
}

impl ListenerManager {
    pub fn new(bind_ip: IpAddr, sink: Arc<EventSink>, grace: Duration) -> Self {
        let (events_tx, events_rx) = mpsc::channel(64);
        Self {
            bind_ip,
            sink,
            grace,
            listeners: BTreeMap::new(),
            events_tx,
            events_rx,
        }
    }

    /// Starts one listener. Must be called within a Tokio runtime.
    ///
    /// A bind failure is recorded as [`ListenerStatus::BindFailed`] under the
    /// configured port and returned.
    pub fn start(&mut self, config: ListenerConfig) -> Result<SocketAddr, NetworkError> {
        let configured_port = config.port;
        match Listener::start(
            config,
            self.bind_ip,
            Arc::clone(&self.sink),
            self.grace,
            Some(self.events_tx.clone()),
        ) {
            Ok(handle) => {
                let addr = handle.local_addr();
                self.listeners.insert(
                    handle.port(),
                    ManagedListener {
                        status: ListenerStatus::Running,
                        handle: Some(handle),
                    },
                );
                Ok(addr)
            }
            Err(e) => {
                error!("[!] {}", e);
                self.listeners.insert(
                    configured_port,
                    ManagedListener {
                        status: ListenerStatus::BindFailed(e.to_string()),
                        handle: None,
                    },
                );
                Err(e)
            }
        }
    }

    /// Starts every configured listener and returns the bind failures. The
    /// listeners that did bind keep running regardless.
    pub fn start_all(&mut self, configs: &[ListenerConfig]) -> Vec<NetworkError> {
        let failures: Vec<NetworkError> = configs
            .iter()
            .cloned()
            .filter_map(|config| self.start(config).err())
            .collect();
        info!(
            "{} of {} listener(s) running",
            self.running_count(),
            configs.len()
        );
        failures
    }

    /// Waits for the next listener event and applies it to the statuses.
    ///
    /// The manager keeps a sender of its own, so this only resolves when a
    /// listener reports something.
    pub async fn next_event(&mut self) -> Option<ListenerEvent> {
        let event = self.events_rx.recv().await?;
        match &event {
            ListenerEvent::Failed { port, reason } => {
                warn!("Listener on port {} failed: {}", port, reason);
                if let Some(entry) = self.listeners.get_mut(port) {
                    entry.status = ListenerStatus::Failed(reason.clone());
                }
            }
        }
        Some(event)
    }

    /// Lets tests stand in for an accept loop reporting its death.
    #[cfg(test)]
    pub(crate) fn event_sender(&self) -> mpsc::Sender<ListenerEvent> {
        self.events_tx.clone()
    }

    pub fn status(&self, port: u16) -> Option<&ListenerStatus> {
        self.listeners.get(&port).map(|entry| &entry.status)
    }

    pub fn statuses(&self) -> Vec<(u16, ListenerStatus)> {
        self.listeners
            .iter()
            .map(|(port, entry)| (*port, entry.status.clone()))
            .collect()
    }

    pub fn stats(&self) -> Vec<ListenerStats> {
        self.listeners
            .values()
            .filter_map(|entry| entry.handle.as_ref().map(ListenerHandle::stats))
            .collect()
    }

    pub fn running_count(&self) -> usize {
        self.listeners
            .values()
            .filter(|entry| entry.status == ListenerStatus::Running)
            .count()
    }

    /// Stops every listener concurrently. Each gets the grace period to let
    /// its sessions publish their terminal records.
    pub async fn stop_all(&mut self) {
        let mut stopping = JoinSet::new();
        for entry in self.listeners.values_mut() {
            if let Some(handle) = entry.handle.take() {
                stopping.spawn(handle.stop());
            }
            if entry.status == ListenerStatus::Running {
                entry.status = ListenerStatus::Stopped;
            }
        }

        while let Some(joined) = stopping.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Listener ended with error: {}", e),
                Err(e) => error!("[!] Listener stop task failed: {}", e),
            }
        }
        info!("All listeners stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::types::{ProtocolTag, SinkConfig};
    use crate::storage::MemoryStorage;
    use std::net::Ipv4Addr;

    fn manager() -> ListenerManager {
        let sink = EventSink::new(Arc::new(MemoryStorage::new()), &SinkConfig::default()).unwrap();
        ListenerManager::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            sink,
            Duration::from_millis(200),
        )
    }

    #[tokio::test]
    async fn test_bind_failure_is_isolated() {
        let taken = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let busy_port = taken.local_addr().unwrap().port();

        let mut manager = manager();
        let failures = manager.start_all(&[
            ListenerConfig::new(busy_port, ProtocolTag::Ftp),
            ListenerConfig::new(0, ProtocolTag::Http),
        ]);

        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].port(), busy_port);
        assert!(matches!(
            manager.status(busy_port),
            Some(ListenerStatus::BindFailed(_))
        ));
        assert_eq!(manager.running_count(), 1);
        assert_eq!(manager.stats().len(), 1);

        manager.stop_all().await;
        assert_eq!(manager.running_count(), 0);
        assert!(manager
            .statuses()
            .iter()
            .any(|(_, status)| *status == ListenerStatus::Stopped));
    }

    #[tokio::test]
    async fn test_failed_event_updates_status() {
        let mut manager = manager();
        let addr = manager
            .start(ListenerConfig::new(0, ProtocolTag::Shell))
            .unwrap();

        // stand in for an accept loop reporting its death
        manager
            .events_tx
            .send(ListenerEvent::Failed {
                port: addr.port(),
                reason: "socket closed".to_string(),
            })
            .await
            .unwrap();

        let event = manager.next_event().await.unwrap();
        assert!(matches!(event, ListenerEvent::Failed { port, .. } if port == addr.port()));
        assert_eq!(
            manager.status(addr.port()),
            Some(&ListenerStatus::Failed("socket closed".to_string()))
        );
        assert_eq!(manager.running_count(), 0);
        manager.stop_all().await;
    }
}
