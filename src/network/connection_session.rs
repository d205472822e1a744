//! # Connection Session
//!
//! One [`ConnectionSession`] owns one accepted connection for its whole life:
//! it writes the emulator greeting, reads attacker bytes under the
//! per-connection deadline and byte quota, feeds them to the protocol
//! emulator, publishes intermediate records, and always finishes with exactly
//! one terminal record.
//!
//! ```text
//!            ┌────────────── deadline / shutdown ──────────────┐
//!            ▼                                                 │
//! stream ─ read ─▶ quota check ─▶ emulator.consume ─▶ write response
//!            │            │               │
//!            │            │               └─▶ intermediate records ─▶ EventSink
//!            └────────────┴─▶ terminal record (reason + closed_by) ─▶ EventSink
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, trace};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::{timeout, timeout_at, Instant};
use uuid::Uuid;

use super::types::{shutdown_requested, SessionRequest};
use crate::configuration::types::ListenerConfig;
use crate::emulation::{emulator_for, Flow, Observation, ProtocolEmulator};
use crate::error_handling::types::SessionFault;
use crate::event::{ClosedBy, EventRecord, Summary, Termination, TerminationReason};
use crate::event_sink::EventSink;

/// Largest single read from the peer.
const READ_BUFFER_SIZE: usize = 4096;

/// Upper bound on the final stream shutdown, which may block on a peer that
/// stopped reading.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Outcome {
    reason: TerminationReason,
    closed_by: ClosedBy,
}

impl Outcome {
    fn new(reason: TerminationReason, closed_by: ClosedBy) -> Self {
        Self { reason, closed_by }
    }
}

pub struct ConnectionSession<S> {
    id: Uuid,
    stream: S,
    peer: SocketAddr,
    port: u16,
    config: Arc<ListenerConfig>,
    sink: Arc<EventSink>,
    shutdown: watch::Receiver<bool>,
    accepted_at: DateTime<Utc>,
    first_byte_at: Option<DateTime<Utc>>,
    bytes_received: u64,
    excerpt: Vec<u8>,
    records_published: usize,
    records_suppressed: u64,
}

impl<S> ConnectionSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// `port` is the port the connection was actually accepted on.
    pub fn new(
        request: SessionRequest<S>,
        port: u16,
        config: Arc<ListenerConfig>,
        sink: Arc<EventSink>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            stream: request.stream,
            peer: request.client_addr,
            port,
            config,
            sink,
            shutdown,
            accepted_at: request.timestamp,
            first_byte_at: None,
            bytes_received: 0,
            excerpt: Vec::new(),
            records_published: 0,
            records_suppressed: 0,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Drives the connection to completion and returns the terminal record.
    ///
    /// Never fails: every error is folded into the termination reason.
    pub async fn run(mut self) -> Arc<EventRecord> {
        let deadline = Instant::now() + self.config.per_connection_timeout();
        let mut emulator = emulator_for(self.config.protocol, self.config.banner.clone());

        debug!(
            "Session {} started: {} -> {} port {}",
            self.id, self.peer, self.config.protocol, self.port
        );

        let outcome = self.drive(emulator.as_mut(), deadline).await;

        let termination = Termination {
            reason: outcome.reason,
            closed_by: outcome.closed_by,
            bytes_received: self.bytes_received,
        };
        debug!(
            "Session {} from {} ended: {} (closed by {:?}, {} bytes)",
            self.id, self.peer, termination.reason, termination.closed_by, termination.bytes_received
        );

        let mut summary = emulator.summary();
        if self.records_suppressed > 0 {
            summary.insert("suppressed_records", self.records_suppressed.to_string());
        }
        let excerpt = std::mem::take(&mut self.excerpt);
        let occurred_at = self.first_byte_at.unwrap_or(self.accepted_at);
        let record = self.build_record(summary, excerpt, occurred_at, Some(termination));
        let record = self.sink.publish(record);

        if let Ok(Err(e)) = timeout(CLOSE_TIMEOUT, self.stream.shutdown()).await {
            trace!("Session {}: shutdown failed: {}", self.id, e);
        }
        record
    }

    async fn drive(&mut self, emulator: &mut dyn ProtocolEmulator, deadline: Instant) -> Outcome {
        let greeting = emulator.greeting();
        if !greeting.is_empty() {
            if let Err(outcome) = self.send(&greeting, deadline).await {
                return outcome;
            }
        }

        let cap = self.config.per_connection_byte_cap;
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            // one byte past the quota is enough to tell the peer went over it
            let remaining = cap.saturating_sub(self.bytes_received);
            let want = usize::try_from(remaining.saturating_add(1))
                .unwrap_or(usize::MAX)
                .min(buf.len());

            let read = tokio::select! {
                biased;
                _ = shutdown_requested(&mut self.shutdown) => {
                    return Outcome::new(TerminationReason::NormalClose, ClosedBy::Listener);
                }
                read = timeout_at(deadline, self.stream.read(&mut buf[..want])) => read,
            };

            let n = match read {
                Err(_) => return Outcome::new(TerminationReason::Timeout, ClosedBy::Listener),
                Ok(Err(e)) => {
                    return Outcome::new(
                        TerminationReason::Fault(SessionFault::from(e)),
                        ClosedBy::Peer,
                    )
                }
                Ok(Ok(0)) => return Outcome::new(TerminationReason::NormalClose, ClosedBy::Peer),
                Ok(Ok(n)) => n,
            };
            let received_at = Utc::now();
            self.first_byte_at.get_or_insert(received_at);

            self.bytes_received += n as u64;
            let over_quota = self.bytes_received > cap;
            let in_quota = if over_quota {
                let excess = usize::try_from(self.bytes_received - cap).unwrap_or(n);
                n.saturating_sub(excess)
            } else {
                n
            };
            let chunk = &buf[..in_quota];
            self.capture(chunk);

            if over_quota {
                // the in-quota bytes still count; the emulator's reply and any
                // fault they cause are moot once the quota is gone
                if !chunk.is_empty() {
                    if let Ok(consumed) = emulator.consume(chunk) {
                        self.publish_intermediate(consumed.records, received_at);
                    }
                }
                return Outcome::new(TerminationReason::QuotaExceeded, ClosedBy::Listener);
            }

            let consumed = match emulator.consume(chunk) {
                Ok(consumed) => consumed,
                Err(fault) => {
                    debug!("Session {}: {}", self.id, fault);
                    return Outcome::new(TerminationReason::Fault(fault), ClosedBy::Listener);
                }
            };
            self.publish_intermediate(consumed.records, received_at);

            if !consumed.response.is_empty() {
                if let Err(outcome) = self.send(&consumed.response, deadline).await {
                    return outcome;
                }
            }
            if consumed.flow == Flow::Terminate {
                return Outcome::new(TerminationReason::NormalClose, ClosedBy::Emulator);
            }
        }
    }

    async fn send(&mut self, bytes: &[u8], deadline: Instant) -> Result<(), Outcome> {
        match timeout_at(deadline, self.stream.write_all(bytes)).await {
            Err(_) => Err(Outcome::new(TerminationReason::Timeout, ClosedBy::Listener)),
            Ok(Err(e)) => Err(Outcome::new(
                TerminationReason::Fault(SessionFault::from(e)),
                ClosedBy::Peer,
            )),
            Ok(Ok(())) => Ok(()),
        }
    }

    /// Keeps the first `raw_excerpt_cap` bytes of the session.
    fn capture(&mut self, chunk: &[u8]) {
        let room = self.config.raw_excerpt_cap.saturating_sub(self.excerpt.len());
        self.excerpt.extend_from_slice(&chunk[..room.min(chunk.len())]);
    }

    /// Publishes up to `max_records_per_session` records over the session's
    /// life; the rest are only counted for the terminal record.
    fn publish_intermediate(&mut self, observations: Vec<Observation>, received_at: DateTime<Utc>) {
        for observation in observations {
            if self.records_published >= self.config.max_records_per_session {
                if self.records_suppressed == 0 {
                    debug!(
                        "Session {}: record limit of {} reached, counting the rest",
                        self.id, self.config.max_records_per_session
                    );
                }
                self.records_suppressed += 1;
                continue;
            }
            let Observation {
                summary,
                mut excerpt,
            } = observation;
            excerpt.truncate(self.config.raw_excerpt_cap);
            let record = self.build_record(summary, excerpt, received_at, None);
            self.sink.publish(record);
            self.records_published += 1;
        }
    }

    fn build_record(
        &self,
        summary: Summary,
        raw_excerpt: Vec<u8>,
        occurred_at: DateTime<Utc>,
        termination: Option<Termination>,
    ) -> EventRecord {
        EventRecord {
            id: self.sink.next_id(),
            session_id: self.id,
            occurred_at,
            source_address: self.peer,
            protocol: self.config.protocol,
            port: self.port,
            summary,
            raw_excerpt,
            termination,
        }
    }
}
