//! # Listener
//!
//! A [`Listener`] accepts TCP connections on one port and runs one
//! [`ConnectionSession`] per accepted connection, up to the configured
//! concurrency cap. Connections beyond the cap are closed immediately, before
//! any emulator is created, and counted in `rejected_at_capacity`.
//!
//! ```text
//! ┌──────────┐  accept   ┌───────────────┐ slot free ┌───────────────────┐
//! │ TcpSocket│─────────▶ │  accept loop  │─────────▶ │ ConnectionSession │──▶ EventSink
//! └──────────┘           │ (one task)    │           │ (JoinSet task)    │
//!                        └───────┬───────┘           └───────────────────┘
//!                                │ at capacity
//!                                ▼
//!                          close + count
//! ```
//!
//! Stopping a listener signals every session through a `watch` channel, waits
//! up to the shutdown grace period for them to publish their terminal records,
//! then aborts the stragglers.

use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

use super::connection_session::ConnectionSession;
use super::types::{
    shutdown_requested, ListenerCounters, ListenerEvent, ListenerStats, SessionRequest,
};
use crate::configuration::types::{ListenerConfig, ProtocolTag};
use crate::error_handling::types::NetworkError;
use crate::event_sink::EventSink;

/// Consecutive transient accept errors tolerated before the listener gives up.
pub const MAX_CONSECUTIVE_ACCEPT_ERRORS: u32 = 64;

/// Pause after a transient accept error, e.g. while file descriptors are
/// exhausted.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

const LISTEN_BACKLOG: u32 = 1024;

/// Accept errors that concern a single connection or a momentary resource
/// shortage rather than the listening socket itself.
fn is_transient_accept_error(e: &io::Error) -> bool {
    use io::ErrorKind::*;
    if matches!(
        e.kind(),
        ConnectionAborted | ConnectionReset | ConnectionRefused | Interrupted | WouldBlock | TimedOut
    ) {
        return true;
    }
    // ENFILE, EMFILE, ENOMEM, ENOBUFS
    matches!(e.raw_os_error(), Some(23) | Some(24) | Some(12) | Some(105))
}

/// Source of accepted connections for the accept loop.
trait Acceptor: Send + 'static {
    fn accept(&mut self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send;
}

impl Acceptor for TcpListener {
    fn accept(&mut self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        TcpListener::accept(self)
    }
}

fn bind_socket(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}

/// Everything the accept loop needs, shared with the handle for stats.
struct ListenerContext {
    config: Arc<ListenerConfig>,
    port: u16,
    sink: Arc<EventSink>,
    counters: Arc<ListenerCounters>,
    grace: Duration,
    events: Option<mpsc::Sender<ListenerEvent>>,
}

pub struct Listener;

impl Listener {
    /// Binds `bind_ip:config.port` and starts accepting.
    ///
    /// Must be called from within a Tokio runtime. Port 0 binds an ephemeral
    /// port; [`ListenerHandle::local_addr`] reports the actual one.
    ///
    /// # Errors
    ///
    /// [`NetworkError::BindError`] if the socket cannot be created, bound or
    /// put in listening mode. Nothing is spawned in that case.
    pub fn start(
        config: ListenerConfig,
        bind_ip: IpAddr,
        sink: Arc<EventSink>,
        grace: Duration,
        events: Option<mpsc::Sender<ListenerEvent>>,
    ) -> Result<ListenerHandle, NetworkError> {
        let requested = SocketAddr::new(bind_ip, config.port);
        let bind_error = |source| NetworkError::BindError {
            port: config.port,
            source,
        };
        let listener = bind_socket(requested).map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        info!(
            "Listening on {} ({}, max {} concurrent connection(s))",
            local_addr, config.protocol, config.max_concurrent_connections
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let counters = Arc::new(ListenerCounters::default());
        let protocol = config.protocol;
        let ctx = ListenerContext {
            config: Arc::new(config),
            port: local_addr.port(),
            sink,
            counters: Arc::clone(&counters),
            grace,
            events,
        };
        let task = tokio::spawn(accept_loop(listener, ctx, shutdown_rx));

        Ok(ListenerHandle {
            local_addr,
            protocol,
            counters,
            shutdown: shutdown_tx,
            task,
        })
    }
}

/// Owner's side of a running listener.
pub struct ListenerHandle {
    local_addr: SocketAddr,
    protocol: ProtocolTag,
    counters: Arc<ListenerCounters>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<(), NetworkError>>,
}

impl ListenerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn stats(&self) -> ListenerStats {
        self.counters.snapshot(self.port(), self.protocol)
    }

    /// True once the accept loop and all of its sessions are gone.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops accepting, lets in-flight sessions finish within the grace
    /// period, and waits for the listener task.
    ///
    /// Returns the listener's failure if it had already died.
    pub async fn stop(self) -> Result<(), NetworkError> {
        let port = self.port();
        let _ = self.shutdown.send(true);
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(NetworkError::ListenerFailed {
                port,
                source: io::Error::other(e.to_string()),
            }),
        }
    }
}

async fn accept_loop<A: Acceptor>(
    mut listener: A,
    ctx: ListenerContext,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), NetworkError> {
    let mut sessions = JoinSet::new();
    let mut consecutive_errors = 0u32;
    let session_shutdown = shutdown.clone();

    let result = loop {
        tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => break Ok(()),
            Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                log_join(joined);
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    consecutive_errors = 0;
                    admit(&ctx, stream, peer, &mut sessions, &session_shutdown);
                }
                Err(e) if is_transient_accept_error(&e) => {
                    consecutive_errors += 1;
                    if consecutive_errors > MAX_CONSECUTIVE_ACCEPT_ERRORS {
                        break Err(NetworkError::ListenerFailed { port: ctx.port, source: e });
                    }
                    warn!("Port {}: transient accept error: {}", ctx.port, e);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
                Err(e) => break Err(NetworkError::ListenerFailed { port: ctx.port, source: e }),
            }
        }
    };
    drop(listener);

    if let Err(e) = &result {
        error!("[!] {}", e);
        if let Some(events) = &ctx.events {
            let event = ListenerEvent::Failed {
                port: ctx.port,
                reason: e.to_string(),
            };
            match events.try_send(event) {
                Ok(()) | Err(TrySendError::Closed(_)) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("Port {}: manager event queue full, failure not reported", ctx.port)
                }
            }
        }
        // sessions already accepted run on under their own deadlines
        tokio::select! {
            _ = join_all(&mut sessions) => {}
            _ = shutdown_requested(&mut shutdown) => {}
        }
    }

    if !sessions.is_empty() {
        debug!(
            "Port {}: waiting up to {:?} for {} session(s)",
            ctx.port,
            ctx.grace,
            sessions.len()
        );
        if tokio::time::timeout(ctx.grace, join_all(&mut sessions))
            .await
            .is_err()
        {
            warn!(
                "Port {}: aborting {} session(s) after grace period",
                ctx.port,
                sessions.len()
            );
            sessions.abort_all();
            join_all(&mut sessions).await;
        }
    }

    info!("Listener on port {} stopped", ctx.port);
    result
}

fn admit(
    ctx: &ListenerContext,
    stream: TcpStream,
    peer: SocketAddr,
    sessions: &mut JoinSet<()>,
    shutdown: &watch::Receiver<bool>,
) {
    let Some(slot) = ctx
        .counters
        .try_acquire(ctx.config.max_concurrent_connections)
    else {
        ctx.counters
            .rejected_at_capacity
            .fetch_add(1, Ordering::Relaxed);
        debug!("Port {}: at capacity, closing connection from {}", ctx.port, peer);
        drop(stream);
        return;
    };

    ctx.counters.accepted.fetch_add(1, Ordering::Relaxed);
    let session = ConnectionSession::new(
        SessionRequest::new(stream, peer),
        ctx.port,
        Arc::clone(&ctx.config),
        Arc::clone(&ctx.sink),
        shutdown.clone(),
    );
    let counters = Arc::clone(&ctx.counters);
    sessions.spawn(async move {
        let _slot = slot;
        session.run().await;
        counters.completed.fetch_add(1, Ordering::Relaxed);
    });
}

async fn join_all(sessions: &mut JoinSet<()>) {
    while let Some(joined) = sessions.join_next().await {
        log_join(joined);
    }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!("[!] Session task panicked: {}", e);
        }
    }
}
