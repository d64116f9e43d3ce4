//! TCP listener for the NDJSON service.
//!
//! The accept loop is sequential. Each accepted connection first takes a
//! permit from a semaphore sized by [`ServerConfig::max_connections`], is
//! recorded in the [`ConnectionRegistry`], and then runs on its own tokio task
//! with exclusive ownership of the stream. Handlers share only the read-only
//! [`DispatchTable`] and the registry.

use crate::config::ServerConfig;
use crate::dispatch::DispatchTable;
use crate::error::{Result, ServerError};
use crate::service::{Service, SessionSummary};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use uuid::Uuid;

/// Pause after a failed accept so persistent errors (e.g. EMFILE) do not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Metadata for one live connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    /// Unique connection identifier
    pub id: Uuid,
    /// Remote address
    pub peer: SocketAddr,
    /// When the connection was accepted
    pub connected_at: DateTime<Utc>,
}

/// Live connections plus lifetime counters.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    active: Mutex<HashMap<Uuid, ConnectionInfo>>,
    total_connections: AtomicU64,
    total_responses: AtomicU64,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new connection. It stays registered until the guard drops.
    pub fn register(self: &Arc<Self>, peer: SocketAddr) -> ConnectionGuard {
        let info = ConnectionInfo {
            id: Uuid::new_v4(),
            peer,
            connected_at: Utc::now(),
        };
        self.active.lock().insert(info.id, info.clone());
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            registry: Arc::clone(self),
            info,
        }
    }

    /// Number of live connections.
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Live connections, oldest first.
    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        let mut connections: Vec<ConnectionInfo> = self.active.lock().values().cloned().collect();
        connections.sort_by(|a, b| a.connected_at.cmp(&b.connected_at).then(a.id.cmp(&b.id)));
        connections
    }

    /// Connections accepted since startup.
    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    /// Responses written since startup, including by sessions that ended on
    /// an error or at shutdown.
    pub fn total_responses(&self) -> u64 {
        self.total_responses.load(Ordering::Relaxed)
    }
}

/// Registration handle for one connection; deregisters on drop.
#[derive(Debug)]
pub struct ConnectionGuard {
    registry: Arc<ConnectionRegistry>,
    info: ConnectionInfo,
}

impl ConnectionGuard {
    /// Connection identifier.
    pub fn id(&self) -> Uuid {
        self.info.id
    }

    /// Remote address.
    pub fn peer(&self) -> SocketAddr {
        self.info.peer
    }

    fn finish(&self, summary: &SessionSummary) {
        self.registry
            .total_responses
            .fetch_add(summary.responses, Ordering::Relaxed);
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.registry.active.lock().remove(&self.info.id);
    }
}

/// Bound TCP server, ready to accept connections.
pub struct Server {
    listener: TcpListener,
    service: Service,
    registry: Arc<ConnectionRegistry>,
    limiter: Arc<Semaphore>,
}

impl Server {
    /// Validate `config` and bind its listen address.
    ///
    /// A bind failure is returned as [`ServerError::Bind`]; callers treat it as
    /// fatal.
    pub async fn bind(config: &ServerConfig, table: Arc<DispatchTable>) -> Result<Self> {
        config.validate()?;
        let listener =
            TcpListener::bind(&config.listen)
                .await
                .map_err(|source| ServerError::Bind {
                    addr: config.listen.clone(),
                    source,
                })?;

        Ok(Self {
            listener,
            service: Service::from_config(table, config),
            registry: Arc::new(ConnectionRegistry::new()),
            limiter: Arc::new(Semaphore::new(config.max_connections)),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Registry of live connections.
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Accept connections until the process exits.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Accept connections until `signal` completes, then close every open
    /// connection and wait for its handler to finish.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let addr = self.local_addr()?;
        tracing::info!(addr = %addr, "courier listening");
        accept_loop(
            &self.listener,
            &self.service,
            &self.registry,
            &self.limiter,
            signal,
        )
        .await
    }
}

/// Source of inbound connections for [`accept_loop`].
pub(crate) trait Accept: Sync {
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send;
}

impl Accept for TcpListener {
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        TcpListener::accept(self)
    }
}

async fn accept_loop<L, F>(
    listener: &L,
    service: &Service,
    registry: &Arc<ConnectionRegistry>,
    limiter: &Arc<Semaphore>,
    signal: F,
) -> Result<()>
where
    L: Accept,
    F: Future<Output = ()>,
{
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handlers = JoinSet::new();
    tokio::pin!(signal);

    loop {
        let permit = tokio::select! {
            _ = &mut signal => break,
            permit = Arc::clone(limiter).acquire_owned() => permit
                .map_err(|_| ServerError::Io(io::Error::other("connection limiter closed")))?,
        };

        let (stream, peer) = tokio::select! {
            _ = &mut signal => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to accept connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            },
        };

        let guard = registry.register(peer);
        let service = service.clone();
        let shutdown = shutdown_rx.clone();
        handlers.spawn(async move {
            handle_connection(service, stream, guard, shutdown).await;
            drop(permit);
        });

        while let Some(joined) = handlers.try_join_next() {
            if let Err(err) = joined {
                tracing::error!(error = %err, "connection handler aborted");
            }
        }
    }

    tracing::info!(
        active = registry.active_count(),
        "shutting down; closing open connections"
    );
    // Receivers only fail once the sender is gone, which it is not.
    let _ = shutdown_tx.send(true);
    while let Some(joined) = handlers.join_next().await {
        if let Err(err) = joined {
            tracing::error!(error = %err, "connection handler aborted");
        }
    }
    Ok(())
}

async fn handle_connection(
    service: Service,
    stream: TcpStream,
    guard: ConnectionGuard,
    mut shutdown: watch::Receiver<bool>,
) {
    let id = guard.id();
    let peer = guard.peer();
    stream.set_nodelay(true).ok();
    tracing::debug!(connection = %id, peer = %peer, "connection opened");

    let (read_half, write_half) = stream.into_split();
    let mut summary = SessionSummary::default();
    tokio::select! {
        result = service.serve_into(BufReader::new(read_half), write_half, &mut summary) => {
            if let Err(err) = result {
                tracing::warn!(connection = %id, peer = %peer, error = %err, "connection error");
            }
        }
        _ = shutdown.wait_for(|stop| *stop) => {
            tracing::debug!(connection = %id, peer = %peer, "connection closed by shutdown");
        }
    }

    guard.finish(&summary);
    tracing::debug!(
        connection = %id,
        peer = %peer,
        responses = summary.responses,
        errors = summary.errors,
        end = ?summary.end,
        "connection closed"
    );
}
