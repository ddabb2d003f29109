//! Per-endpoint network resources.
//!
//! - [`ConnectionTable`]: a client's outbound connections, keyed by target id
//! - [`ListenerHandle`]: a server's bound listener
//! - [`EndpointCounters`]: traffic counters, readable without the engine lock
//!
//! Every table has its own lock, held only for map mutation. Socket I/O
//! happens on cloned `Arc<PeerConnection>` handles outside it.

use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    task::Poll,
    time::Duration,
};

use retrace_core::EndpointId;
use serde::Serialize;
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    sync::Mutex as AsyncMutex,
};
use tokio_util::sync::CancellationToken;

use crate::error::MessageError;

/// An open outbound stream.
///
/// Closing cancels `closed` so an in-flight write gives up, then the stream
/// is dropped together with the last handle.
#[derive(Debug)]
pub struct PeerConnection {
    stream: AsyncMutex<TcpStream>,
    closed: CancellationToken,
}

impl PeerConnection {
    /// Wrap a connected stream.
    pub fn new(stream: TcpStream) -> Self {
        Self { stream: AsyncMutex::new(stream), closed: CancellationToken::new() }
    }

    /// Write `payload` in full, bounded by `timeout`.
    pub async fn write(&self, payload: &[u8], timeout: Duration) -> Result<(), MessageError> {
        let write = async {
            let mut stream = self.stream.lock().await;
            stream.write_all(payload).await?;
            stream.flush().await
        };

        tokio::select! {
            () = self.closed.cancelled() => Err(MessageError::ConnectionClosed),
            result = tokio::time::timeout(timeout, write) => match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(source)) => Err(MessageError::Write { source }),
                Err(_) => Err(MessageError::WriteTimeout { timeout }),
            },
        }
    }

    /// Shut down the write half and mark the connection closed.
    pub async fn close(&self) {
        self.closed.cancel();
        let mut stream = self.stream.lock().await;
        if let Err(e) = stream.shutdown().await {
            tracing::debug!("shutdown failed: {}", e);
        }
    }

    /// Mark closed without waiting for the writer lock.
    ///
    /// The socket is released when the last handle drops.
    pub fn abort(&self) {
        self.closed.cancel();
    }

    /// Returns true once closed or aborted.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

/// Outbound connections of one client endpoint.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    peers: Mutex<HashMap<EndpointId, Arc<PeerConnection>>>,
}

impl ConnectionTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    fn peers(&self) -> MutexGuard<'_, HashMap<EndpointId, Arc<PeerConnection>>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a connection to `target` unless `run` was cancelled.
    ///
    /// The check happens under the table lock so a concurrent teardown
    /// cannot miss the new entry. A replaced connection is aborted. Returns
    /// false, and aborts `conn`, when the run is already cancelled.
    pub fn insert(
        &self,
        target: EndpointId,
        conn: Arc<PeerConnection>,
        run: &CancellationToken,
    ) -> bool {
        let mut peers = self.peers();
        if run.is_cancelled() {
            conn.abort();
            return false;
        }
        if let Some(previous) = peers.insert(target, conn) {
            previous.abort();
        }
        true
    }

    /// Connection to `target`, if open.
    pub fn get(&self, target: EndpointId) -> Option<Arc<PeerConnection>> {
        self.peers().get(&target).cloned()
    }

    /// Remove the connection to `target`. Returns it for an orderly close.
    pub fn remove(&self, target: EndpointId) -> Option<Arc<PeerConnection>> {
        self.peers().remove(&target)
    }

    /// Abort and drop every connection.
    pub fn close_all(&self) {
        let drained: Vec<_> = self.peers().drain().map(|(_, conn)| conn).collect();
        for conn in drained {
            conn.abort();
        }
    }

    /// Number of open connections.
    pub fn len(&self) -> usize {
        self.peers().len()
    }

    /// Returns true if no connection is open.
    pub fn is_empty(&self) -> bool {
        self.peers().is_empty()
    }
}

/// A bound listener owned by a server endpoint.
///
/// The socket lives in a shared slot so [`close`](Self::close) can release
/// the port synchronously, before the accept loop next runs.
#[derive(Debug, Clone)]
pub struct ListenerHandle {
    /// Address the listener is bound to.
    pub local_addr: SocketAddr,
    socket: Arc<Mutex<Option<TcpListener>>>,
    closed: CancellationToken,
}

impl ListenerHandle {
    /// Take ownership of a bound listener. `closed` stops the accept loop.
    pub fn new(listener: TcpListener, local_addr: SocketAddr, closed: CancellationToken) -> Self {
        Self { local_addr, socket: Arc::new(Mutex::new(Some(listener))), closed }
    }

    fn socket(&self) -> MutexGuard<'_, Option<TcpListener>> {
        self.socket.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Accept the next connection.
    ///
    /// Pends forever once closed; callers select on [`closed`](Self::closed).
    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        std::future::poll_fn(|cx| {
            let socket = self.socket();
            socket.as_ref().map_or(Poll::Pending, |listener| listener.poll_accept(cx))
        })
        .await
    }

    /// Resolves once the handle is closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Stop the accept loop and drop the socket. The port is free on return.
    pub fn close(&self) {
        self.closed.cancel();
        drop(self.socket().take());
    }

    /// Returns true once the socket has been released.
    pub fn is_closed(&self) -> bool {
        self.socket().is_none()
    }
}

/// Traffic counters for one endpoint.
#[derive(Debug, Default)]
pub struct EndpointCounters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    connections_accepted: AtomicU64,
    message_errors: AtomicU64,
}

impl EndpointCounters {
    /// Count a successful data write.
    pub fn record_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Count bytes drained from an accepted connection.
    pub fn record_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Count an accepted connection.
    pub fn record_accept(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a failed message.
    pub fn record_error(&self) {
        self.message_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Current values.
    pub fn snapshot(&self, open_connections: usize) -> EndpointStats {
        EndpointStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            message_errors: self.message_errors.load(Ordering::Relaxed),
            open_connections,
        }
    }
}

/// Point-in-time traffic statistics for one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct EndpointStats {
    /// Payload bytes written by this client.
    pub bytes_sent: u64,
    /// Bytes drained from connections accepted by this server.
    pub bytes_received: u64,
    /// Connections accepted by this server.
    pub connections_accepted: u64,
    /// Messages that failed.
    pub message_errors: u64,
    /// Outbound connections currently open.
    pub open_connections: usize,
}
