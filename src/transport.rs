//! # Transport Layer
//!
//! TCP sockets upgraded to authenticated, encrypted, multiplexed
//! [`Connection`]s. A connection exists only after the handshake in
//! [`crate::handshake`] has verified the remote static key.
//!
//! The transport keeps an LRU-bounded set of open connections keyed by remote
//! peer; a second dial to a peer with an open connection reuses it. Every new
//! connection, inbound or outbound, is also published on a take-once channel so
//! the node can serve the streams the remote side opens on it.

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::handshake::{self, HandshakeError};
use crate::identity::{Keypair, PeerId};
use crate::multiaddr::Multiaddr;
use crate::mux::{Connection, Direction};
use crate::ratelimit::{ConnectionRateLimiter, RateLimitConfig};

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_MAX_CONNECTIONS: usize = 1000;

const NEW_CONNECTION_QUEUE: usize = 128;

/// Pause after a failed `accept()` (e.g. file descriptor exhaustion).
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

type TakeOnce<T> = Mutex<Option<mpsc::Receiver<T>>>;

#[derive(Debug, Error)]
pub enum BindError {
    #[error("address {0} already in use")]
    AddrInUse(SocketAddr),
    #[error("insufficient privilege to bind {0}")]
    PermissionDenied(SocketAddr),
    #[error("invalid listen address {0}")]
    InvalidAddress(SocketAddr),
    #[error("failed to bind {addr}: {source}")]
    Io {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

impl BindError {
    fn from_io(addr: SocketAddr, source: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match source.kind() {
            ErrorKind::AddrInUse => BindError::AddrInUse(addr),
            ErrorKind::PermissionDenied => BindError::PermissionDenied(addr),
            ErrorKind::AddrNotAvailable | ErrorKind::InvalidInput => BindError::InvalidAddress(addr),
            _ => BindError::Io { addr, source },
        }
    }
}

#[derive(Debug, Error)]
pub enum DialError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("dial to {addr} timed out after {after:?}")]
    Timeout { addr: SocketAddr, after: Duration },
    #[error("connection to {0} refused")]
    Refused(SocketAddr),
    #[error("{addr} unreachable: {source}")]
    Unreachable {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("refusing to dial self")]
    SelfDial,
}

#[derive(Clone, Debug)]
pub struct TransportConfig {
    pub dial_timeout: Duration,
    pub handshake_timeout: Duration,
    pub max_connections: usize,
    pub rate_limit: RateLimitConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            rate_limit: RateLimitConfig::default(),
        }
    }
}

struct TransportInner {
    keypair: Arc<Keypair>,
    local_peer: PeerId,
    config: TransportConfig,
    connections: RwLock<LruCache<PeerId, Connection>>,
    next_connection_id: AtomicU64,
    new_connections_tx: mpsc::Sender<Connection>,
    new_connections_rx: TakeOnce<Connection>,
    rate_limiter: ConnectionRateLimiter,
}

/// Dials and accepts connections on behalf of one local identity.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

impl Transport {
    pub fn new(keypair: Arc<Keypair>, config: TransportConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_connections).unwrap_or(NonZeroUsize::MIN);
        let (tx, rx) = mpsc::channel(NEW_CONNECTION_QUEUE);
        let local_peer = keypair.peer_id();
        Self {
            inner: Arc::new(TransportInner {
                keypair,
                local_peer,
                rate_limiter: ConnectionRateLimiter::new(config.rate_limit),
                config,
                connections: RwLock::new(LruCache::new(capacity)),
                next_connection_id: AtomicU64::new(1),
                new_connections_tx: tx,
                new_connections_rx: Mutex::new(Some(rx)),
            }),
        }
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.inner.local_peer
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    /// Receiver for every connection established from now on. Returns `None` after the first call.
    pub async fn take_incoming(&self) -> Option<mpsc::Receiver<Connection>> {
        self.inner.new_connections_rx.lock().await.take()
    }

    /// Bind `addr` and start accepting connections.
    pub async fn listen(&self, addr: SocketAddr) -> Result<Listener, BindError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| BindError::from_io(addr, e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| BindError::from_io(addr, e))?;

        info!(addr = %local_addr, peer = %self.inner.local_peer, "transport listening");

        let transport = self.clone();
        let task = tokio::spawn(async move { transport.accept_loop(listener).await });

        Ok(Listener {
            local_addr,
            local_peer: self.inner.local_peer,
            task,
        })
    }

    async fn accept_loop(self, listener: TcpListener) {
        loop {
            let (stream, remote) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    continue;
                }
            };

            if !self.inner.rate_limiter.allow(remote.ip()).await {
                debug!(addr = %remote, "inbound connection rate limited");
                continue;
            }

            let transport = self.clone();
            tokio::spawn(async move {
                if let Err(e) = transport.upgrade_inbound(stream, remote).await {
                    debug!(addr = %remote, error = %e, "inbound handshake failed");
                }
            });
        }
    }

    async fn upgrade_inbound(&self, mut stream: TcpStream, remote: SocketAddr) -> Result<(), HandshakeError> {
        let _ = stream.set_nodelay(true);
        let session = handshake::respond(
            &mut stream,
            &self.inner.keypair,
            self.inner.config.handshake_timeout,
        )
        .await?;
        let conn = self.establish(stream, session, remote, Direction::Inbound);
        debug!(peer = ?conn.remote_peer(), addr = %remote, "inbound connection established");
        self.register(conn).await;
        Ok(())
    }

    /// Dial `peer_id` at `addr`, reusing an open connection when there is one.
    pub async fn dial(&self, peer_id: PeerId, addr: &Multiaddr) -> Result<Connection, DialError> {
        if peer_id == self.inner.local_peer {
            return Err(DialError::SelfDial);
        }
        if let Some(embedded) = addr.peer_id() {
            if embedded != peer_id {
                return Err(DialError::InvalidAddress(format!(
                    "{addr} names peer {embedded}, expected {peer_id}"
                )));
            }
        }
        if let Some(conn) = self.connection(&peer_id).await {
            trace!(peer = ?peer_id, "reusing open connection");
            return Ok(conn);
        }

        let dial_timeout = self.inner.config.dial_timeout;
        let targets = tokio::time::timeout(dial_timeout, addr.resolve())
            .await
            .map_err(|_| DialError::InvalidAddress(format!("{addr}: resolution timed out")))?
            .map_err(|e| DialError::InvalidAddress(format!("{addr}: {e}")))?;
        if targets.is_empty() {
            return Err(DialError::InvalidAddress(format!("{addr}: no usable addresses")));
        }

        let mut last_error = None;
        for target in targets {
            match self.dial_socket(peer_id, target).await {
                Ok(conn) => return Ok(conn),
                Err(e @ DialError::Handshake(_)) => return Err(e),
                Err(e) => {
                    debug!(peer = ?peer_id, addr = %target, error = %e, "dial attempt failed");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| DialError::InvalidAddress(addr.to_string())))
    }

    async fn dial_socket(&self, peer_id: PeerId, target: SocketAddr) -> Result<Connection, DialError> {
        let dial_timeout = self.inner.config.dial_timeout;
        let mut stream = match tokio::time::timeout(dial_timeout, TcpStream::connect(target)).await {
            Err(_) => {
                return Err(DialError::Timeout {
                    addr: target,
                    after: dial_timeout,
                })
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                return Err(DialError::Refused(target))
            }
            Ok(Err(e)) => {
                return Err(DialError::Unreachable {
                    addr: target,
                    source: e,
                })
            }
            Ok(Ok(stream)) => stream,
        };
        let _ = stream.set_nodelay(true);

        let session = handshake::initiate(
            &mut stream,
            &self.inner.keypair,
            Some(peer_id),
            self.inner.config.handshake_timeout,
        )
        .await?;

        let conn = self.establish(stream, session, target, Direction::Outbound);
        debug!(peer = ?peer_id, addr = %target, "outbound connection established");
        self.register(conn.clone()).await;
        Ok(conn)
    }

    fn establish(
        &self,
        stream: TcpStream,
        session: handshake::Session,
        remote: SocketAddr,
        direction: Direction,
    ) -> Connection {
        let id = self.inner.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let (reader, writer) = stream.into_split();
        let handshake::Session {
            remote_peer, keys, ..
        } = session;
        Connection::spawn(reader, writer, keys, remote_peer, remote, direction, id)
    }

    async fn register(&self, conn: Connection) {
        let peer = conn.remote_peer();
        {
            let mut connections = self.inner.connections.write().await;
            if let Some((evicted_peer, evicted)) = connections.push(peer, conn.clone()) {
                if evicted_peer != peer {
                    debug!(peer = ?evicted_peer, "closing least recently used connection");
                    evicted.close();
                }
            }
        }

        let transport = self.clone();
        let watched = conn.clone();
        tokio::spawn(async move {
            watched.closed().await;
            let mut connections = transport.inner.connections.write().await;
            if connections
                .peek(&peer)
                .is_some_and(|c| c.id() == watched.id())
            {
                connections.pop(&peer);
            }
        });

        if let Err(e) = self.inner.new_connections_tx.try_send(conn) {
            warn!(peer = ?peer, error = %e, "connection not handed to stream server");
        }
    }

    /// An open connection to `peer`, if one exists.
    pub async fn connection(&self, peer: &PeerId) -> Option<Connection> {
        let mut connections = self.inner.connections.write().await;
        match connections.get(peer) {
            Some(conn) if !conn.is_closed() => Some(conn.clone()),
            Some(_) => {
                connections.pop(peer);
                None
            }
            None => None,
        }
    }

    /// Drop the cached connection to `peer` after a failure on it.
    pub async fn invalidate(&self, peer: &PeerId) {
        if let Some(conn) = self.inner.connections.write().await.pop(peer) {
            debug!(peer = ?peer, "invalidated cached connection");
            conn.close();
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.connections.read().await.len()
    }

    /// Close every open connection.
    pub async fn close_all(&self) {
        let mut connections = self.inner.connections.write().await;
        for (_, conn) in connections.iter() {
            conn.close();
        }
        connections.clear();
    }
}

/// A bound listening socket. Dropping it stops accepting new connections.
pub struct Listener {
    local_addr: SocketAddr,
    local_peer: PeerId,
    task: JoinHandle<()>,
}

impl Listener {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `/ip4/<ip>/tcp/<port>/p2p/<peer>` for the bound socket.
    pub fn multiaddr(&self) -> Multiaddr {
        Multiaddr::from_socket_addr(self.local_addr).with_peer(self.local_peer)
    }

    pub fn close(&self) {
        self.task.abort();
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn transport() -> Transport {
        Transport::new(Arc::new(Keypair::generate()), TransportConfig::default())
    }

    async fn listening() -> (Transport, Listener) {
        let t = transport();
        let l = t.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
        (t, l)
    }

    #[tokio::test]
    async fn dial_and_exchange_on_stream() {
        let (b, b_listener) = listening().await;
        let mut b_incoming = b.take_incoming().await.unwrap();
        let a = transport();

        let conn = a
            .dial(b.local_peer_id(), &b_listener.multiaddr())
            .await
            .unwrap();
        assert_eq!(conn.remote_peer(), b.local_peer_id());

        let (mut send, _recv) = conn.open_bi().await.unwrap();
        send.write_all(b"ping").await.unwrap();
        send.finish().await.unwrap();

        let inbound = b_incoming.recv().await.unwrap();
        assert_eq!(inbound.remote_peer(), a.local_peer_id());
        let (_s, mut recv) = inbound.accept_bi().await.unwrap();
        assert_eq!(recv.read_to_end(64).await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn second_dial_reuses_connection() {
        let (b, b_listener) = listening().await;
        let a = transport();
        let first = a.dial(b.local_peer_id(), &b_listener.multiaddr()).await.unwrap();
        let second = a.dial(b.local_peer_id(), &b_listener.multiaddr()).await.unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(a.connection_count().await, 1);
    }

    #[tokio::test]
    async fn dial_wrong_peer_fails_handshake() {
        let (_b, b_listener) = listening().await;
        let a = transport();
        let wrong = Keypair::generate().peer_id();
        let addr = Multiaddr::from_socket_addr(b_listener.local_addr());
        let err = a.dial(wrong, &addr).await.unwrap_err();
        assert!(
            matches!(err, DialError::Handshake(HandshakeError::PeerIdMismatch { .. })),
            "unexpected error {err:?}"
        );
        assert_eq!(a.connection_count().await, 0);
    }

    #[tokio::test]
    async fn dial_closed_port_is_refused() {
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let a = transport();
        let addr: Multiaddr = format!("/ip4/127.0.0.1/tcp/{port}").parse().unwrap();
        let err = a.dial(Keypair::generate().peer_id(), &addr).await.unwrap_err();
        assert!(matches!(err, DialError::Refused(_)), "unexpected error {err:?}");
    }

    #[tokio::test]
    async fn dial_unresponsive_peer_fails_within_bound() {
        let a = Transport::new(
            Arc::new(Keypair::generate()),
            TransportConfig {
                dial_timeout: Duration::from_millis(300),
                ..TransportConfig::default()
            },
        );
        let addr: Multiaddr = "/ip4/10.255.255.1/tcp/9".parse().unwrap();
        let started = Instant::now();
        let err = a.dial(Keypair::generate().peer_id(), &addr).await.unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(
            matches!(err, DialError::Timeout { .. } | DialError::Unreachable { .. }),
            "unexpected error {err:?}"
        );
    }

    #[tokio::test]
    async fn self_dial_rejected() {
        let (a, listener) = listening().await;
        let err = a.dial(a.local_peer_id(), &listener.multiaddr()).await.unwrap_err();
        assert!(matches!(err, DialError::SelfDial));
    }

    #[tokio::test]
    async fn bind_occupied_port_fails() {
        let (_a, listener) = listening().await;
        let b = transport();
        let err = b.listen(listener.local_addr()).await.unwrap_err();
        assert!(matches!(err, BindError::AddrInUse(_)), "unexpected error {err:?}");
    }

    #[tokio::test]
    async fn closed_connection_pruned_from_active_set() {
        let (b, b_listener) = listening().await;
        let a = transport();
        let conn = a.dial(b.local_peer_id(), &b_listener.multiaddr()).await.unwrap();
        conn.close();
        assert!(a.connection(&b.local_peer_id()).await.is_none());

        let fresh = a.dial(b.local_peer_id(), &b_listener.multiaddr()).await.unwrap();
        assert_ne!(fresh.id(), conn.id());
    }
}
