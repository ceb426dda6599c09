//! Integration tests for the Node public API.
//!
//! Nodes run on loopback with private addresses allowed and the reachability
//! probe skipped unless a test is about the probe.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use destra::{
    hash_content, probe, write_key_files, AddressPolicy, Announcer, IdentitySource, Keypair, Node, NodeOptions,
    ProbeError, ProbePolicy, Registry, RegistryError, RegistryReceipt, RetryPolicy, StartupStep, Transport,
    TransportConfig,
};
use futures::StreamExt;
use tokio::time::timeout;

/// Atomic port counter for unique port allocation across parallel tests.
static PORT_COUNTER: AtomicU16 = AtomicU16::new(31000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

fn test_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], next_port()))
}

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn test_options(dir: &Path) -> NodeOptions {
    let mut options = NodeOptions::new(
        IdentitySource::Keypair(Arc::new(Keypair::generate())),
        test_addr(),
    );
    options.block_store_path = dir.join("blocks");
    options.dht.address_policy = AddressPolicy::AllowPrivate;
    options.probe_policy = ProbePolicy::Skip;
    options
}

async fn start_node(dir: &Path) -> Node {
    Node::start(test_options(dir)).await.expect("node start failed")
}

#[tokio::test]
async fn node_start_and_identity() {
    let dir = tempfile::tempdir().unwrap();
    let node = start_node(dir.path()).await;

    let peer = node.peer_id().to_hex();
    assert_eq!(peer.len(), 64);
    assert!(peer.chars().all(|c| c.is_ascii_hexdigit()));

    let listen = node.listen_multiaddr();
    assert_eq!(listen.peer_id(), Some(node.peer_id()));
    assert_eq!(listen.port(), node.local_addr().port());
    assert!(node.public_multiaddr().is_none());
    assert!(node.reachability().is_none());

    node.shutdown().await;
}

#[tokio::test]
async fn two_transports_exchange_ping_on_a_stream() {
    let a = Transport::new(Arc::new(Keypair::generate()), TransportConfig::default());
    let b_keys = Arc::new(Keypair::generate());
    let b = Transport::new(b_keys.clone(), TransportConfig::default());
    let mut b_incoming = b.take_incoming().await.unwrap();
    let listener = b.listen(test_addr()).await.unwrap();

    let conn = timeout(TEST_TIMEOUT, a.dial(b_keys.peer_id(), &listener.multiaddr()))
        .await
        .expect("dial timed out")
        .expect("dial failed");
    let (mut send, _recv) = conn.open_bi().await.unwrap();
    send.write_all(b"ping").await.unwrap();
    send.finish().await.unwrap();

    let inbound = timeout(TEST_TIMEOUT, b_incoming.recv()).await.unwrap().unwrap();
    assert_eq!(inbound.remote_peer(), a.local_peer_id());
    let (_send, mut recv) = inbound.accept_bi().await.unwrap();
    let received = timeout(TEST_TIMEOUT, recv.read_to_end(64)).await.unwrap().unwrap();
    assert_eq!(received, b"ping");
}

#[tokio::test]
async fn find_providers_yields_storing_node() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let a = start_node(dir_a.path()).await;
    let b = start_node(dir_b.path()).await;

    timeout(TEST_TIMEOUT, b.add_peer(&a.listen_multiaddr()))
        .await
        .expect("add_peer timed out")
        .expect("add_peer failed");

    let key = timeout(TEST_TIMEOUT, a.put_block(b"hello")).await.unwrap().unwrap();
    assert_eq!(key, hash_content(b"hello"));

    let providers: Vec<_> = timeout(
        TEST_TIMEOUT,
        b.find_providers(key).await.expect("lookup failed").collect::<Vec<_>>(),
    )
    .await
    .expect("provider stream did not end");
    assert!(
        providers.iter().any(|p| p.peer_id == a.peer_id()),
        "A should be listed as a provider"
    );

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn fetch_block_from_provider_and_store_locally() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let a = start_node(dir_a.path()).await;
    let b = start_node(dir_b.path()).await;
    b.add_peer(&a.listen_multiaddr()).await.unwrap();

    let key = a.put_block(b"shared content").await.unwrap();
    assert!(!b.has_block(&key).await);

    let data = timeout(TEST_TIMEOUT, b.fetch_block(key)).await.unwrap().unwrap();
    assert_eq!(data, b"shared content");
    assert!(b.has_block(&key).await);
    assert_eq!(b.get_block(&key).await.unwrap(), b"shared content");
}

#[tokio::test]
async fn bootstrap_peers_populate_routing_table() {
    let dirs: Vec<_> = (0..3).map(|_| tempfile::tempdir().unwrap()).collect();
    let seed = start_node(dirs[0].path()).await;
    let first = start_node(dirs[1].path()).await;
    first.add_peer(&seed.listen_multiaddr()).await.unwrap();

    let mut options = test_options(dirs[2].path());
    options.bootstrap_peers = vec![seed.listen_multiaddr()];
    let joiner = Node::start(options).await.unwrap();

    let size = timeout(TEST_TIMEOUT, joiner.bootstrap()).await.unwrap();
    assert_eq!(size, 2, "joiner learns the seed and, through it, the first node");

    let closest = joiner.find_closest_peers(first.peer_id().as_bytes(), 5).await;
    assert_eq!(closest.first(), Some(&first.peer_id()));
}

#[tokio::test]
async fn unreachable_bootstrap_peer_is_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let mut options = test_options(dir.path());
    let ghost = Keypair::generate().peer_id();
    let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
    options.bootstrap_peers = vec![destra::Multiaddr::from_socket_addr(closed).with_peer(ghost)];
    let node = Node::start(options).await.unwrap();

    assert_eq!(timeout(TEST_TIMEOUT, node.bootstrap()).await.unwrap(), 0);
    assert!(node.put_block(b"still works").await.is_ok());
}

#[tokio::test]
async fn startup_fails_at_identity_for_mismatched_keys() {
    let dir = tempfile::tempdir().unwrap();
    let keys = dir.path().join("keys");
    write_key_files(&Keypair::generate(), &keys.join("a.key"), &keys.join("a.pub")).unwrap();
    write_key_files(&Keypair::generate(), &keys.join("b.key"), &keys.join("b.pub")).unwrap();

    let mut options = test_options(dir.path());
    options.identity = IdentitySource::Files {
        private: keys.join("a.key"),
        public: keys.join("b.pub"),
    };
    let err = Node::start(options).await.err().expect("mismatched keys accepted");
    assert_eq!(err.step(), StartupStep::LoadIdentity);

    let mut options = test_options(dir.path());
    options.identity = IdentitySource::Files {
        private: keys.join("missing.key"),
        public: keys.join("missing.pub"),
    };
    let err = Node::start(options).await.err().expect("missing keys accepted");
    assert_eq!(err.step(), StartupStep::LoadIdentity);
}

#[tokio::test]
async fn identity_files_are_loaded_deterministically() {
    let dir = tempfile::tempdir().unwrap();
    let keypair = Keypair::generate();
    let private = dir.path().join("keys/private.key");
    let public = dir.path().join("keys/public.key");
    write_key_files(&keypair, &private, &public).unwrap();

    let mut options = test_options(dir.path());
    options.identity = IdentitySource::Files { private, public };
    let node = Node::start(options).await.unwrap();
    assert_eq!(node.peer_id(), keypair.peer_id());
    assert_eq!(node.public_key(), keypair.public_key_bytes());
}

#[tokio::test]
async fn startup_fails_at_bind_for_occupied_port() {
    let dir = tempfile::tempdir().unwrap();
    let occupied = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();

    let mut options = test_options(dir.path());
    options.listen = occupied.local_addr().unwrap();
    let err = Node::start(options).await.err().expect("bind on occupied port succeeded");
    assert_eq!(err.step(), StartupStep::BindTransport);
}

#[tokio::test]
async fn probe_against_closed_port_is_refused() {
    let closed = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = closed.local_addr().unwrap();
    drop(closed);

    let result = probe(addr.ip(), addr.port(), Duration::from_secs(2)).await;
    assert!(matches!(result.error(), Some(ProbeError::Refused(_))));
}

#[tokio::test]
async fn fatal_probe_failure_aborts_startup() {
    let dir = tempfile::tempdir().unwrap();
    let mut options = test_options(dir.path());
    options.public_ip = Some("10.255.255.1".parse().unwrap());
    options.probe_policy = ProbePolicy::Fatal;
    options.probe_timeout = Duration::from_millis(300);

    let err = timeout(TEST_TIMEOUT, Node::start(options))
        .await
        .unwrap()
        .err()
        .expect("unreachable node started");
    assert_eq!(err.step(), StartupStep::ProbeReachability);
}

#[tokio::test]
async fn degraded_probe_failure_suppresses_announcement() {
    let dir = tempfile::tempdir().unwrap();
    let mut options = test_options(dir.path());
    options.public_ip = Some("10.255.255.1".parse().unwrap());
    options.probe_policy = ProbePolicy::Degraded;
    options.probe_timeout = Duration::from_millis(300);

    let node = timeout(TEST_TIMEOUT, Node::start(options)).await.unwrap().unwrap();
    assert!(!node.reachability().unwrap().is_reachable());

    let registry = Arc::new(CountingRegistry::failing());
    let announcer = Announcer::new(registry.clone(), RetryPolicy::none());
    assert!(node.announce(&announcer).await.unwrap().is_none());
    assert_eq!(registry.calls.load(Ordering::SeqCst), 0);
}

struct CountingRegistry {
    fail: bool,
    calls: AtomicUsize,
    last: std::sync::Mutex<Option<(String, String)>>,
}

impl CountingRegistry {
    fn failing() -> Self {
        Self {
            fail: true,
            calls: AtomicUsize::new(0),
            last: std::sync::Mutex::new(None),
        }
    }

    fn succeeding() -> Self {
        Self {
            fail: false,
            ..Self::failing()
        }
    }
}

#[async_trait]
impl Registry for CountingRegistry {
    async fn update_location(&self, peer_id: &str, multiaddr: &str) -> Result<RegistryReceipt, RegistryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last.lock().unwrap() = Some((peer_id.to_string(), multiaddr.to_string()));
        if self.fail {
            return Err(RegistryError::Unavailable("connection reset".into()));
        }
        Ok(RegistryReceipt {
            tx_hash: "0x01".into(),
            block_number: Some(1),
        })
    }
}

fn reachable_options(dir: &Path) -> NodeOptions {
    let mut options = test_options(dir);
    options.public_ip = Some("127.0.0.1".parse().unwrap());
    options.probe_policy = ProbePolicy::Fatal;
    options
}

#[tokio::test]
async fn transient_registry_error_is_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let node = timeout(TEST_TIMEOUT, Node::start(reachable_options(dir.path())))
        .await
        .unwrap()
        .expect("self probe on loopback should succeed");
    assert!(node.reachability().unwrap().is_reachable());

    let registry = Arc::new(CountingRegistry::failing());
    let retry = RetryPolicy {
        max_attempts: 2,
        initial_backoff: Duration::from_millis(10),
        ..RetryPolicy::default()
    };
    let announcer = Announcer::new(registry.clone(), retry);
    let err = node.announce(&announcer).await.unwrap_err();
    assert!(err.is_transient());
    assert_eq!(registry.calls.load(Ordering::SeqCst), 2);

    let key = node.put_block(b"node keeps running").await.unwrap();
    assert_eq!(node.get_block(&key).await.unwrap(), b"node keeps running");
}

#[tokio::test]
async fn announcement_reports_peer_and_public_address() {
    let dir = tempfile::tempdir().unwrap();
    let node = timeout(TEST_TIMEOUT, Node::start(reachable_options(dir.path())))
        .await
        .unwrap()
        .unwrap();

    let registry = Arc::new(CountingRegistry::succeeding());
    let announcer = Announcer::new(registry.clone(), RetryPolicy::none());
    let receipt = node.announce(&announcer).await.unwrap().unwrap();
    assert_eq!(receipt.block_number, Some(1));

    let (peer, addr) = registry.last.lock().unwrap().clone().unwrap();
    assert_eq!(peer, node.peer_id().to_hex());
    assert_eq!(addr, format!("/ip4/127.0.0.1/tcp/{}", node.local_addr().port()));
}
