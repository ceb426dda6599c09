//! # Node Controller
//!
//! A [`Node`] composes the identity, transport, DHT, block store and
//! reachability probe into one running process. [`Node::start`] performs the
//! startup sequence in a fixed order and fails with a [`StartupError`] naming the
//! step that broke:
//!
//! 1. load identity
//! 2. bind transport
//! 3. attach routing table
//! 4. mount block store (and start serving streams)
//! 5. probe self-reachability
//!
//! ```ignore
//! let node = Node::start(NodeOptions::new(identity, "0.0.0.0:4001".parse()?)).await?;
//! node.bootstrap().await;
//! let key = node.put_block(b"hello").await?;
//! let mut providers = node.find_providers(key).await?;
//! ```

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::blockstore::{hash_content, BlockStore, BlockStoreError, Key};
use crate::dht::{DhtConfig, DhtConfigError, DhtNode, LookupError, ProviderStream};
use crate::identity::{load_from_files, IdentityError, Keypair, PeerId, PeerInfo};
use crate::multiaddr::Multiaddr;
use crate::probe::{self, ProbeError, ProbeOutcome, ReachabilityResult, DEFAULT_PROBE_TIMEOUT};
use crate::protocols::{BlockRpc, IdentifyRpc};
use crate::registry::{Announcer, RegistryError, RegistryReceipt};
use crate::rpc::{self, RpcNode};
use crate::transport::{BindError, Listener, Transport, TransportConfig};

/// Where the node's keypair comes from.
#[derive(Clone)]
pub enum IdentitySource {
    Files { private: PathBuf, public: PathBuf },
    Keypair(Arc<Keypair>),
}

impl fmt::Debug for IdentitySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentitySource::Files { private, public } => f
                .debug_struct("Files")
                .field("private", private)
                .field("public", public)
                .finish(),
            IdentitySource::Keypair(k) => f.debug_tuple("Keypair").field(&k.peer_id()).finish(),
        }
    }
}

/// What a failed self-reachability probe does to startup.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ProbePolicy {
    /// Abort startup.
    #[default]
    Fatal,
    /// Log, keep running, do not announce.
    Degraded,
    /// Do not probe.
    Skip,
}

#[derive(Clone, Debug)]
pub struct NodeOptions {
    pub identity: IdentitySource,
    pub listen: SocketAddr,
    /// Externally reachable IP; probed and announced when set.
    pub public_ip: Option<IpAddr>,
    pub block_store_path: PathBuf,
    pub dht: DhtConfig,
    pub transport: TransportConfig,
    pub probe_policy: ProbePolicy,
    pub probe_timeout: Duration,
    /// `/ip4/../tcp/../p2p/<peer>` addresses dialed by [`Node::bootstrap`].
    pub bootstrap_peers: Vec<Multiaddr>,
}

impl NodeOptions {
    pub fn new(identity: IdentitySource, listen: SocketAddr) -> Self {
        Self {
            identity,
            listen,
            public_ip: None,
            block_store_path: PathBuf::from("./block_store"),
            dht: DhtConfig::default(),
            transport: TransportConfig::default(),
            probe_policy: ProbePolicy::default(),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            bootstrap_peers: Vec::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartupStep {
    LoadIdentity,
    BindTransport,
    AttachRouting,
    MountBlockStore,
    ProbeReachability,
}

impl fmt::Display for StartupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StartupStep::LoadIdentity => "load identity",
            StartupStep::BindTransport => "bind transport",
            StartupStep::AttachRouting => "attach routing table",
            StartupStep::MountBlockStore => "mount block store",
            StartupStep::ProbeReachability => "probe reachability",
        })
    }
}

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("load identity: {0}")]
    Identity(#[from] IdentityError),
    #[error("bind transport: {0}")]
    Bind(#[from] BindError),
    #[error("attach routing table: {0}")]
    Routing(#[from] DhtConfigError),
    #[error("mount block store: {0}")]
    BlockStore(#[source] BlockStoreError),
    #[error("probe reachability: {0}")]
    Probe(#[source] ProbeError),
}

impl StartupError {
    pub fn step(&self) -> StartupStep {
        match self {
            StartupError::Identity(_) => StartupStep::LoadIdentity,
            StartupError::Bind(_) => StartupStep::BindTransport,
            StartupError::Routing(_) => StartupStep::AttachRouting,
            StartupError::BlockStore(_) => StartupStep::MountBlockStore,
            StartupError::Probe(_) => StartupStep::ProbeReachability,
        }
    }
}

pub struct Node {
    keypair: Arc<Keypair>,
    transport: Transport,
    listener: Listener,
    rpc: RpcNode,
    dht: DhtNode<RpcNode>,
    blocks: Arc<BlockStore>,
    server: JoinHandle<()>,
    public_addr: Option<Multiaddr>,
    reachability: Option<ReachabilityResult>,
    bootstrap_peers: Vec<Multiaddr>,
}

impl Node {
    pub async fn start(options: NodeOptions) -> Result<Self, StartupError> {
        let NodeOptions {
            identity,
            listen,
            public_ip,
            block_store_path,
            dht: dht_config,
            transport: transport_config,
            probe_policy,
            probe_timeout,
            bootstrap_peers,
        } = options;

        let keypair = match identity {
            IdentitySource::Files { private, public } => Arc::new(load_from_files(&private, &public)?),
            IdentitySource::Keypair(keypair) => keypair,
        };
        let peer_id = keypair.peer_id();
        info!(peer = %peer_id, "identity loaded");

        let transport = Transport::new(keypair.clone(), transport_config);
        let listener = transport.listen(listen).await?;
        let local_addr = listener.local_addr();

        if let Err(e) = dht_config.validate() {
            transport.close_all().await;
            return Err(e.into());
        }
        let public_addr = public_ip.map(|ip| Multiaddr::from_socket_addr(SocketAddr::new(ip, local_addr.port())));
        let self_info = PeerInfo::new(peer_id, advertised_addrs(public_addr.as_ref(), local_addr));
        let rpc = RpcNode::new(transport.clone(), self_info.clone(), dht_config.address_policy);
        let dht = DhtNode::new(self_info, rpc.clone(), dht_config);
        debug!(peer = %peer_id, "routing table attached");

        let blocks = match BlockStore::open(&block_store_path).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                dht.quit().await;
                transport.close_all().await;
                return Err(StartupError::BlockStore(e));
            }
        };
        let server = match transport.take_incoming().await {
            Some(incoming) => tokio::spawn(rpc::serve(incoming, dht.clone(), blocks.clone())),
            None => tokio::spawn(async {}),
        };

        let reachability = match (probe_policy, public_ip) {
            (ProbePolicy::Skip, _) => None,
            (_, None) => {
                info!("no public IP configured, skipping reachability probe");
                None
            }
            (policy, Some(ip)) => {
                info!(ip = %ip, port = local_addr.port(), "probing self-reachability");
                let ReachabilityResult { target, outcome } =
                    probe::probe(ip, local_addr.port(), probe_timeout).await;
                match outcome {
                    ProbeOutcome::Failed(e) if policy == ProbePolicy::Fatal => {
                        server.abort();
                        dht.quit().await;
                        transport.close_all().await;
                        return Err(StartupError::Probe(e));
                    }
                    ProbeOutcome::Failed(e) => {
                        warn!(addr = %target, error = %e, "node is not reachable from outside, continuing without announcement");
                        Some(ReachabilityResult {
                            target,
                            outcome: ProbeOutcome::Failed(e),
                        })
                    }
                    reachable => Some(ReachabilityResult {
                        target,
                        outcome: reachable,
                    }),
                }
            }
        };

        info!(
            peer = %peer_id,
            listen = %listener.multiaddr(),
            public = ?public_addr.as_ref().map(|a| a.to_string()),
            "node started"
        );

        Ok(Self {
            keypair,
            transport,
            listener,
            rpc,
            dht,
            blocks,
            server,
            public_addr,
            reachability,
            bootstrap_peers,
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.keypair.peer_id()
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.keypair.public_key_bytes()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// The bound address with the `/p2p/<peer>` suffix.
    pub fn listen_multiaddr(&self) -> Multiaddr {
        self.listener.multiaddr()
    }

    /// `/ip4/<public ip>/tcp/<port>` when a public IP is configured.
    pub fn public_multiaddr(&self) -> Option<&Multiaddr> {
        self.public_addr.as_ref()
    }

    pub fn peer_info(&self) -> &PeerInfo {
        self.dht.self_info()
    }

    pub fn reachability(&self) -> Option<&ReachabilityResult> {
        self.reachability.as_ref()
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub async fn routing_table_size(&self) -> usize {
        self.dht.routing_table_size().await
    }

    /// Dial the peer named by `addr` (which must carry `/p2p/<peer>`), exchange
    /// identify information and add it to the routing table.
    pub async fn add_peer(&self, addr: &Multiaddr) -> Result<PeerId> {
        let peer = addr
            .peer_id()
            .with_context(|| format!("{addr} has no /p2p/<peer id> component"))?;
        let info = PeerInfo::single(peer, addr.without_peer());

        self.transport
            .dial(peer, addr)
            .await
            .with_context(|| format!("failed to dial {addr}"))?;

        match self.rpc.identify(&info, self.peer_info().addrs.clone()).await {
            Ok(identify) => debug!(
                peer = ?peer,
                agent = %identify.agent_version,
                observed = %identify.observed_addr,
                "identified peer"
            ),
            Err(e) => debug!(peer = ?peer, error = %e, "identify failed"),
        }

        self.dht.add_peer(info).await?;
        info!(peer = %peer, addr = %addr, "peer added");
        Ok(peer)
    }

    /// Dial the configured bootstrap peers, then look ourselves up to fill the
    /// routing table. Failures are logged. Returns the routing table size.
    pub async fn bootstrap(&self) -> usize {
        let mut connected = 0;
        for addr in &self.bootstrap_peers {
            match self.add_peer(addr).await {
                Ok(_) => connected += 1,
                Err(e) => warn!(addr = %addr, error = %e, "bootstrap peer unavailable"),
            }
        }
        if !self.bootstrap_peers.is_empty() {
            info!(connected, configured = self.bootstrap_peers.len(), "bootstrap peers dialed");
        }

        match self.dht.iterative_find_node(self.peer_id()).await {
            Ok(found) => debug!(found = found.len(), "self-lookup completed"),
            Err(LookupError::EmptyRoutingTable) => debug!("routing table empty, skipping self-lookup"),
            Err(e) => warn!(error = %e, "self-lookup failed"),
        }
        self.routing_table_size().await
    }

    /// Store `data` and announce this node as its provider.
    pub async fn put_block(&self, data: &[u8]) -> Result<Key> {
        let key = self.blocks.put(data).await?;
        match self.dht.announce_provider(key).await {
            Ok(accepted) => debug!(key = %hex::encode(&key[..8]), accepted, "block provided"),
            Err(e) => debug!(key = %hex::encode(&key[..8]), error = %e, "provider announcement kept local"),
        }
        Ok(key)
    }

    pub async fn get_block(&self, key: &Key) -> Result<Vec<u8>, BlockStoreError> {
        self.blocks.get(key).await
    }

    pub async fn has_block(&self, key: &Key) -> bool {
        self.blocks.has(key).await
    }

    /// The block for `key`, from the local store or else from a provider.
    /// Fetched bytes must hash to `key` before they are stored.
    pub async fn fetch_block(&self, key: Key) -> Result<Vec<u8>> {
        match self.blocks.get(&key).await {
            Ok(data) => return Ok(data),
            Err(BlockStoreError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let mut providers = self.dht.find_providers(key).await?;
        while let Some(provider) = providers.next().await {
            if provider.peer_id == self.peer_id() {
                continue;
            }
            let data = match self.rpc.get_block(&provider, key).await {
                Ok(Some(data)) => data,
                Ok(None) => {
                    debug!(peer = ?provider.peer_id, key = %hex::encode(&key[..8]), "provider no longer has block");
                    continue;
                }
                Err(e) => {
                    debug!(peer = ?provider.peer_id, error = %e, "block fetch failed");
                    continue;
                }
            };
            if hash_content(&data) != key {
                warn!(peer = ?provider.peer_id, key = %hex::encode(&key[..8]), "provider sent block with wrong content");
                continue;
            }
            self.blocks.put(&data).await?;
            info!(peer = ?provider.peer_id, key = %hex::encode(&key[..8]), len = data.len(), "block fetched");
            return Ok(data);
        }
        anyhow::bail!("no provider could serve block {}", hex::encode(key))
    }

    pub async fn find_providers(&self, key: Key) -> Result<ProviderStream, LookupError> {
        self.dht.find_providers(key).await
    }

    pub async fn find_closest_peers(&self, key: &Key, count: usize) -> Vec<PeerId> {
        self.dht.find_closest_peers(key, count).await
    }

    /// Report the public address through `announcer`. Returns `Ok(None)` when
    /// there is nothing to announce: no public IP, or the probe failed.
    pub async fn announce(&self, announcer: &Announcer) -> Result<Option<RegistryReceipt>, RegistryError> {
        let Some(addr) = &self.public_addr else {
            info!("no public address configured, skipping registry announcement");
            return Ok(None);
        };
        if let Some(result) = &self.reachability {
            if !result.is_reachable() {
                info!(addr = %addr, "node unreachable, skipping registry announcement");
                return Ok(None);
            }
        }
        announcer.announce(&self.peer_id(), addr).await.map(Some)
    }

    pub async fn shutdown(self) {
        info!(peer = %self.peer_id(), "shutting down");
        self.listener.close();
        self.server.abort();
        self.dht.quit().await;
        self.transport.close_all().await;
    }
}

/// Addresses placed in our own peer-info record.
fn advertised_addrs(public: Option<&Multiaddr>, local: SocketAddr) -> Vec<Multiaddr> {
    let mut addrs = Vec::new();
    if let Some(public) = public {
        addrs.push(public.clone());
    }
    if !local.ip().is_unspecified() {
        let local = Multiaddr::from_socket_addr(local);
        if !addrs.contains(&local) {
            addrs.push(local);
        }
    }
    addrs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_error_names_step() {
        let err = StartupError::from(IdentityError::Mismatch);
        assert_eq!(err.step(), StartupStep::LoadIdentity);
        assert!(err.to_string().starts_with("load identity"));

        let err = StartupError::from(DhtConfigError::InvalidK(0));
        assert_eq!(err.step(), StartupStep::AttachRouting);
        assert_eq!(err.step().to_string(), "attach routing table");
    }

    #[test]
    fn advertised_addrs_skip_unspecified_bind() {
        let public: Multiaddr = "/ip4/203.0.113.9/tcp/4001".parse().unwrap();
        let addrs = advertised_addrs(Some(&public), "0.0.0.0:4001".parse().unwrap());
        assert_eq!(addrs, vec![public.clone()]);

        let addrs = advertised_addrs(Some(&public), "127.0.0.1:4001".parse().unwrap());
        assert_eq!(addrs.len(), 2);
        assert!(advertised_addrs(None, "0.0.0.0:1".parse().unwrap()).is_empty());
    }

    #[tokio::test]
    async fn invalid_dht_parameters_fail_at_attach_routing() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = NodeOptions::new(
            IdentitySource::Keypair(Arc::new(Keypair::generate())),
            "127.0.0.1:0".parse().unwrap(),
        );
        options.block_store_path = dir.path().join("blocks");
        options.dht.alpha = 0;
        let err = Node::start(options).await.err().unwrap();
        assert_eq!(err.step(), StartupStep::AttachRouting);
    }

    #[tokio::test]
    async fn unusable_block_store_fails_at_mount() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        std::fs::write(&file, b"x").unwrap();
        let mut options = NodeOptions::new(
            IdentitySource::Keypair(Arc::new(Keypair::generate())),
            "127.0.0.1:0".parse().unwrap(),
        );
        options.block_store_path = file;
        let err = Node::start(options).await.err().unwrap();
        assert_eq!(err.step(), StartupStep::MountBlockStore);
    }
}
