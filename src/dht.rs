//! # Kademlia DHT
//!
//! [`DhtNode`] is a cheap, cloneable handle to an actor task that exclusively
//! owns the routing table and the provider store. Lookups run on the caller's
//! task and talk to the actor through a command channel, so many lookups can be
//! in flight while every routing-state change is applied in order.
//!
//! ## Iterative Lookup
//!
//! 1. Seed a shortlist with the k closest known peers.
//! 2. Query the α closest unqueried peers in parallel.
//! 3. Merge returned peers, drop peers that failed, keep the k closest.
//! 4. Repeat while a round brings a closer peer; once it does not, query the
//!    rest of the k closest once and stop. Rounds are bounded.
//!
//! The same loop drives provider lookups, where every reply may also carry
//! provider records that are streamed to the caller as they arrive.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use anyhow::anyhow;
use futures::Stream;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::blockstore::Key;
use crate::identity::{PeerId, PeerInfo};
use crate::protocols::DhtNodeRpc;
use crate::providers::{ProviderRejection, ProviderStore, REPUBLISH_INTERVAL};
use crate::routing::{
    compare_by_distance, random_id_for_bucket, AddressPolicy, InsertOutcome, PeerState,
    PendingBucketUpdate, RoutingInsertionLimiter, RoutingTable, BUCKET_REFRESH_INTERVAL,
    BUCKET_STALE_THRESHOLD, PEER_STALE_THRESHOLD,
};

pub const DEFAULT_K: usize = 20;
pub const DEFAULT_ALPHA: usize = 3;
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

const MAX_K: usize = 256;
const MAX_LOOKUP_ITERATIONS: usize = 20;
const COMMAND_QUEUE_DEPTH: usize = 256;
const PROVIDER_STREAM_BUFFER: usize = 32;

/// Upper bound on peer records accepted from one reply.
pub(crate) const MAX_PEERS_PER_RESPONSE: usize = 100;

#[derive(Clone, Debug)]
pub struct DhtConfig {
    pub k: usize,
    pub alpha: usize,
    pub query_timeout: Duration,
    pub address_policy: AddressPolicy,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            address_policy: AddressPolicy::PublicOnly,
        }
    }
}

impl DhtConfig {
    pub fn validate(&self) -> Result<(), DhtConfigError> {
        if self.k == 0 || self.k > MAX_K {
            return Err(DhtConfigError::InvalidK(self.k));
        }
        if self.alpha == 0 || self.alpha > self.k {
            return Err(DhtConfigError::InvalidAlpha {
                alpha: self.alpha,
                k: self.k,
            });
        }
        if self.query_timeout.is_zero() {
            return Err(DhtConfigError::ZeroQueryTimeout);
        }
        Ok(())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DhtConfigError {
    #[error("k must be between 1 and 256, got {0}")]
    InvalidK(usize),
    #[error("alpha must be between 1 and k ({k}), got {alpha}")]
    InvalidAlpha { alpha: usize, k: usize },
    #[error("query timeout must be non-zero")]
    ZeroQueryTimeout,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LookupError {
    #[error("routing table is empty")]
    EmptyRoutingTable,
    #[error("no queried peer responded")]
    NoResponsivePeers,
    #[error("DHT node has shut down")]
    Shutdown,
}

/// Provider records discovered by a running lookup.
///
/// Local records come first. The stream ends when the lookup finishes;
/// dropping it cancels the lookup.
pub struct ProviderStream {
    rx: mpsc::Receiver<PeerInfo>,
    task: AbortHandle,
}

impl Stream for ProviderStream {
    type Item = PeerInfo;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for ProviderStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct DhtNode<N: DhtNodeRpc> {
    cmd_tx: mpsc::Sender<Command>,
    id: PeerId,
    self_info: PeerInfo,
    network: Arc<N>,
    config: DhtConfig,
    background: Arc<Mutex<Vec<AbortHandle>>>,
}

impl<N: DhtNodeRpc> Clone for DhtNode<N> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            id: self.id,
            self_info: self.self_info.clone(),
            network: self.network.clone(),
            config: self.config.clone(),
            background: self.background.clone(),
        }
    }
}

struct DhtNodeActor<N: DhtNodeRpc> {
    routing: RoutingTable,
    providers: ProviderStore,
    routing_limiter: RoutingInsertionLimiter,
    policy: AddressPolicy,
    query_timeout: Duration,
    cmd_rx: mpsc::Receiver<Command>,
    cmd_tx: mpsc::Sender<Command>,
    network: Arc<N>,
    id: PeerId,
}

enum Command {
    // State updates
    Observe(PeerInfo, PeerState),
    ObserveFromPeer(PeerInfo, PeerId, oneshot::Sender<bool>),
    MarkFailed(PeerId),
    AddLocalProvider(Key, PeerInfo),

    // Queries
    Closest([u8; 32], usize, oneshot::Sender<Vec<PeerInfo>>),
    LocalProviders(Key, oneshot::Sender<Vec<PeerInfo>>),
    ProvidedKeys(oneshot::Sender<Vec<Key>>),
    PeerState(PeerId, oneshot::Sender<Option<PeerState>>),
    RoutingSize(oneshot::Sender<usize>),

    // RPC handlers
    HandlePing(PeerInfo),
    HandleFindNode(PeerInfo, PeerId, oneshot::Sender<Vec<PeerInfo>>),
    HandleGetProviders(PeerInfo, Key, oneshot::Sender<(Vec<PeerInfo>, Vec<PeerInfo>)>),
    HandleAddProvider(PeerInfo, Key, oneshot::Sender<Result<(), ProviderRejection>>),

    // Maintenance
    ExpireState,
    GetStaleBuckets(Duration, oneshot::Sender<Vec<usize>>),
    MarkBucketRefreshed(usize),
    ApplyPingResult(PendingBucketUpdate, bool),

    Quit,
}

impl<N: DhtNodeRpc + 'static> DhtNode<N> {
    /// Spawn the actor and its maintenance tasks. `config` must already be valid.
    pub fn new(self_info: PeerInfo, network: N, config: DhtConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let network = Arc::new(network);
        let id = self_info.peer_id;

        let actor = DhtNodeActor {
            routing: RoutingTable::new(id, config.k),
            providers: ProviderStore::new(id),
            routing_limiter: RoutingInsertionLimiter::new(),
            policy: config.address_policy,
            query_timeout: config.query_timeout,
            cmd_rx,
            cmd_tx: cmd_tx.clone(),
            network: network.clone(),
            id,
        };
        tokio::spawn(actor.run());

        let node = Self {
            cmd_tx,
            id,
            self_info,
            network,
            config,
            background: Arc::new(Mutex::new(Vec::new())),
        };
        node.spawn_periodic_bucket_refresh();
        node.spawn_periodic_republish();
        node
    }

    pub fn peer_id(&self) -> PeerId {
        self.id
    }

    pub fn self_info(&self) -> &PeerInfo {
        &self.self_info
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, LookupError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| LookupError::Shutdown)?;
        rx.await.map_err(|_| LookupError::Shutdown)
    }

    /// Record a peer we exchanged messages with.
    pub async fn observe_peer(&self, info: PeerInfo, state: PeerState) {
        let _ = self.cmd_tx.send(Command::Observe(info, state)).await;
    }

    async fn observe_peer_from(&self, info: PeerInfo, source: PeerId) -> bool {
        self.request(|tx| Command::ObserveFromPeer(info, source, tx))
            .await
            .unwrap_or(false)
    }

    async fn mark_failed(&self, id: PeerId) {
        let _ = self.cmd_tx.send(Command::MarkFailed(id)).await;
    }

    pub async fn peer_state(&self, id: &PeerId) -> Option<PeerState> {
        self.request(|tx| Command::PeerState(*id, tx)).await.ok().flatten()
    }

    pub async fn routing_table_size(&self) -> usize {
        self.request(Command::RoutingSize).await.unwrap_or(0)
    }

    /// Ping `info` and, if it answers, add it to the routing table as responsive.
    pub async fn add_peer(&self, info: PeerInfo) -> anyhow::Result<()> {
        if info.peer_id == self.id {
            anyhow::bail!("refusing to add self to routing table");
        }
        self.observe_peer(info.clone(), PeerState::Contacted).await;
        let result = tokio::time::timeout(self.config.query_timeout, self.network.ping(&info))
            .await
            .map_err(|_| anyhow!("ping to {} timed out", info.peer_id))
            .and_then(|r| r);
        match result {
            Ok(()) => {
                self.observe_peer(info, PeerState::Responsive).await;
                Ok(())
            }
            Err(e) => {
                self.mark_failed(info.peer_id).await;
                Err(e)
            }
        }
    }

    /// Closest known peers to `key` from the local routing table.
    pub async fn find_closest_peers(&self, key: &[u8; 32], count: usize) -> Vec<PeerId> {
        self.request(|tx| Command::Closest(*key, count, tx))
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|info| info.peer_id)
            .collect()
    }

    pub async fn iterative_find_node(&self, target: PeerId) -> Result<Vec<PeerInfo>, LookupError> {
        self.lookup(*target.as_bytes(), None).await
    }

    /// Publish this node as a provider of `key` at the k closest responsive peers.
    ///
    /// The local record is stored first. Returns how many remote peers accepted
    /// the record.
    pub async fn announce_provider(&self, key: Key) -> Result<usize, LookupError> {
        self.cmd_tx
            .send(Command::AddLocalProvider(key, self.self_info.clone()))
            .await
            .map_err(|_| LookupError::Shutdown)?;

        let closest = self.lookup(key, None).await?;
        let timeout = self.config.query_timeout;
        let stores = closest.into_iter().take(self.config.k).map(|peer| {
            let network = self.network.clone();
            async move {
                let result = tokio::time::timeout(timeout, network.add_provider(&peer, key)).await;
                (peer, result)
            }
        });

        let mut accepted = 0;
        for (peer, result) in futures::future::join_all(stores).await {
            match result {
                Ok(Ok(())) => accepted += 1,
                Ok(Err(e)) => {
                    debug!(peer = ?peer.peer_id, key = %hex::encode(&key[..8]), error = %e, "add_provider rejected");
                }
                Err(_) => {
                    debug!(peer = ?peer.peer_id, key = %hex::encode(&key[..8]), "add_provider timed out");
                    self.mark_failed(peer.peer_id).await;
                }
            }
        }

        debug!(key = %hex::encode(&key[..8]), accepted, "provider record announced");
        Ok(accepted)
    }

    /// Stream provider records for `key` as a fresh lookup discovers them.
    pub async fn find_providers(&self, key: Key) -> Result<ProviderStream, LookupError> {
        let local = self.request(|tx| Command::LocalProviders(key, tx)).await?;
        let known = self.request(Command::RoutingSize).await?;
        if known == 0 && local.is_empty() {
            return Err(LookupError::EmptyRoutingTable);
        }

        let (tx, rx) = mpsc::channel(PROVIDER_STREAM_BUFFER);
        let node = self.clone();
        let task = tokio::spawn(async move {
            let mut seen = HashSet::new();
            for provider in local {
                if seen.insert(provider.peer_id) && tx.send(provider).await.is_err() {
                    return;
                }
            }
            if known == 0 {
                return;
            }
            if let Err(e) = node.lookup(key, Some((&tx, &mut seen))).await {
                debug!(key = %hex::encode(&key[..8]), error = %e, "provider lookup ended early");
            }
        });

        Ok(ProviderStream {
            rx,
            task: task.abort_handle(),
        })
    }

    async fn lookup(
        &self,
        target: [u8; 32],
        mut providers: Option<(&mpsc::Sender<PeerInfo>, &mut HashSet<PeerId>)>,
    ) -> Result<Vec<PeerInfo>, LookupError> {
        let k = self.config.k;
        let alpha = self.config.alpha;
        let want_providers = providers.is_some();

        let mut shortlist = self.request(|tx| Command::Closest(target, k, tx)).await?;
        if shortlist.is_empty() {
            return Err(LookupError::EmptyRoutingTable);
        }

        let mut seen: HashSet<PeerId> = shortlist.iter().map(|p| p.peer_id).collect();
        seen.insert(self.id);
        let mut queried: HashSet<PeerId> = HashSet::new();
        let mut failed: HashSet<PeerId> = HashSet::new();
        let mut responded: HashSet<PeerId> = HashSet::new();

        let distance = |p: &PeerInfo| p.peer_id.xor_distance(&PeerId::from_bytes(target));
        let mut best = shortlist.first().map(distance);
        let mut final_sweep = false;

        for _ in 0..MAX_LOOKUP_ITERATIONS {
            let width = if final_sweep { k } else { alpha };
            let candidates: Vec<PeerInfo> = shortlist
                .iter()
                .filter(|p| !queried.contains(&p.peer_id))
                .take(width)
                .cloned()
                .collect();
            if candidates.is_empty() {
                break;
            }

            for peer in &candidates {
                queried.insert(peer.peer_id);
                self.observe_peer(peer.clone(), PeerState::Contacted).await;
            }

            let queries = candidates.into_iter().map(|peer| {
                query_peer(
                    self.network.clone(),
                    peer,
                    target,
                    want_providers,
                    self.config.query_timeout,
                )
            });

            for (peer, result) in futures::future::join_all(queries).await {
                let (found_providers, closer) = match result {
                    Ok(reply) => reply,
                    Err(e) => {
                        trace!(peer = ?peer.peer_id, error = %e, "lookup query failed");
                        failed.insert(peer.peer_id);
                        self.mark_failed(peer.peer_id).await;
                        continue;
                    }
                };

                responded.insert(peer.peer_id);
                let source = peer.peer_id;
                self.observe_peer(peer, PeerState::Responsive).await;

                if let Some((tx, seen_providers)) = providers.as_mut() {
                    for provider in found_providers.into_iter().take(MAX_PEERS_PER_RESPONSE) {
                        if !provider.validate_structure() || !seen_providers.insert(provider.peer_id) {
                            continue;
                        }
                        if tx.send(provider).await.is_err() {
                            trace!("provider stream dropped, cancelling lookup");
                            return Ok(Vec::new());
                        }
                    }
                }

                for candidate in closer.into_iter().take(MAX_PEERS_PER_RESPONSE) {
                    if !candidate.validate_structure() || candidate.addrs.is_empty() {
                        continue;
                    }
                    if !seen.insert(candidate.peer_id) {
                        continue;
                    }
                    if self.observe_peer_from(candidate.clone(), source).await {
                        shortlist.push(candidate);
                    }
                }
            }

            shortlist.retain(|p| !failed.contains(&p.peer_id));
            shortlist.sort_by(|a, b| compare_by_distance(&target, &a.peer_id, &b.peer_id));
            shortlist.truncate(k);

            if final_sweep {
                break;
            }
            let new_best = shortlist.first().map(distance);
            let closer = match (new_best, best) {
                (Some(new), Some(old)) => new < old,
                (Some(_), None) => true,
                (None, _) => false,
            };
            if closer {
                best = new_best;
            } else {
                final_sweep = true;
            }
        }

        debug!(
            target = %hex::encode(&target[..8]),
            queried = queried.len(),
            responded = responded.len(),
            failed = failed.len(),
            "iterative lookup completed"
        );

        if responded.is_empty() {
            return Err(LookupError::NoResponsivePeers);
        }
        Ok(shortlist
            .into_iter()
            .filter(|p| responded.contains(&p.peer_id))
            .collect())
    }

    // Inbound request handlers, called by the RPC server once the sender is authenticated.

    pub async fn handle_ping(&self, from: &PeerInfo) {
        let _ = self.cmd_tx.send(Command::HandlePing(from.clone())).await;
    }

    pub async fn handle_find_node_request(&self, from: &PeerInfo, target: PeerId) -> Vec<PeerInfo> {
        self.request(|tx| Command::HandleFindNode(from.clone(), target, tx))
            .await
            .unwrap_or_default()
    }

    pub async fn handle_get_providers_request(
        &self,
        from: &PeerInfo,
        key: Key,
    ) -> (Vec<PeerInfo>, Vec<PeerInfo>) {
        self.request(|tx| Command::HandleGetProviders(from.clone(), key, tx))
            .await
            .unwrap_or_default()
    }

    /// Store `from` as a provider of `key`. The caller has checked that the
    /// provider record names the authenticated sender.
    pub async fn handle_add_provider_request(
        &self,
        from: &PeerInfo,
        key: Key,
    ) -> Result<(), ProviderRejection> {
        self.request(|tx| Command::HandleAddProvider(from.clone(), key, tx))
            .await
            .unwrap_or(Err(ProviderRejection::RateLimited))
    }

    fn register_background(&self, handle: AbortHandle) {
        if let Ok(mut tasks) = self.background.lock() {
            tasks.push(handle);
        }
    }

    fn spawn_periodic_bucket_refresh(&self) {
        let node = self.clone();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(BUCKET_REFRESH_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;

                if node.cmd_tx.send(Command::ExpireState).await.is_err() {
                    break;
                }
                let stale_buckets = match node
                    .request(|tx| Command::GetStaleBuckets(BUCKET_STALE_THRESHOLD, tx))
                    .await
                {
                    Ok(buckets) => buckets,
                    Err(_) => break,
                };
                if stale_buckets.is_empty() {
                    continue;
                }

                debug!(count = stale_buckets.len(), "refreshing stale routing buckets");
                for bucket_idx in stale_buckets {
                    let target = random_id_for_bucket(&node.id, bucket_idx);
                    if let Err(e) = node.iterative_find_node(target).await {
                        debug!(bucket = bucket_idx, error = %e, "bucket refresh lookup failed");
                    }
                    let _ = node.cmd_tx.send(Command::MarkBucketRefreshed(bucket_idx)).await;
                }
            }
        });
        self.register_background(task.abort_handle());
    }

    fn spawn_periodic_republish(&self) {
        let node = self.clone();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(REPUBLISH_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let keys = match node.request(Command::ProvidedKeys).await {
                    Ok(keys) => keys,
                    Err(_) => break,
                };
                if keys.is_empty() {
                    continue;
                }
                info!(count = keys.len(), "republishing provider records");
                for key in keys {
                    if let Err(e) = node.announce_provider(key).await {
                        warn!(key = %hex::encode(&key[..8]), error = %e, "provider republish failed");
                    }
                }
            }
        });
        self.register_background(task.abort_handle());
    }

    /// Stop the actor and its maintenance tasks.
    pub async fn quit(&self) {
        if let Ok(mut tasks) = self.background.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

async fn query_peer<N: DhtNodeRpc>(
    network: Arc<N>,
    peer: PeerInfo,
    target: [u8; 32],
    want_providers: bool,
    timeout: Duration,
) -> (PeerInfo, anyhow::Result<(Vec<PeerInfo>, Vec<PeerInfo>)>) {
    let query = async {
        if want_providers {
            network.get_providers(&peer, target).await
        } else {
            network
                .find_node(&peer, PeerId::from_bytes(target))
                .await
                .map(|nodes| (Vec::new(), nodes))
        }
    };
    let result = match tokio::time::timeout(timeout, query).await {
        Ok(result) => result,
        Err(_) => Err(anyhow!("query timed out after {timeout:?}")),
    };
    (peer, result)
}

impl<N: DhtNodeRpc> DhtNodeActor<N> {
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::Observe(info, state) => self.observe(info, state),
                Command::ObserveFromPeer(info, source, reply) => {
                    let allowed = self.observe_from_peer(info, &source);
                    let _ = reply.send(allowed);
                }
                Command::MarkFailed(id) => self.routing.mark_failed(&id),
                Command::AddLocalProvider(key, self_info) => {
                    self.providers.add_local(key, self_info);
                }
                Command::Closest(target, count, reply) => {
                    let _ = reply.send(self.routing.closest(&target, count));
                }
                Command::LocalProviders(key, reply) => {
                    let _ = reply.send(self.providers.get(&key));
                }
                Command::ProvidedKeys(reply) => {
                    let _ = reply.send(self.providers.provided_keys());
                }
                Command::PeerState(id, reply) => {
                    let _ = reply.send(self.routing.state(&id));
                }
                Command::RoutingSize(reply) => {
                    let _ = reply.send(self.routing.len());
                }
                Command::HandlePing(from) => self.observe(from, PeerState::Responsive),
                Command::HandleFindNode(from, target, reply) => {
                    let requester = from.peer_id;
                    self.observe(from, PeerState::Responsive);
                    let closest = self.routing.closest(target.as_bytes(), self.routing.k() + 1);
                    let _ = reply.send(self.outbound_peers(closest, Some(&requester)));
                }
                Command::HandleGetProviders(from, key, reply) => {
                    let requester = from.peer_id;
                    self.observe(from, PeerState::Responsive);
                    let providers = self.providers.get(&key);
                    let providers = self.outbound_peers(providers, None);
                    let closer = self.routing.closest(&key, self.routing.k() + 1);
                    let closer = self.outbound_peers(closer, Some(&requester));
                    let _ = reply.send((providers, closer));
                }
                Command::HandleAddProvider(from, key, reply) => {
                    self.observe(from.clone(), PeerState::Responsive);
                    let result = self.providers.add_remote(key, from);
                    let _ = reply.send(result);
                }
                Command::ExpireState => {
                    let demoted = self.routing.refresh_states(PEER_STALE_THRESHOLD);
                    let purged = self.providers.purge_expired();
                    if demoted > 0 || purged > 0 {
                        debug!(demoted, purged, "expired routing and provider state");
                    }
                }
                Command::GetStaleBuckets(threshold, reply) => {
                    let _ = reply.send(self.routing.stale_bucket_indices(threshold));
                }
                Command::MarkBucketRefreshed(idx) => self.routing.mark_bucket_refreshed(idx),
                Command::ApplyPingResult(pending, alive) => {
                    self.routing.apply_ping_result(pending, alive);
                }
                Command::Quit => break,
            }
        }
        debug!(peer = ?self.id, "DHT actor stopped");
    }

    /// Peer records as they may leave this node: filtered by address policy,
    /// without the requester, without records left with no address.
    fn outbound_peers(&self, peers: Vec<PeerInfo>, requester: Option<&PeerId>) -> Vec<PeerInfo> {
        peers
            .iter()
            .filter(|p| Some(&p.peer_id) != requester)
            .map(|p| self.policy.apply(p))
            .filter(|p| !p.addrs.is_empty())
            .take(self.routing.k())
            .collect()
    }

    fn observe(&mut self, info: PeerInfo, state: PeerState) {
        if info.peer_id == self.id || !info.validate_structure() {
            return;
        }
        let outcome = match state {
            PeerState::Contacted => self.routing.mark_contacted(info),
            PeerState::Responsive => self.routing.mark_responsive(info),
            PeerState::Stale => self.routing.insert(info, state),
        };
        match outcome {
            InsertOutcome::Pending(update) => {
                let network = self.network.clone();
                let tx = self.cmd_tx.clone();
                let timeout = self.query_timeout;
                tokio::spawn(async move {
                    let alive = matches!(
                        tokio::time::timeout(timeout, network.ping(&update.oldest)).await,
                        Ok(Ok(()))
                    );
                    if !alive {
                        debug!(peer = ?update.oldest.peer_id, "least recently seen peer failed ping");
                    }
                    let _ = tx.send(Command::ApplyPingResult(update, alive)).await;
                });
            }
            InsertOutcome::Replaced { evicted } => {
                trace!(peer = ?evicted, "evicted stale peer");
            }
            InsertOutcome::Inserted | InsertOutcome::Updated | InsertOutcome::Ignored => {}
        }
    }

    fn observe_from_peer(&mut self, info: PeerInfo, source: &PeerId) -> bool {
        if info.peer_id == *source {
            self.observe(info, PeerState::Contacted);
            return true;
        }
        if self.routing.entry(&info.peer_id).is_none() && !self.routing_limiter.allow_insertion(source) {
            return false;
        }
        self.observe(info, PeerState::Contacted);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multiaddr::Multiaddr;
    use anyhow::anyhow;
    use futures::StreamExt;
    use std::collections::{HashMap, HashSet};
    use tokio::sync::{Mutex, RwLock};

    #[derive(Clone)]
    struct TestNetwork {
        registry: Arc<NetworkRegistry>,
        self_info: PeerInfo,
        failures: Arc<Mutex<HashSet<PeerId>>>,
        pings: Arc<Mutex<Vec<PeerId>>>,
    }

    impl TestNetwork {
        fn new(registry: Arc<NetworkRegistry>, self_info: PeerInfo) -> Self {
            Self {
                registry,
                self_info,
                failures: Arc::new(Mutex::new(HashSet::new())),
                pings: Arc::new(Mutex::new(Vec::new())),
            }
        }

        async fn set_failure(&self, node: PeerId, fail: bool) {
            let mut failures = self.failures.lock().await;
            if fail {
                failures.insert(node);
            } else {
                failures.remove(&node);
            }
        }

        async fn ping_calls(&self) -> Vec<PeerId> {
            self.pings.lock().await.clone()
        }

        async fn check(&self, to: &PeerId) -> anyhow::Result<DhtNode<TestNetwork>> {
            if self.failures.lock().await.contains(to) {
                return Err(anyhow!("injected network failure"));
            }
            self.registry
                .get(to)
                .await
                .ok_or_else(|| anyhow!("peer not reachable"))
        }
    }

    #[derive(Default)]
    struct NetworkRegistry {
        peers: RwLock<HashMap<PeerId, DhtNode<TestNetwork>>>,
    }

    impl NetworkRegistry {
        async fn register(&self, node: &DhtNode<TestNetwork>) {
            self.peers.write().await.insert(node.peer_id(), node.clone());
        }

        async fn get(&self, id: &PeerId) -> Option<DhtNode<TestNetwork>> {
            self.peers.read().await.get(id).cloned()
        }
    }

    #[async_trait::async_trait]
    impl DhtNodeRpc for TestNetwork {
        async fn find_node(&self, to: &PeerInfo, target: PeerId) -> anyhow::Result<Vec<PeerInfo>> {
            let peer = self.check(&to.peer_id).await?;
            Ok(peer.handle_find_node_request(&self.self_info, target).await)
        }

        async fn get_providers(
            &self,
            to: &PeerInfo,
            key: Key,
        ) -> anyhow::Result<(Vec<PeerInfo>, Vec<PeerInfo>)> {
            let peer = self.check(&to.peer_id).await?;
            Ok(peer.handle_get_providers_request(&self.self_info, key).await)
        }

        async fn add_provider(&self, to: &PeerInfo, key: Key) -> anyhow::Result<()> {
            let peer = self.check(&to.peer_id).await?;
            peer.handle_add_provider_request(&self.self_info, key)
                .await
                .map_err(|e| anyhow!("{e}"))
        }

        async fn ping(&self, to: &PeerInfo) -> anyhow::Result<()> {
            self.pings.lock().await.push(to.peer_id);
            let peer = self.check(&to.peer_id).await?;
            peer.handle_ping(&self.self_info).await;
            Ok(())
        }
    }

    struct TestNode {
        node: DhtNode<TestNetwork>,
        network: TestNetwork,
    }

    impl TestNode {
        async fn new(registry: Arc<NetworkRegistry>, index: u32, config: DhtConfig) -> Self {
            let info = make_info(index);
            let network = TestNetwork::new(registry.clone(), info.clone());
            let node = DhtNode::new(info, network.clone(), config);
            registry.register(&node).await;
            Self { node, network }
        }

        async fn with_defaults(registry: Arc<NetworkRegistry>, index: u32) -> Self {
            Self::new(registry, index, DhtConfig::default()).await
        }

        fn info(&self) -> PeerInfo {
            self.node.self_info().clone()
        }

        fn id(&self) -> PeerId {
            self.node.peer_id()
        }
    }

    fn make_identity(index: u32) -> PeerId {
        let mut id = [0u8; 32];
        id[..4].copy_from_slice(&index.to_be_bytes());
        PeerId::from_bytes(id)
    }

    fn make_info(index: u32) -> PeerInfo {
        let addr: Multiaddr = format!("/ip4/8.8.{}.{}/tcp/4001", (index >> 8) & 0xFF, index & 0xFF)
            .parse()
            .unwrap();
        PeerInfo::single(make_identity(index), addr)
    }

    async fn link(a: &TestNode, b: &TestNode) {
        a.node.observe_peer(b.info(), PeerState::Responsive).await;
        b.node.observe_peer(a.info(), PeerState::Responsive).await;
    }

    #[test]
    fn config_validation() {
        assert!(DhtConfig::default().validate().is_ok());
        let bad_k = DhtConfig {
            k: 0,
            ..DhtConfig::default()
        };
        assert_eq!(bad_k.validate(), Err(DhtConfigError::InvalidK(0)));
        let bad_alpha = DhtConfig {
            alpha: 30,
            ..DhtConfig::default()
        };
        assert!(matches!(bad_alpha.validate(), Err(DhtConfigError::InvalidAlpha { .. })));
    }

    #[tokio::test]
    async fn iterative_find_node_returns_expected_peers() {
        let registry = Arc::new(NetworkRegistry::default());
        let main = TestNode::with_defaults(registry.clone(), 0x10).await;
        let peer_one = TestNode::with_defaults(registry.clone(), 0x11).await;
        let peer_two = TestNode::with_defaults(registry.clone(), 0x12).await;

        link(&main, &peer_one).await;
        link(&peer_one, &peer_two).await;

        let results = main
            .node
            .iterative_find_node(peer_two.id())
            .await
            .expect("lookup succeeds");

        assert_eq!(results.first().map(|p| p.peer_id), Some(peer_two.id()));
        assert!(results.iter().any(|p| p.peer_id == peer_one.id()));
        assert_eq!(main.node.peer_state(&peer_two.id()).await, Some(PeerState::Responsive));
    }

    #[tokio::test]
    async fn lookup_on_empty_table_fails() {
        let registry = Arc::new(NetworkRegistry::default());
        let lonely = TestNode::with_defaults(registry, 0x01).await;
        assert_eq!(
            lonely.node.iterative_find_node(make_identity(0x99)).await.unwrap_err(),
            LookupError::EmptyRoutingTable
        );
        assert!(matches!(
            lonely.node.find_providers([1; 32]).await,
            Err(LookupError::EmptyRoutingTable)
        ));
    }

    #[tokio::test]
    async fn unresponsive_peers_become_stale() {
        let registry = Arc::new(NetworkRegistry::default());
        let main = TestNode::with_defaults(registry.clone(), 0x20).await;
        let peer = TestNode::with_defaults(registry.clone(), 0x21).await;
        link(&main, &peer).await;

        main.network.set_failure(peer.id(), true).await;
        assert_eq!(
            main.node.announce_provider([7; 32]).await.unwrap_err(),
            LookupError::NoResponsivePeers
        );
        assert_eq!(main.node.peer_state(&peer.id()).await, Some(PeerState::Stale));

        main.network.set_failure(peer.id(), false).await;
        assert_eq!(main.node.announce_provider([7; 32]).await.unwrap(), 1);
        assert_eq!(main.node.peer_state(&peer.id()).await, Some(PeerState::Responsive));
    }

    #[tokio::test]
    async fn find_providers_yields_announcing_peer() {
        let registry = Arc::new(NetworkRegistry::default());
        let a = TestNode::with_defaults(registry.clone(), 0x30).await;
        let b = TestNode::with_defaults(registry.clone(), 0x31).await;
        link(&a, &b).await;

        let key = crate::blockstore::hash_content(b"hello");
        assert_eq!(a.node.announce_provider(key).await.unwrap(), 1);

        let providers: Vec<PeerInfo> = b.node.find_providers(key).await.unwrap().collect().await;
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].peer_id, a.id());
        assert_eq!(providers[0].addrs, a.info().addrs);
    }

    #[tokio::test]
    async fn local_provider_record_comes_first_and_is_deduplicated() {
        let registry = Arc::new(NetworkRegistry::default());
        let a = TestNode::with_defaults(registry.clone(), 0x40).await;
        let b = TestNode::with_defaults(registry.clone(), 0x41).await;
        let c = TestNode::with_defaults(registry.clone(), 0x42).await;
        link(&a, &b).await;
        link(&a, &c).await;
        link(&b, &c).await;

        let key = [0x42; 32];
        b.node.announce_provider(key).await.unwrap();
        a.node.announce_provider(key).await.unwrap();

        let providers: Vec<PeerId> = a
            .node
            .find_providers(key)
            .await
            .unwrap()
            .map(|p| p.peer_id)
            .collect()
            .await;
        assert_eq!(providers[0], a.id());
        assert!(providers.contains(&b.id()));
        let unique: HashSet<_> = providers.iter().collect();
        assert_eq!(unique.len(), providers.len());
    }

    #[tokio::test]
    async fn responses_filter_private_addresses() {
        let registry = Arc::new(NetworkRegistry::default());
        let server = TestNode::with_defaults(registry.clone(), 0x50).await;

        let private = PeerInfo::new(
            make_identity(0x51),
            vec![
                "/ip4/10.0.0.5/tcp/4001".parse().unwrap(),
                "/ip4/9.9.9.9/tcp/4001".parse().unwrap(),
            ],
        );
        let loopback_only = PeerInfo::single(make_identity(0x52), "/ip4/127.0.0.1/tcp/4001".parse().unwrap());
        server.node.observe_peer(private, PeerState::Responsive).await;
        server.node.observe_peer(loopback_only, PeerState::Responsive).await;

        let requester = make_info(0x53);
        let reply = server
            .node
            .handle_find_node_request(&requester, make_identity(0x51))
            .await;
        assert_eq!(reply.len(), 1, "loopback-only record dropped, requester excluded");
        assert_eq!(reply[0].addrs.len(), 1);
        assert_eq!(reply[0].addrs[0].to_string(), "/ip4/9.9.9.9/tcp/4001");
    }

    #[tokio::test]
    async fn allow_private_policy_keeps_local_addresses() {
        let registry = Arc::new(NetworkRegistry::default());
        let config = DhtConfig {
            address_policy: AddressPolicy::AllowPrivate,
            ..DhtConfig::default()
        };
        let server = TestNode::new(registry, 0x60, config).await;
        let local = PeerInfo::single(make_identity(0x61), "/ip4/127.0.0.1/tcp/4001".parse().unwrap());
        server.node.observe_peer(local, PeerState::Responsive).await;

        let reply = server
            .node
            .handle_find_node_request(&make_info(0x62), make_identity(0x61))
            .await;
        assert_eq!(reply.len(), 1);
        assert_eq!(reply[0].addrs[0].to_string(), "/ip4/127.0.0.1/tcp/4001");
    }

    #[tokio::test]
    async fn find_closest_peers_is_ordered_and_bounded() {
        let registry = Arc::new(NetworkRegistry::default());
        let main = TestNode::with_defaults(registry, 0x01).await;
        for index in [0x0100, 0x0200, 0x0300, 0x0400, 0x0500] {
            main.node.observe_peer(make_info(index), PeerState::Responsive).await;
        }

        let key = *make_identity(0x0280).as_bytes();
        let closest = main.node.find_closest_peers(&key, 3).await;
        assert_eq!(closest.len(), 3);
        for pair in closest.windows(2) {
            assert_eq!(
                compare_by_distance(&key, &pair[0], &pair[1]),
                std::cmp::Ordering::Less
            );
        }
        assert_eq!(closest[0], make_identity(0x0200));
    }

    #[tokio::test]
    async fn full_bucket_pings_oldest_and_replaces_dead_peer() {
        let registry = Arc::new(NetworkRegistry::default());
        let config = DhtConfig {
            k: 1,
            alpha: 1,
            ..DhtConfig::default()
        };
        let main = TestNode::new(registry.clone(), 0x10, config).await;
        let old = TestNode::with_defaults(registry.clone(), 0x20).await;
        let newcomer = make_info(0x30);

        main.node.observe_peer(old.info(), PeerState::Responsive).await;
        main.network.set_failure(old.id(), true).await;
        main.node.observe_peer(newcomer.clone(), PeerState::Responsive).await;

        let mut replaced = false;
        for _ in 0..50 {
            if main.node.peer_state(&newcomer.peer_id).await.is_some() {
                replaced = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(replaced, "newcomer should take the dead peer's slot");
        assert!(main.network.ping_calls().await.contains(&old.id()));
        assert_eq!(main.node.peer_state(&old.id()).await, None);
    }

    #[tokio::test]
    async fn add_peer_pings_before_insert() {
        let registry = Arc::new(NetworkRegistry::default());
        let main = TestNode::with_defaults(registry.clone(), 0x70).await;
        let peer = TestNode::with_defaults(registry.clone(), 0x71).await;

        main.node.add_peer(peer.info()).await.unwrap();
        assert_eq!(main.node.peer_state(&peer.id()).await, Some(PeerState::Responsive));
        // The pinged peer learned about us from the request.
        assert_eq!(peer.node.peer_state(&main.id()).await, Some(PeerState::Responsive));

        let ghost = make_info(0x72);
        assert!(main.node.add_peer(ghost.clone()).await.is_err());
        assert_eq!(main.node.peer_state(&ghost.peer_id).await, Some(PeerState::Stale));
    }

    #[tokio::test]
    async fn quit_stops_actor() {
        let registry = Arc::new(NetworkRegistry::default());
        let main = TestNode::with_defaults(registry, 0x80).await;
        main.node.quit().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            main.node.iterative_find_node(make_identity(1)).await.unwrap_err(),
            LookupError::Shutdown
        );
    }
}
