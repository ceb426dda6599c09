//! Provider records: which peers can serve which content keys.
//!
//! Records expire after [`PROVIDER_TTL`]; the providing node republishes its
//! own keys every [`REPUBLISH_INTERVAL`]. Each key holds at most
//! [`MAX_PROVIDERS_PER_KEY`] providers. Remote peers are subject to an entry
//! quota and a store rate limit.

use std::collections::HashSet;
use std::num::NonZeroUsize;

use lru::LruCache;
use tokio::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::blockstore::Key;
use crate::identity::{PeerId, PeerInfo};
use crate::ratelimit::TokenBucket;

pub const PROVIDER_TTL: Duration = Duration::from_secs(24 * 60 * 60);

pub const REPUBLISH_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

pub const MAX_PROVIDERS_PER_KEY: usize = 20;

const MAX_PROVIDER_KEYS: usize = 100_000;

/// Provider records a single remote peer may hold in this store.
const PER_PEER_ENTRY_LIMIT: usize = 1_000;

/// AddProvider requests per peer per minute.
const PER_PEER_RATE_LIMIT: u32 = 60;

const MAX_TRACKED_PEERS: usize = 10_000;

#[derive(Clone, Debug)]
pub struct ProviderRecord {
    pub provider: PeerInfo,
    pub expires_at: Instant,
}

/// Reason an AddProvider was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderRejection {
    /// The key already has the maximum number of providers.
    KeyFull,
    /// The peer holds too many records here.
    QuotaExceeded,
    /// The peer is publishing too quickly.
    RateLimited,
}

impl std::fmt::Display for ProviderRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderRejection::KeyFull => f.write_str("provider set for key is full"),
            ProviderRejection::QuotaExceeded => f.write_str("provider quota exceeded"),
            ProviderRejection::RateLimited => f.write_str("provider publish rate limited"),
        }
    }
}

struct PeerStats {
    entries: usize,
    rate: TokenBucket,
}

impl PeerStats {
    fn new() -> Self {
        Self {
            entries: 0,
            rate: TokenBucket::new(PER_PEER_RATE_LIMIT, PER_PEER_RATE_LIMIT as f64 / 60.0),
        }
    }
}

pub(crate) struct ProviderStore {
    records: LruCache<Key, Vec<ProviderRecord>>,
    peer_stats: LruCache<PeerId, PeerStats>,
    /// Keys this node provides itself.
    provided: HashSet<Key>,
    local_id: PeerId,
    ttl: Duration,
    max_keys: usize,
}

impl ProviderStore {
    pub fn new(local_id: PeerId) -> Self {
        Self {
            records: LruCache::new(NonZeroUsize::new(MAX_PROVIDER_KEYS).unwrap_or(NonZeroUsize::MIN)),
            peer_stats: LruCache::new(NonZeroUsize::new(MAX_TRACKED_PEERS).unwrap_or(NonZeroUsize::MIN)),
            provided: HashSet::new(),
            local_id,
            ttl: PROVIDER_TTL,
            max_keys: MAX_PROVIDER_KEYS,
        }
    }

    #[cfg(test)]
    fn with_ttl(local_id: PeerId, ttl: Duration) -> Self {
        Self {
            ttl,
            ..Self::new(local_id)
        }
    }

    #[cfg(test)]
    fn with_max_keys(local_id: PeerId, max_keys: usize) -> Self {
        Self {
            records: LruCache::new(NonZeroUsize::new(max_keys).unwrap_or(NonZeroUsize::MIN)),
            max_keys,
            ..Self::new(local_id)
        }
    }

    #[cfg(test)]
    fn peer_entries(&self, peer: &PeerId) -> usize {
        self.peer_stats.peek(peer).map_or(0, |s| s.entries)
    }

    /// Record this node as a provider of `key`.
    pub fn add_local(&mut self, key: Key, self_info: PeerInfo) {
        self.provided.insert(key);
        let expires_at = Instant::now() + self.ttl;
        self.reserve_key(key);
        let records = self.records.get_or_insert_mut(key, Vec::new);
        records.retain(|r| r.provider.peer_id != self_info.peer_id);
        records.insert(
            0,
            ProviderRecord {
                provider: self_info,
                expires_at,
            },
        );
        records.truncate(MAX_PROVIDERS_PER_KEY);
    }

    /// Record `provider` (which must be the authenticated sender) for `key`.
    pub fn add_remote(&mut self, key: Key, provider: PeerInfo) -> Result<(), ProviderRejection> {
        let peer = provider.peer_id;
        let now = Instant::now();
        let expires_at = now + self.ttl;
        self.purge_key(&key, now);

        if !self.peer_stats.get_or_insert_mut(peer, PeerStats::new).rate.try_consume() {
            debug!(peer = ?peer, "provider publish rate limited");
            return Err(ProviderRejection::RateLimited);
        }

        self.reserve_key(key);
        let stats = self.peer_stats.get_or_insert_mut(peer, PeerStats::new);
        let records = self.records.get_or_insert_mut(key, Vec::new);
        if let Some(existing) = records.iter_mut().find(|r| r.provider.peer_id == peer) {
            existing.provider = provider;
            existing.expires_at = expires_at;
            trace!(peer = ?peer, key = %hex::encode(&key[..8]), "provider record refreshed");
            return Ok(());
        }
        if records.len() >= MAX_PROVIDERS_PER_KEY {
            return Err(ProviderRejection::KeyFull);
        }
        if stats.entries >= PER_PEER_ENTRY_LIMIT {
            if records.is_empty() {
                self.records.pop(&key);
            }
            return Err(ProviderRejection::QuotaExceeded);
        }
        stats.entries += 1;
        records.push(ProviderRecord {
            provider,
            expires_at,
        });
        trace!(peer = ?peer, key = %hex::encode(&key[..8]), "provider record stored");
        Ok(())
    }

    /// Live providers for `key`; the local node first when it provides the key.
    pub fn get(&mut self, key: &Key) -> Vec<PeerInfo> {
        self.purge_key(key, Instant::now());
        self.records
            .get(key)
            .map(|records| records.iter().map(|r| r.provider.clone()).collect())
            .unwrap_or_default()
    }

    pub fn provides(&self, key: &Key) -> bool {
        self.provided.contains(key)
    }

    pub fn provided_keys(&self) -> Vec<Key> {
        self.provided.iter().copied().collect()
    }

    pub fn key_count(&self) -> usize {
        self.records.len()
    }

    fn purge_key(&mut self, key: &Key, now: Instant) {
        let Some(records) = self.records.get_mut(key) else {
            return;
        };
        let local_id = self.local_id;
        let mut expired = Vec::new();
        records.retain(|r| {
            // Local records stay until the republish task renews them.
            let keep = r.expires_at > now || r.provider.peer_id == local_id;
            if !keep {
                expired.push(r.provider.peer_id);
            }
            keep
        });
        let empty = records.is_empty();
        for peer in expired {
            self.release_entry(&peer);
        }
        if empty {
            self.records.pop(key);
        }
    }

    /// Drop every expired record; returns how many were removed.
    pub fn purge_expired(&mut self) -> usize {
        let now = Instant::now();
        let keys: Vec<Key> = self.records.iter().map(|(k, _)| *k).collect();
        let before: usize = self.records.iter().map(|(_, r)| r.len()).sum();
        for key in keys {
            self.purge_key(&key, now);
        }
        let after: usize = self.records.iter().map(|(_, r)| r.len()).sum();
        before - after
    }

    /// Make room for `key`, evicting the least recently used key and
    /// returning its providers' quota.
    fn reserve_key(&mut self, key: Key) {
        if self.records.contains(&key) || self.records.len() < self.max_keys {
            return;
        }
        let Some((evicted, records)) = self.records.pop_lru() else {
            return;
        };
        trace!(key = %hex::encode(&evicted[..8]), providers = records.len(), "provider key evicted");
        for record in records {
            if record.provider.peer_id != self.local_id {
                self.release_entry(&record.provider.peer_id);
            }
        }
    }

    fn release_entry(&mut self, peer: &PeerId) {
        if let Some(stats) = self.peer_stats.get_mut(peer) {
            stats.entries = stats.entries.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(seed: u8) -> PeerInfo {
        PeerInfo::single(
            PeerId::from_bytes([seed; 32]),
            format!("/ip4/8.8.8.{seed}/tcp/4001").parse().unwrap(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn local_provider_listed_first() {
        let local = peer(1);
        let mut store = ProviderStore::new(local.peer_id);
        let key = [9u8; 32];
        store.add_remote(key, peer(2)).unwrap();
        store.add_local(key, local.clone());

        let providers = store.get(&key);
        assert_eq!(providers[0].peer_id, local.peer_id);
        assert_eq!(providers.len(), 2);
        assert!(store.provides(&key));
        assert_eq!(store.provided_keys(), vec![key]);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_records_expire() {
        let mut store = ProviderStore::with_ttl(PeerId::from_bytes([0; 32]), Duration::from_secs(10));
        let key = [1u8; 32];
        store.add_remote(key, peer(2)).unwrap();
        assert_eq!(store.get(&key).len(), 1);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(store.get(&key).is_empty());
        assert_eq!(store.key_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn purge_expired_counts_removed_records() {
        let mut store = ProviderStore::with_ttl(PeerId::from_bytes([0; 32]), Duration::from_secs(10));
        store.add_remote([1; 32], peer(2)).unwrap();
        store.add_remote([2; 32], peer(3)).unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(store.purge_expired(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn key_capacity_enforced_but_refresh_allowed() {
        let mut store = ProviderStore::new(PeerId::from_bytes([0; 32]));
        let key = [5u8; 32];
        for seed in 1..=MAX_PROVIDERS_PER_KEY as u8 {
            store.add_remote(key, peer(seed)).unwrap();
        }
        assert_eq!(
            store.add_remote(key, peer(200)),
            Err(ProviderRejection::KeyFull)
        );
        assert!(store.add_remote(key, peer(1)).is_ok());
        assert_eq!(store.get(&key).len(), MAX_PROVIDERS_PER_KEY);
    }

    #[tokio::test(start_paused = true)]
    async fn evicted_key_returns_peer_quota() {
        let mut store = ProviderStore::with_max_keys(PeerId::from_bytes([0; 32]), 2);
        let publisher = peer(7);
        store.add_remote([1; 32], publisher.clone()).unwrap();
        store.add_remote([2; 32], publisher.clone()).unwrap();
        store.add_remote([2; 32], peer(8)).unwrap();
        assert_eq!(store.peer_entries(&publisher.peer_id), 2);

        store.add_remote([3; 32], publisher.clone()).unwrap();
        assert_eq!(store.key_count(), 2);
        assert!(store.get(&[1; 32]).is_empty());
        assert_eq!(store.peer_entries(&publisher.peer_id), 2);
        assert_eq!(store.peer_entries(&peer(8).peer_id), 1);

        store.add_remote([4; 32], peer(9)).unwrap();
        assert!(store.get(&[2; 32]).is_empty());
        assert_eq!(store.peer_entries(&publisher.peer_id), 1);
        assert_eq!(store.peer_entries(&peer(8).peer_id), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn publish_rate_limited_per_peer() {
        let mut store = ProviderStore::new(PeerId::from_bytes([0; 32]));
        for i in 0..PER_PEER_RATE_LIMIT {
            let mut key = [0u8; 32];
            key[..4].copy_from_slice(&i.to_be_bytes());
            store.add_remote(key, peer(7)).unwrap();
        }
        assert_eq!(
            store.add_remote([0xFF; 32], peer(7)),
            Err(ProviderRejection::RateLimited)
        );
        assert!(store.add_remote([0xFF; 32], peer(8)).is_ok());
    }
}
