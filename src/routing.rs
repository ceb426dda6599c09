//! # XOR-Metric Routing Table
//!
//! Kademlia routing table: 256 k-buckets indexed by the length of the prefix a
//! peer shares with the local id.
//!
//! ## Peer States
//!
//! ```text
//! (absent) ──query sent──► Contacted ──reply──► Responsive
//!                              │                    │
//!                              └──fail / idle──► Stale ──bucket full──► (evicted)
//! ```
//!
//! A peer is `Responsive` after any valid reply or any inbound request from it.
//! It becomes `Stale` when a query to it fails or times out, or when it has not
//! been heard from for [`PEER_STALE_THRESHOLD`]. Peers learned from a third
//! party enter as `Contacted`: they are lookup candidates that have not answered
//! yet.
//!
//! ## Eviction
//!
//! When a bucket is full the oldest `Stale` entry is evicted first; between
//! equally old entries the one farthest from the local id goes. If no entry is
//! stale, the least-recently-seen entry is pinged by the caller and
//! [`RoutingTable::apply_ping_result`] settles the slot.
//!
//! ## Anti-Eclipse Protection
//!
//! [`RoutingInsertionLimiter`] caps how many third-party peers a single source
//! can push into the table per minute.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::num::NonZeroUsize;

use lru::LruCache;
use tokio::time::{Duration, Instant};

use crate::identity::{PeerId, PeerInfo};
use crate::ratelimit::TokenBucket;

/// Interval between bucket refresh checks.
pub(crate) const BUCKET_REFRESH_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// A bucket without activity for this long is refreshed with a random lookup.
pub(crate) const BUCKET_STALE_THRESHOLD: Duration = Duration::from_secs(30 * 60);

/// A peer not heard from for this long is considered stale.
pub const PEER_STALE_THRESHOLD: Duration = Duration::from_secs(30 * 60);

const ROUTING_INSERTION_PER_PEER_LIMIT: u32 = 50;

const ROUTING_INSERTION_RATE_WINDOW: Duration = Duration::from_secs(60);

const MAX_ROUTING_INSERTION_TRACKED_PEERS: usize = 1_000;

pub const NUM_BUCKETS: usize = 256;

/// Which addresses may leave this node inside peer-info records.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AddressPolicy {
    /// Strip loopback, private, link-local and other non-global addresses.
    #[default]
    PublicOnly,
    /// Advertise every address (local test networks).
    AllowPrivate,
}

impl AddressPolicy {
    pub fn apply(&self, info: &PeerInfo) -> PeerInfo {
        match self {
            AddressPolicy::PublicOnly => info.public_only(),
            AddressPolicy::AllowPrivate => info.clone(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerState {
    Contacted,
    Responsive,
    Stale,
}

#[derive(Clone, Debug)]
pub struct RoutingEntry {
    pub info: PeerInfo,
    pub state: PeerState,
    pub last_seen: Instant,
}

pub(crate) struct RoutingInsertionLimiter {
    buckets: LruCache<PeerId, TokenBucket>,
}

impl RoutingInsertionLimiter {
    pub fn new() -> Self {
        let tracked =
            NonZeroUsize::new(MAX_ROUTING_INSERTION_TRACKED_PEERS).unwrap_or(NonZeroUsize::MIN);
        Self {
            buckets: LruCache::new(tracked),
        }
    }

    pub fn allow_insertion(&mut self, from_peer: &PeerId) -> bool {
        let rate = ROUTING_INSERTION_PER_PEER_LIMIT as f64 / ROUTING_INSERTION_RATE_WINDOW.as_secs_f64();
        self.buckets
            .get_or_insert_mut(*from_peer, || {
                TokenBucket::new(ROUTING_INSERTION_PER_PEER_LIMIT, rate)
            })
            .try_consume()
    }
}

/// Lexicographic comparison of two XOR distances.
pub fn distance_cmp(a: &[u8; 32], b: &[u8; 32]) -> Ordering {
    a.cmp(b)
}

/// Order `a` and `b` by XOR distance to `target`, then by id bytes.
pub fn compare_by_distance(target: &[u8; 32], a: &PeerId, b: &PeerId) -> Ordering {
    let target = PeerId::from_bytes(*target);
    distance_cmp(&a.xor_distance(&target), &b.xor_distance(&target))
        .then_with(|| a.as_bytes().cmp(b.as_bytes()))
}

pub(crate) fn bucket_index(self_id: &PeerId, other: &PeerId) -> usize {
    let dist = self_id.xor_distance(other);
    for (byte_idx, byte) in dist.iter().enumerate() {
        if *byte != 0 {
            return byte_idx * 8 + byte.leading_zeros() as usize;
        }
    }
    NUM_BUCKETS - 1
}

pub(crate) fn random_id_for_bucket(self_id: &PeerId, bucket_idx: usize) -> PeerId {
    let self_bytes = self_id.as_bytes();

    let mut distance = [0u8; 32];
    if getrandom::getrandom(&mut distance).is_err() {
        for (i, byte) in distance.iter_mut().enumerate() {
            *byte = self_bytes[i].wrapping_add((bucket_idx.wrapping_mul(i + 1)) as u8);
        }
    }

    let byte_idx = bucket_idx / 8;
    let bit_pos = bucket_idx % 8;
    for byte in distance.iter_mut().take(byte_idx) {
        *byte = 0;
    }
    let target_bit = 0x80u8 >> bit_pos;
    distance[byte_idx] = target_bit | (distance[byte_idx] & target_bit.wrapping_sub(1));

    let mut target = [0u8; 32];
    for i in 0..32 {
        target[i] = self_bytes[i] ^ distance[i];
    }
    PeerId::from_bytes(target)
}

#[derive(Debug, Clone)]
struct Bucket {
    /// Least recently seen first.
    entries: Vec<RoutingEntry>,
    last_refresh: Instant,
}

impl Bucket {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            last_refresh: Instant::now(),
        }
    }

    fn position(&self, id: &PeerId) -> Option<usize> {
        self.entries.iter().position(|e| &e.info.peer_id == id)
    }

    fn mark_refreshed(&mut self) {
        self.last_refresh = Instant::now();
    }

    fn is_stale(&self, threshold: Duration) -> bool {
        self.last_refresh.elapsed() > threshold
    }

    /// Move entry `pos` to the most-recently-seen end.
    fn bump(&mut self, pos: usize) {
        let entry = self.entries.remove(pos);
        self.entries.push(entry);
    }

    /// Stale entry to evict: oldest `last_seen`, then largest distance to `self_id`.
    fn eviction_candidate(&self, self_id: &PeerId) -> Option<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.state == PeerState::Stale)
            .min_by(|(_, a), (_, b)| {
                a.last_seen.cmp(&b.last_seen).then_with(|| {
                    let da = a.info.peer_id.xor_distance(self_id);
                    let db = b.info.peer_id.xor_distance(self_id);
                    distance_cmp(&db, &da)
                })
            })
            .map(|(pos, _)| pos)
    }
}

/// Outcome of offering a peer to the table.
#[derive(Debug)]
pub(crate) enum InsertOutcome {
    Inserted,
    Updated,
    /// A stale entry made room for the new peer.
    Replaced { evicted: PeerId },
    /// Bucket full of live entries; the caller pings `pending.oldest`.
    Pending(PendingBucketUpdate),
    Ignored,
}

#[derive(Clone, Debug)]
pub(crate) struct PendingBucketUpdate {
    pub bucket_index: usize,
    pub oldest: PeerInfo,
    pub new_entry: RoutingEntry,
}

#[derive(Debug)]
pub struct RoutingTable {
    self_id: PeerId,
    k: usize,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(self_id: PeerId, k: usize) -> Self {
        Self {
            self_id,
            k,
            buckets: (0..NUM_BUCKETS).map(|_| Bucket::new()).collect(),
        }
    }

    pub fn self_id(&self) -> PeerId {
        self.self_id
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.entries.is_empty())
    }

    pub fn entry(&self, id: &PeerId) -> Option<&RoutingEntry> {
        let bucket = &self.buckets[bucket_index(&self.self_id, id)];
        bucket.position(id).map(|pos| &bucket.entries[pos])
    }

    pub fn state(&self, id: &PeerId) -> Option<PeerState> {
        self.entry(id).map(|e| e.state)
    }

    /// Offer a peer to the table in `state`.
    pub(crate) fn insert(&mut self, info: PeerInfo, state: PeerState) -> InsertOutcome {
        if info.peer_id == self.self_id {
            return InsertOutcome::Ignored;
        }
        let idx = bucket_index(&self.self_id, &info.peer_id);
        let self_id = self.self_id;
        let k = self.k;
        let bucket = &mut self.buckets[idx];
        let now = Instant::now();

        if let Some(pos) = bucket.position(&info.peer_id) {
            let entry = &mut bucket.entries[pos];
            entry.info.merge_addrs(&info);
            match state {
                PeerState::Responsive => {
                    entry.state = PeerState::Responsive;
                    entry.last_seen = now;
                    bucket.bump(pos);
                    bucket.mark_refreshed();
                }
                PeerState::Contacted if entry.state == PeerState::Stale => {
                    entry.state = PeerState::Contacted;
                }
                PeerState::Contacted => {}
                PeerState::Stale => entry.state = PeerState::Stale,
            }
            return InsertOutcome::Updated;
        }

        let new_entry = RoutingEntry {
            info,
            state,
            last_seen: now,
        };

        if bucket.entries.len() < k {
            bucket.entries.push(new_entry);
            bucket.mark_refreshed();
            return InsertOutcome::Inserted;
        }

        if let Some(pos) = bucket.eviction_candidate(&self_id) {
            let evicted = bucket.entries.remove(pos).info.peer_id;
            bucket.entries.push(new_entry);
            bucket.mark_refreshed();
            return InsertOutcome::Replaced { evicted };
        }

        match bucket.entries.first() {
            Some(oldest) => InsertOutcome::Pending(PendingBucketUpdate {
                bucket_index: idx,
                oldest: oldest.info.clone(),
                new_entry,
            }),
            None => InsertOutcome::Ignored,
        }
    }

    /// A query was sent to `info`, or a peer told us about it.
    pub(crate) fn mark_contacted(&mut self, info: PeerInfo) -> InsertOutcome {
        self.insert(info, PeerState::Contacted)
    }

    /// `info` answered a query or sent us a request.
    pub(crate) fn mark_responsive(&mut self, info: PeerInfo) -> InsertOutcome {
        self.insert(info, PeerState::Responsive)
    }

    /// A query to `id` failed or timed out.
    pub fn mark_failed(&mut self, id: &PeerId) {
        let idx = bucket_index(&self.self_id, id);
        let bucket = &mut self.buckets[idx];
        if let Some(pos) = bucket.position(id) {
            bucket.entries[pos].state = PeerState::Stale;
        }
    }

    /// Demote entries idle for longer than `threshold`; returns how many changed.
    pub fn refresh_states(&mut self, threshold: Duration) -> usize {
        let mut demoted = 0;
        for bucket in &mut self.buckets {
            for entry in &mut bucket.entries {
                if entry.state != PeerState::Stale && entry.last_seen.elapsed() > threshold {
                    entry.state = PeerState::Stale;
                    demoted += 1;
                }
            }
        }
        demoted
    }

    pub fn remove(&mut self, id: &PeerId) -> bool {
        let idx = bucket_index(&self.self_id, id);
        let bucket = &mut self.buckets[idx];
        match bucket.position(id) {
            Some(pos) => {
                bucket.entries.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Up to `count` peers ordered by ascending XOR distance to `target`.
    pub fn closest(&self, target: &[u8; 32], count: usize) -> Vec<PeerInfo> {
        if count == 0 {
            return Vec::new();
        }

        struct Candidate<'a> {
            dist: [u8; 32],
            info: &'a PeerInfo,
        }

        impl Ord for Candidate<'_> {
            fn cmp(&self, other: &Self) -> Ordering {
                distance_cmp(&self.dist, &other.dist)
                    .then_with(|| self.info.peer_id.as_bytes().cmp(other.info.peer_id.as_bytes()))
            }
        }
        impl PartialOrd for Candidate<'_> {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }
        impl PartialEq for Candidate<'_> {
            fn eq(&self, other: &Self) -> bool {
                self.cmp(other) == Ordering::Equal
            }
        }
        impl Eq for Candidate<'_> {}

        let target_id = PeerId::from_bytes(*target);
        let mut heap: BinaryHeap<Candidate<'_>> = BinaryHeap::with_capacity(count + 1);
        for bucket in &self.buckets {
            for entry in &bucket.entries {
                let candidate = Candidate {
                    dist: entry.info.peer_id.xor_distance(&target_id),
                    info: &entry.info,
                };
                if heap.len() < count {
                    heap.push(candidate);
                } else if heap.peek().is_some_and(|max| candidate < *max) {
                    heap.push(candidate);
                    heap.pop();
                }
            }
        }

        heap.into_sorted_vec()
            .into_iter()
            .map(|c| c.info.clone())
            .collect()
    }

    pub fn find_closest_peers(&self, key: &[u8; 32], count: usize) -> Vec<PeerId> {
        self.closest(key, count)
            .into_iter()
            .map(|info| info.peer_id)
            .collect()
    }

    /// Settle a full bucket after pinging its least-recently-seen entry.
    pub(crate) fn apply_ping_result(&mut self, pending: PendingBucketUpdate, oldest_alive: bool) {
        let k = self.k;
        let bucket = &mut self.buckets[pending.bucket_index];
        let Some(pos) = bucket.position(&pending.oldest.peer_id) else {
            if bucket.entries.len() < k && bucket.position(&pending.new_entry.info.peer_id).is_none() {
                bucket.entries.push(pending.new_entry);
            }
            return;
        };

        if oldest_alive {
            let entry = &mut bucket.entries[pos];
            entry.state = PeerState::Responsive;
            entry.last_seen = Instant::now();
            bucket.bump(pos);
            return;
        }

        bucket.entries.remove(pos);
        if bucket.position(&pending.new_entry.info.peer_id).is_none() && bucket.entries.len() < k {
            bucket.entries.push(pending.new_entry);
            bucket.mark_refreshed();
        }
    }

    pub(crate) fn stale_bucket_indices(&self, threshold: Duration) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, bucket)| !bucket.entries.is_empty() && bucket.is_stale(threshold))
            .map(|(idx, _)| idx)
            .collect()
    }

    pub(crate) fn mark_bucket_refreshed(&mut self, bucket_idx: usize) {
        if let Some(bucket) = self.buckets.get_mut(bucket_idx) {
            bucket.mark_refreshed();
        }
    }
}
