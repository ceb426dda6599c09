//! Protocol traits over the RPC layer.
//!
//! | Protocol | Trait | Purpose |
//! |----------|-------|---------|
//! | DHT | [`DhtNodeRpc`] | Peer and provider lookups |
//! | Blocks | [`BlockRpc`] | Fetching content from a provider |
//! | Identify | [`IdentifyRpc`] | Exchanging listen and observed addresses |
//!
//! The DHT actor is generic over [`DhtNodeRpc`] so it can be driven by an
//! in-memory network in tests.

use anyhow::Result;
use async_trait::async_trait;

use crate::blockstore::Key;
use crate::identity::{PeerId, PeerInfo};
use crate::messages::IdentifyInfo;
use crate::multiaddr::Multiaddr;

#[async_trait]
pub trait DhtNodeRpc: Send + Sync + 'static {
    /// Peers `to` knows closest to `target`.
    async fn find_node(&self, to: &PeerInfo, target: PeerId) -> Result<Vec<PeerInfo>>;

    /// Providers `to` knows for `key`, plus peers closer to it.
    async fn get_providers(&self, to: &PeerInfo, key: Key) -> Result<(Vec<PeerInfo>, Vec<PeerInfo>)>;

    /// Ask `to` to record us as a provider of `key`.
    async fn add_provider(&self, to: &PeerInfo, key: Key) -> Result<()>;

    async fn ping(&self, to: &PeerInfo) -> Result<()>;
}

#[async_trait]
pub trait BlockRpc: Send + Sync {
    /// Fetch the block for `key` from `from`; `None` if it does not have it.
    async fn get_block(&self, from: &PeerInfo, key: Key) -> Result<Option<Vec<u8>>>;
}

#[async_trait]
pub trait IdentifyRpc: Send + Sync {
    async fn identify(&self, to: &PeerInfo, listen_addrs: Vec<Multiaddr>) -> Result<IdentifyInfo>;
}
