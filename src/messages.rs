//! # Wire Protocol Messages
//!
//! Every message that crosses the network is a bincode-encoded value from this
//! module. Decoding always goes through [`deserialize_bounded`], which caps the
//! allocation a peer can force on us.
//!
//! | Stream use | Request | Response |
//! |------------|---------|----------|
//! | Liveness | `Ping` | `Pong` |
//! | Peer lookup | `FindNode` | `Nodes` |
//! | Provider lookup | `GetProviders` | `Providers` |
//! | Provider publish | `AddProvider` | `Ack` / `Error` |
//! | Block exchange | `GetBlock` | `Block` |
//! | Identify | `Identify` | `Identify` |
//!
//! Each request carries the sender's own `from` record. The server rejects a
//! request whose `from.peer_id` differs from the peer authenticated by the
//! transport handshake.

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::blockstore::Key;
use crate::identity::{PeerId, PeerInfo};
use crate::multiaddr::Multiaddr;

/// Largest block served over the block exchange (1 MiB).
pub const MAX_BLOCK_SIZE: usize = 1024 * 1024;

/// Decoding limit; leaves room for framing around a full block.
pub const MAX_DESERIALIZE_SIZE: u64 = (MAX_BLOCK_SIZE as u64) + 4096;

/// Agent string advertised in identify responses.
pub const AGENT_VERSION: &str = concat!("destra-bootstrap-node/", env!("CARGO_PKG_VERSION"));

/// Protocol string advertised in identify responses.
pub const PROTOCOL_VERSION: &str = "/destra/1.0.0";

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
        .allow_trailing_bytes()
}

pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

/// Deserialize with the size limit enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RpcRequest {
    Ping {
        from: PeerInfo,
    },
    FindNode {
        from: PeerInfo,
        target: PeerId,
    },
    GetProviders {
        from: PeerInfo,
        key: Key,
    },
    AddProvider {
        from: PeerInfo,
        key: Key,
        provider: PeerInfo,
    },
    GetBlock {
        from: PeerInfo,
        key: Key,
    },
    Identify {
        from: PeerInfo,
        listen_addrs: Vec<Multiaddr>,
    },
}

impl RpcRequest {
    /// The sender's self-reported record.
    pub fn sender(&self) -> &PeerInfo {
        match self {
            RpcRequest::Ping { from }
            | RpcRequest::FindNode { from, .. }
            | RpcRequest::GetProviders { from, .. }
            | RpcRequest::AddProvider { from, .. }
            | RpcRequest::GetBlock { from, .. }
            | RpcRequest::Identify { from, .. } => from,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RpcRequest::Ping { .. } => "ping",
            RpcRequest::FindNode { .. } => "find_node",
            RpcRequest::GetProviders { .. } => "get_providers",
            RpcRequest::AddProvider { .. } => "add_provider",
            RpcRequest::GetBlock { .. } => "get_block",
            RpcRequest::Identify { .. } => "identify",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyInfo {
    pub protocol_version: String,
    pub agent_version: String,
    pub listen_addrs: Vec<Multiaddr>,
    /// The address the responder saw the request arrive from.
    pub observed_addr: Multiaddr,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RpcResponse {
    Pong,
    Nodes(Vec<PeerInfo>),
    Providers {
        providers: Vec<PeerInfo>,
        closer: Vec<PeerInfo>,
    },
    Ack,
    Block(Option<Vec<u8>>),
    Identify(IdentifyInfo),
    Error {
        message: String,
    },
}
