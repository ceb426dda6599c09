//! Request/response RPC over multiplexed streams.
//!
//! Each call opens a fresh bidirectional stream, writes one length-prefixed
//! bincode request, finishes its send half and reads one length-prefixed
//! response. [`RpcNode`] is the client side and implements the protocol traits;
//! [`serve`] and [`handle_connection`] are the server side.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::blockstore::{BlockStore, BlockStoreError, Key};
use crate::dht::{DhtNode, MAX_PEERS_PER_RESPONSE};
use crate::identity::{PeerId, PeerInfo};
use crate::messages::{self, IdentifyInfo, RpcRequest, RpcResponse, AGENT_VERSION, MAX_BLOCK_SIZE, PROTOCOL_VERSION};
use crate::multiaddr::Multiaddr;
use crate::mux::{Connection, RecvStream, SendStream, StreamError};
use crate::protocols::{BlockRpc, DhtNodeRpc, IdentifyRpc};
use crate::routing::AddressPolicy;
use crate::transport::Transport;

const MAX_RESPONSE_SIZE: usize = messages::MAX_DESERIALIZE_SIZE as usize;

const RPC_STREAM_TIMEOUT: Duration = Duration::from_secs(30);

const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_PROCESS_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_REQUEST_SIZE: usize = 64 * 1024;

/// Client half of the RPC protocol, bound to one local identity.
#[derive(Clone)]
pub struct RpcNode {
    transport: Transport,
    self_info: PeerInfo,
    policy: AddressPolicy,
}

impl RpcNode {
    pub fn new(transport: Transport, self_info: PeerInfo, policy: AddressPolicy) -> Self {
        Self {
            transport,
            self_info,
            policy,
        }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Our own record as it is sent to peers.
    fn sender(&self) -> PeerInfo {
        self.policy.apply(&self.self_info)
    }

    async fn connect(&self, peer: &PeerInfo) -> Result<Connection> {
        if let Some(conn) = self.transport.connection(&peer.peer_id).await {
            return Ok(conn);
        }

        let mut last_error = None;
        for addr in &peer.addrs {
            match self.transport.dial(peer.peer_id, addr).await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    trace!(peer = ?peer.peer_id, addr = %addr, error = %e, "dial failed");
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(e) => Err(e).with_context(|| format!("failed to reach {}", peer.peer_id)),
            None => anyhow::bail!("no known address for {}", peer.peer_id),
        }
    }

    async fn rpc(&self, to: &PeerInfo, request: RpcRequest) -> Result<RpcResponse> {
        let kind = request.kind();
        let conn = self.connect(to).await?;
        let result = rpc_inner(&conn, request).await;

        if let Err(e) = &result {
            let timed_out = e.downcast_ref::<tokio::time::error::Elapsed>().is_some();
            let closed = matches!(e.downcast_ref::<StreamError>(), Some(StreamError::ConnectionClosed));
            if timed_out || closed || conn.is_closed() {
                self.transport.invalidate(&to.peer_id).await;
            }
            trace!(peer = ?to.peer_id, rpc = kind, error = %e, "rpc failed");
        }

        match result? {
            RpcResponse::Error { message } => anyhow::bail!("{kind} rejected by peer: {message}"),
            response => Ok(response),
        }
    }
}

async fn rpc_inner(conn: &Connection, request: RpcRequest) -> Result<RpcResponse> {
    tokio::time::timeout(RPC_STREAM_TIMEOUT, async {
        let (mut send, mut recv) = conn
            .open_bi()
            .await
            .context("failed to open bidirectional stream")?;

        let request_bytes = messages::serialize(&request).context("failed to serialize request")?;
        write_frame(&mut send, &request_bytes).await?;

        let mut len_buf = [0u8; 4];
        recv.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;

        if len > MAX_RESPONSE_SIZE {
            warn!(
                peer = ?conn.remote_peer(),
                size = len,
                max = MAX_RESPONSE_SIZE,
                "peer sent oversized response"
            );
            anyhow::bail!("response too large: {len} bytes (max {MAX_RESPONSE_SIZE})");
        }

        let mut response_bytes = vec![0u8; len];
        recv.read_exact(&mut response_bytes).await?;

        let response: RpcResponse =
            messages::deserialize_bounded(&response_bytes).context("failed to deserialize response")?;
        Ok(response)
    })
    .await
    .context("RPC timed out")?
}

async fn write_frame(send: &mut SendStream, payload: &[u8]) -> Result<(), StreamError> {
    let len = payload.len() as u32;
    send.write_all(&len.to_be_bytes()).await?;
    send.write_all(payload).await?;
    send.finish().await
}

fn truncate_peers(peers: Vec<PeerInfo>, to: &PeerInfo, what: &str) -> Vec<PeerInfo> {
    if peers.len() > MAX_PEERS_PER_RESPONSE {
        warn!(
            peer = ?to.peer_id,
            count = peers.len(),
            max = MAX_PEERS_PER_RESPONSE,
            "peer returned too many {what}, truncating"
        );
        peers.into_iter().take(MAX_PEERS_PER_RESPONSE).collect()
    } else {
        peers
    }
}

#[async_trait]
impl DhtNodeRpc for RpcNode {
    async fn find_node(&self, to: &PeerInfo, target: PeerId) -> Result<Vec<PeerInfo>> {
        let request = RpcRequest::FindNode {
            from: self.sender(),
            target,
        };
        match self.rpc(to, request).await? {
            RpcResponse::Nodes(nodes) => Ok(truncate_peers(nodes, to, "peers")),
            other => anyhow::bail!("unexpected response to FindNode: {other:?}"),
        }
    }

    async fn get_providers(&self, to: &PeerInfo, key: Key) -> Result<(Vec<PeerInfo>, Vec<PeerInfo>)> {
        let request = RpcRequest::GetProviders {
            from: self.sender(),
            key,
        };
        match self.rpc(to, request).await? {
            RpcResponse::Providers { providers, closer } => Ok((
                truncate_peers(providers, to, "providers"),
                truncate_peers(closer, to, "peers"),
            )),
            other => anyhow::bail!("unexpected response to GetProviders: {other:?}"),
        }
    }

    async fn add_provider(&self, to: &PeerInfo, key: Key) -> Result<()> {
        let me = self.sender();
        let request = RpcRequest::AddProvider {
            from: me.clone(),
            key,
            provider: me,
        };
        match self.rpc(to, request).await? {
            RpcResponse::Ack => Ok(()),
            other => anyhow::bail!("unexpected response to AddProvider: {other:?}"),
        }
    }

    async fn ping(&self, to: &PeerInfo) -> Result<()> {
        let request = RpcRequest::Ping { from: self.sender() };
        match self.rpc(to, request).await? {
            RpcResponse::Pong => Ok(()),
            other => anyhow::bail!("unexpected response to Ping: {other:?}"),
        }
    }
}

#[async_trait]
impl BlockRpc for RpcNode {
    async fn get_block(&self, from: &PeerInfo, key: Key) -> Result<Option<Vec<u8>>> {
        let request = RpcRequest::GetBlock {
            from: self.sender(),
            key,
        };
        match self.rpc(from, request).await? {
            RpcResponse::Block(Some(data)) if data.len() > MAX_BLOCK_SIZE => {
                anyhow::bail!("block too large: {} bytes (max {MAX_BLOCK_SIZE})", data.len())
            }
            RpcResponse::Block(block) => Ok(block),
            other => anyhow::bail!("unexpected response to GetBlock: {other:?}"),
        }
    }
}

#[async_trait]
impl IdentifyRpc for RpcNode {
    async fn identify(&self, to: &PeerInfo, listen_addrs: Vec<Multiaddr>) -> Result<IdentifyInfo> {
        let request = RpcRequest::Identify {
            from: self.sender(),
            listen_addrs,
        };
        match self.rpc(to, request).await? {
            RpcResponse::Identify(info) => Ok(info),
            other => anyhow::bail!("unexpected response to Identify: {other:?}"),
        }
    }
}

/// Serve every connection the transport hands over until it stops.
pub async fn serve<N: DhtNodeRpc>(
    mut incoming: mpsc::Receiver<Connection>,
    dht: DhtNode<N>,
    blocks: Arc<BlockStore>,
) {
    while let Some(conn) = incoming.recv().await {
        let dht = dht.clone();
        let blocks = blocks.clone();
        tokio::spawn(async move {
            let peer = conn.remote_peer();
            if let Err(e) = handle_connection(dht, blocks, conn).await {
                debug!(peer = ?peer, error = %e, "connection ended with error");
            }
        });
    }
    debug!("stream server stopped");
}

pub async fn handle_connection<N: DhtNodeRpc>(
    dht: DhtNode<N>,
    blocks: Arc<BlockStore>,
    conn: Connection,
) -> Result<()> {
    debug!(
        peer = ?conn.remote_peer(),
        addr = %conn.remote_addr(),
        direction = ?conn.direction(),
        "serving connection"
    );

    loop {
        let stream = match conn.accept_bi().await {
            Ok(s) => s,
            Err(StreamError::ConnectionClosed) => {
                debug!(peer = ?conn.remote_peer(), reason = ?conn.close_reason(), "connection closed");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let dht = dht.clone();
        let blocks = blocks.clone();
        let conn = conn.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_stream(dht, blocks, stream, &conn).await {
                debug!(peer = ?conn.remote_peer(), error = ?e, "stream error");
            }
        });
    }
}

async fn handle_stream<N: DhtNodeRpc>(
    dht: DhtNode<N>,
    blocks: Arc<BlockStore>,
    (mut send, mut recv): (SendStream, RecvStream),
    conn: &Connection,
) -> Result<()> {
    let remote_peer = conn.remote_peer();

    let mut len_buf = [0u8; 4];
    tokio::time::timeout(REQUEST_READ_TIMEOUT, recv.read_exact(&mut len_buf))
        .await
        .map_err(|_| anyhow::anyhow!("request header read timed out"))??;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_REQUEST_SIZE {
        warn!(
            peer = ?remote_peer,
            size = len,
            max = MAX_REQUEST_SIZE,
            "rejecting oversized request"
        );
        let response = RpcResponse::Error {
            message: format!("request too large: {len} bytes (max {MAX_REQUEST_SIZE})"),
        };
        write_frame(&mut send, &messages::serialize(&response)?).await?;
        return Ok(());
    }

    let mut request_bytes = vec![0u8; len];
    tokio::time::timeout(REQUEST_READ_TIMEOUT, recv.read_exact(&mut request_bytes))
        .await
        .map_err(|_| anyhow::anyhow!("request body read timed out"))??;

    let request: RpcRequest =
        messages::deserialize_bounded(&request_bytes).context("failed to deserialize request")?;

    let claimed = request.sender().peer_id;
    let response = if claimed != remote_peer {
        warn!(
            peer = ?remote_peer,
            claimed = ?claimed,
            rpc = request.kind(),
            "rejecting request: sender does not match authenticated peer"
        );
        RpcResponse::Error {
            message: "sender does not match connection identity".to_string(),
        }
    } else {
        match tokio::time::timeout(
            REQUEST_PROCESS_TIMEOUT,
            handle_request(&dht, &blocks, request, conn),
        )
        .await
        {
            Ok(response) => response,
            Err(_) => {
                warn!(peer = ?remote_peer, "request processing timed out");
                RpcResponse::Error {
                    message: "request processing timeout".to_string(),
                }
            }
        }
    };

    let response_bytes = messages::serialize(&response).context("failed to serialize response")?;
    write_frame(&mut send, &response_bytes).await?;
    Ok(())
}

async fn handle_request<N: DhtNodeRpc>(
    dht: &DhtNode<N>,
    blocks: &BlockStore,
    request: RpcRequest,
    conn: &Connection,
) -> RpcResponse {
    match request {
        RpcRequest::Ping { from } => {
            trace!(from = ?from.peer_id, "handling PING request");
            dht.handle_ping(&from).await;
            RpcResponse::Pong
        }
        RpcRequest::FindNode { from, target } => {
            let nodes = dht.handle_find_node_request(&from, target).await;
            debug!(from = ?from.peer_id, target = ?target, returned = nodes.len(), "FIND_NODE response");
            RpcResponse::Nodes(nodes)
        }
        RpcRequest::GetProviders { from, key } => {
            let (providers, closer) = dht.handle_get_providers_request(&from, key).await;
            debug!(
                from = ?from.peer_id,
                key = %hex::encode(&key[..8]),
                providers = providers.len(),
                closer = closer.len(),
                "GET_PROVIDERS response"
            );
            RpcResponse::Providers { providers, closer }
        }
        RpcRequest::AddProvider { from, key, provider } => {
            if provider.peer_id != from.peer_id {
                warn!(
                    from = ?from.peer_id,
                    provider = ?provider.peer_id,
                    "rejecting provider record for another peer"
                );
                return RpcResponse::Error {
                    message: "provider record must name the sender".to_string(),
                };
            }
            let mut provider = provider;
            provider.merge_addrs(&from);
            match dht.handle_add_provider_request(&provider, key).await {
                Ok(()) => {
                    debug!(from = ?from.peer_id, key = %hex::encode(&key[..8]), "ADD_PROVIDER accepted");
                    RpcResponse::Ack
                }
                Err(rejection) => RpcResponse::Error {
                    message: rejection.to_string(),
                },
            }
        }
        RpcRequest::GetBlock { from, key } => {
            dht.handle_ping(&from).await;
            match blocks.get(&key).await {
                Ok(data) => {
                    debug!(from = ?from.peer_id, key = %hex::encode(&key[..8]), len = data.len(), "serving block");
                    RpcResponse::Block(Some(data))
                }
                Err(BlockStoreError::NotFound(_)) => RpcResponse::Block(None),
                Err(e @ BlockStoreError::Corruption { .. }) => {
                    warn!(key = %hex::encode(&key[..8]), error = %e, "refusing to serve corrupt block");
                    RpcResponse::Block(None)
                }
                Err(e) => RpcResponse::Error {
                    message: format!("block store error: {e}"),
                },
            }
        }
        RpcRequest::Identify { from, listen_addrs } => {
            let mut sender = from;
            sender.merge_addrs(&PeerInfo::new(sender.peer_id, listen_addrs));
            dht.handle_ping(&sender).await;
            let policy = dht.config().address_policy;
            RpcResponse::Identify(IdentifyInfo {
                protocol_version: PROTOCOL_VERSION.to_string(),
                agent_version: AGENT_VERSION.to_string(),
                listen_addrs: policy.apply(dht.self_info()).addrs,
                observed_addr: Multiaddr::from_socket_addr(conn.remote_addr()),
            })
        }
    }
}
