//! # Registry Announcer
//!
//! Reports `(peer id, multiaddress)` to an external durable registry once the
//! node has confirmed it is reachable.
//!
//! [`Registry`] is the seam. [`JsonRpcRegistry`] submits an
//! `updateLocation(string,string)` transaction through an Ethereum JSON-RPC
//! endpoint from an account the endpoint manages, then waits for the receipt.
//! [`DryRunRegistry`] only logs. [`Announcer`] wraps any registry with a
//! [`RetryPolicy`] that retries transient failures with exponential backoff.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::identity::PeerId;
use crate::multiaddr::Multiaddr;

pub const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(120);

const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const HTTP_TIMEOUT: Duration = Duration::from_secs(15);
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const UPDATE_LOCATION_SIGNATURE: &str = "updateLocation(string,string)";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistryReceipt {
    pub tx_hash: String,
    pub block_number: Option<u64>,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("registry temporarily unavailable: {0}")]
    Unavailable(String),
    #[error("registry JSON-RPC error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("malformed registry response: {0}")]
    InvalidResponse(String),
    #[error("transaction {tx_hash} was reverted")]
    Rejected { tx_hash: String },
    #[error("transaction {tx_hash} not confirmed within {after:?}")]
    ConfirmationTimeout { tx_hash: String, after: Duration },
    #[error("invalid registry configuration: {0}")]
    Config(String),
}

impl RegistryError {
    /// Whether another attempt could succeed without changing anything.
    pub fn is_transient(&self) -> bool {
        match self {
            RegistryError::Http(e) => {
                e.is_connect()
                    || e.is_timeout()
                    || e.status().is_some_and(|s| s.is_server_error() || s.as_u16() == 429)
            }
            RegistryError::Unavailable(_) => true,
            // -32005: request limit exceeded on most public endpoints.
            RegistryError::Rpc { code, .. } => *code == -32005,
            RegistryError::InvalidResponse(_)
            | RegistryError::Rejected { .. }
            | RegistryError::Config(_) => false,
            // The transaction may still be mined; sending again would duplicate it.
            RegistryError::ConfirmationTimeout { .. } => false,
        }
    }
}

#[async_trait]
pub trait Registry: Send + Sync {
    async fn update_location(&self, peer_id: &str, multiaddr: &str) -> Result<RegistryReceipt, RegistryError>;
}

#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    fn next_backoff(&self, current: Duration) -> Duration {
        current.mul_f64(self.multiplier.max(1.0)).min(self.max_backoff)
    }
}

pub struct Announcer {
    registry: Arc<dyn Registry>,
    retry: RetryPolicy,
}

impl Announcer {
    pub fn new(registry: Arc<dyn Registry>, retry: RetryPolicy) -> Self {
        Self { registry, retry }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub async fn announce(&self, peer: &PeerId, addr: &Multiaddr) -> Result<RegistryReceipt, RegistryError> {
        let peer_id = peer.to_hex();
        let multiaddr = addr.to_string();
        let max_attempts = self.retry.max_attempts.max(1);
        let mut backoff = self.retry.initial_backoff;

        info!(peer = %peer_id, addr = %multiaddr, "announcing location to registry");
        let mut attempt = 1;
        loop {
            match self.registry.update_location(&peer_id, &multiaddr).await {
                Ok(receipt) => {
                    info!(
                        peer = %peer_id,
                        addr = %multiaddr,
                        tx = %receipt.tx_hash,
                        block = ?receipt.block_number,
                        "location recorded in registry"
                    );
                    return Ok(receipt);
                }
                Err(e) => {
                    let transient = e.is_transient();
                    warn!(
                        peer = %peer_id,
                        addr = %multiaddr,
                        attempt,
                        max_attempts,
                        transient,
                        error = %e,
                        "registry update failed"
                    );
                    if !transient || attempt >= max_attempts {
                        return Err(e);
                    }
                }
            }
            tokio::time::sleep(backoff).await;
            backoff = self.retry.next_backoff(backoff);
            attempt += 1;
        }
    }
}

/// Logs the announcement and acknowledges it.
#[derive(Debug, Default)]
pub struct DryRunRegistry;

#[async_trait]
impl Registry for DryRunRegistry {
    async fn update_location(&self, peer_id: &str, multiaddr: &str) -> Result<RegistryReceipt, RegistryError> {
        info!(peer = %peer_id, addr = %multiaddr, "dry run: registry update skipped");
        Ok(RegistryReceipt {
            tx_hash: "dry-run".to_string(),
            block_number: None,
        })
    }
}

#[derive(Clone, Debug)]
pub struct JsonRpcRegistryConfig {
    pub rpc_url: String,
    /// Registry contract address, `0x`-prefixed hex.
    pub contract: String,
    /// Sending account; must be unlocked on the endpoint.
    pub account: String,
    pub confirm_timeout: Duration,
}

pub struct JsonRpcRegistry {
    client: reqwest::Client,
    config: JsonRpcRegistryConfig,
    request_id: AtomicU64,
}

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a, T> {
    jsonrpc: &'static str,
    method: &'a str,
    params: T,
    id: u64,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse<T> {
    #[serde(default = "Option::default")]
    result: Option<T>,
    #[serde(default)]
    error: Option<JsonRpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Serialize)]
struct TransactionRequest<'a> {
    from: &'a str,
    to: &'a str,
    data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionReceipt {
    status: Option<String>,
    block_number: Option<String>,
}

impl JsonRpcRegistry {
    pub fn new(config: JsonRpcRegistryConfig) -> Result<Self, RegistryError> {
        for (name, value) in [("contract", &config.contract), ("account", &config.account)] {
            if parse_address(value).is_none() {
                return Err(RegistryError::Config(format!("{name} address {value:?} is not 20-byte hex")));
            }
        }
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            config,
            request_id: AtomicU64::new(1),
        })
    }

    async fn call<P: Serialize, R: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: P,
    ) -> Result<Option<R>, RegistryError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: self.request_id.fetch_add(1, Ordering::Relaxed),
        };
        let response = self
            .client
            .post(&self.config.rpc_url)
            .json(&request)
            .send()
            .await?
            .error_for_status()?;
        let body: JsonRpcResponse<R> = response
            .json()
            .await
            .map_err(|e| RegistryError::InvalidResponse(e.to_string()))?;
        if let Some(error) = body.error {
            return Err(RegistryError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        Ok(body.result)
    }

    async fn wait_for_receipt(&self, tx_hash: &str) -> Result<RegistryReceipt, RegistryError> {
        let deadline = tokio::time::Instant::now() + self.config.confirm_timeout;
        loop {
            let receipt: Option<TransactionReceipt> =
                self.call("eth_getTransactionReceipt", [tx_hash]).await?;
            if let Some(receipt) = receipt {
                if receipt.status.as_deref().and_then(parse_quantity) == Some(0) {
                    return Err(RegistryError::Rejected {
                        tx_hash: tx_hash.to_string(),
                    });
                }
                return Ok(RegistryReceipt {
                    tx_hash: tx_hash.to_string(),
                    block_number: receipt.block_number.as_deref().and_then(parse_quantity),
                });
            }
            if tokio::time::Instant::now() + RECEIPT_POLL_INTERVAL > deadline {
                return Err(RegistryError::ConfirmationTimeout {
                    tx_hash: tx_hash.to_string(),
                    after: self.config.confirm_timeout,
                });
            }
            debug!(tx = %tx_hash, "transaction pending");
            tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl Registry for JsonRpcRegistry {
    async fn update_location(&self, peer_id: &str, multiaddr: &str) -> Result<RegistryReceipt, RegistryError> {
        let tx = TransactionRequest {
            from: &self.config.account,
            to: &self.config.contract,
            data: format!("0x{}", hex::encode(encode_update_location(peer_id, multiaddr))),
        };
        let tx_hash: String = self
            .call("eth_sendTransaction", [tx])
            .await?
            .ok_or_else(|| RegistryError::InvalidResponse("eth_sendTransaction returned no hash".into()))?;
        info!(tx = %tx_hash, "registry transaction submitted, waiting for confirmation");
        self.wait_for_receipt(&tx_hash).await
    }
}

fn parse_address(s: &str) -> Option<[u8; 20]> {
    let bytes = hex::decode(s.strip_prefix("0x").unwrap_or(s)).ok()?;
    bytes.try_into().ok()
}

fn parse_quantity(s: &str) -> Option<u64> {
    u64::from_str_radix(s.strip_prefix("0x").unwrap_or(s), 16).ok()
}

fn selector(signature: &str) -> [u8; 4] {
    let digest = Keccak256::digest(signature.as_bytes());
    [digest[0], digest[1], digest[2], digest[3]]
}

fn abi_word(value: usize) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[24..].copy_from_slice(&(value as u64).to_be_bytes());
    word
}

fn padded_len(len: usize) -> usize {
    len.div_ceil(32) * 32
}

/// Calldata for `updateLocation(string,string)`.
fn encode_update_location(peer_id: &str, multiaddr: &str) -> Vec<u8> {
    let args = [peer_id.as_bytes(), multiaddr.as_bytes()];
    let mut out = Vec::with_capacity(4 + 64 + args.iter().map(|a| 32 + padded_len(a.len())).sum::<usize>());
    out.extend_from_slice(&selector(UPDATE_LOCATION_SIGNATURE));

    let mut offset = 32 * args.len();
    for arg in &args {
        out.extend_from_slice(&abi_word(offset));
        offset += 32 + padded_len(arg.len());
    }
    for arg in &args {
        out.extend_from_slice(&abi_word(arg.len()));
        out.extend_from_slice(arg);
        out.resize(out.len() + padded_len(arg.len()) - arg.len(), 0);
    }
    out
}
