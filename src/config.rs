//! Command-line and environment configuration for the `destra-node` binary.
//!
//! Every option can be given as a flag or through the environment variable
//! named next to it; flags win.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::dht::DhtConfig;
use crate::multiaddr::Multiaddr;
use crate::node::{IdentitySource, NodeOptions, ProbePolicy};
use crate::registry::{
    Announcer, DryRunRegistry, JsonRpcRegistry, JsonRpcRegistryConfig, Registry, RegistryError, RetryPolicy,
};
use crate::routing::AddressPolicy;
use crate::transport::TransportConfig;

#[derive(Debug, Parser)]
#[command(name = "destra-node", version, about = "Destra storage bootstrap node")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub node: NodeConfig,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Generate an identity and write it to the configured key files.
    Keygen {
        /// Overwrite existing key files.
        #[arg(long)]
        force: bool,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ProbePolicyArg {
    Fatal,
    Degraded,
    Skip,
}

impl From<ProbePolicyArg> for ProbePolicy {
    fn from(arg: ProbePolicyArg) -> Self {
        match arg {
            ProbePolicyArg::Fatal => ProbePolicy::Fatal,
            ProbePolicyArg::Degraded => ProbePolicy::Degraded,
            ProbePolicyArg::Skip => ProbePolicy::Skip,
        }
    }
}

#[derive(Clone, Debug, Args)]
pub struct NodeConfig {
    /// TCP port to listen on.
    #[arg(long, env = "NODE_PORT", default_value_t = 4001)]
    pub port: u16,

    #[arg(long, env = "LISTEN_IP", default_value = "0.0.0.0")]
    pub listen_ip: IpAddr,

    /// Externally reachable IP; probed and announced to the registry.
    #[arg(long, env = "PUBLIC_IP")]
    pub public_ip: Option<IpAddr>,

    #[arg(long, env = "PRIVATE_KEY_PATH", default_value = "./keys/private.key")]
    pub private_key_path: PathBuf,

    #[arg(long, env = "PUBLIC_KEY_PATH", default_value = "./keys/public.key")]
    pub public_key_path: PathBuf,

    #[arg(long, env = "BLOCK_STORE_PATH", default_value = "./block_store")]
    pub block_store_path: PathBuf,

    #[arg(long, env = "PROBE_TIMEOUT_MS", default_value_t = 10_000)]
    pub probe_timeout_ms: u64,

    #[arg(long, env = "PROBE_POLICY", value_enum, default_value_t = ProbePolicyArg::Fatal)]
    pub probe_policy: ProbePolicyArg,

    /// Comma-separated `/ip4/../tcp/../p2p/<peer>` addresses.
    #[arg(long, env = "BOOTSTRAP_PEERS", value_delimiter = ',')]
    pub bootstrap_peers: Vec<Multiaddr>,

    /// Advertise loopback and private addresses (local test networks).
    #[arg(long, env = "ALLOW_PRIVATE_ADDRS")]
    pub allow_private_addrs: bool,

    #[arg(long, env = "DHT_K", default_value_t = crate::dht::DEFAULT_K)]
    pub dht_k: usize,

    #[arg(long, env = "DHT_ALPHA", default_value_t = crate::dht::DEFAULT_ALPHA)]
    pub dht_alpha: usize,

    #[arg(long, env = "DIAL_TIMEOUT_MS", default_value_t = 10_000)]
    pub dial_timeout_ms: u64,

    #[arg(long, env = "QUERY_TIMEOUT_MS", default_value_t = 10_000)]
    pub query_timeout_ms: u64,

    /// Ethereum JSON-RPC endpoint of the registry chain. Without it,
    /// announcements are only logged.
    #[arg(long, env = "RPC_URL")]
    pub rpc_url: Option<String>,

    #[arg(long, env = "CONTRACT_ADDRESS")]
    pub contract_address: Option<String>,

    /// Account the endpoint signs registry transactions with.
    #[arg(long, env = "REGISTRY_ACCOUNT")]
    pub registry_account: Option<String>,

    #[arg(long, env = "REGISTRY_MAX_ATTEMPTS", default_value_t = 3)]
    pub registry_max_attempts: u32,

    #[arg(long, env = "REGISTRY_BACKOFF_MS", default_value_t = 1_000)]
    pub registry_backoff_ms: u64,

    #[arg(long, env = "REGISTRY_CONFIRM_TIMEOUT_MS", default_value_t = 120_000)]
    pub registry_confirm_timeout_ms: u64,
}

impl NodeConfig {
    pub fn node_options(&self) -> NodeOptions {
        let identity = IdentitySource::Files {
            private: self.private_key_path.clone(),
            public: self.public_key_path.clone(),
        };
        let mut options = NodeOptions::new(identity, SocketAddr::new(self.listen_ip, self.port));
        options.public_ip = self.public_ip;
        options.block_store_path = self.block_store_path.clone();
        options.dht = DhtConfig {
            k: self.dht_k,
            alpha: self.dht_alpha,
            query_timeout: Duration::from_millis(self.query_timeout_ms),
            address_policy: if self.allow_private_addrs {
                AddressPolicy::AllowPrivate
            } else {
                AddressPolicy::PublicOnly
            },
        };
        options.transport = TransportConfig {
            dial_timeout: Duration::from_millis(self.dial_timeout_ms),
            ..TransportConfig::default()
        };
        options.probe_policy = self.probe_policy.into();
        options.probe_timeout = Duration::from_millis(self.probe_timeout_ms);
        options.bootstrap_peers = self.bootstrap_peers.clone();
        options
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.registry_max_attempts,
            initial_backoff: Duration::from_millis(self.registry_backoff_ms),
            ..RetryPolicy::default()
        }
    }

    /// JSON-RPC registry when `RPC_URL` is set, dry run otherwise.
    pub fn announcer(&self) -> Result<Announcer, RegistryError> {
        let registry: Arc<dyn Registry> = match &self.rpc_url {
            None => Arc::new(DryRunRegistry),
            Some(rpc_url) => {
                let contract = self
                    .contract_address
                    .clone()
                    .ok_or_else(|| RegistryError::Config("CONTRACT_ADDRESS is required with RPC_URL".into()))?;
                let account = self
                    .registry_account
                    .clone()
                    .ok_or_else(|| RegistryError::Config("REGISTRY_ACCOUNT is required with RPC_URL".into()))?;
                Arc::new(JsonRpcRegistry::new(JsonRpcRegistryConfig {
                    rpc_url: rpc_url.clone(),
                    contract,
                    account,
                    confirm_timeout: Duration::from_millis(self.registry_confirm_timeout_ms),
                })?)
            }
        };
        Ok(Announcer::new(registry, self.retry_policy()))
    }
}
