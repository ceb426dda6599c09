mod blockstore;
mod config;
mod crypto;
mod dht;
mod handshake;
mod identity;
mod messages;
mod multiaddr;
mod mux;
mod node;
mod probe;
mod protocols;
mod providers;
mod ratelimit;
mod registry;
mod routing;
mod rpc;
mod transport;

pub use blockstore::{hash_content, BlockStore, BlockStoreError, Key};
pub use config::{Cli, Command, NodeConfig, ProbePolicyArg};
pub use dht::{DhtConfig, DhtConfigError, LookupError, ProviderStream};
pub use handshake::HandshakeError;
pub use identity::{load_from_files, write_key_files, IdentityError, Keypair, PeerId, PeerInfo};
pub use multiaddr::{Multiaddr, MultiaddrError};
pub use mux::{Connection, RecvStream, SendStream, StreamError};
pub use node::{IdentitySource, Node, NodeOptions, ProbePolicy, StartupError, StartupStep};
pub use probe::{probe, ProbeError, ProbeOutcome, ReachabilityResult};
pub use registry::{
    Announcer, DryRunRegistry, JsonRpcRegistry, JsonRpcRegistryConfig, Registry, RegistryError, RegistryReceipt,
    RetryPolicy,
};
pub use routing::{AddressPolicy, PeerState};
pub use transport::{BindError, DialError, Listener, Transport, TransportConfig};
