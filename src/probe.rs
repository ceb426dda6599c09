//! Self-reachability probe.
//!
//! The node dials its own advertised `(ip, port)` over plain TCP. A successful
//! connect means the listen port is reachable at that address; the socket is
//! dropped immediately, before any handshake.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(10_000);

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("no answer from {addr} within {after:?}")]
    Timeout { addr: SocketAddr, after: Duration },
    #[error("connection to {0} refused")]
    Refused(SocketAddr),
    #[error("{addr} unreachable: {source}")]
    Unreachable {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug)]
pub enum ProbeOutcome {
    Reachable { latency: Duration },
    Failed(ProbeError),
}

#[derive(Debug)]
pub struct ReachabilityResult {
    pub target: SocketAddr,
    pub outcome: ProbeOutcome,
}

impl ReachabilityResult {
    pub fn is_reachable(&self) -> bool {
        matches!(self.outcome, ProbeOutcome::Reachable { .. })
    }

    pub fn error(&self) -> Option<&ProbeError> {
        match &self.outcome {
            ProbeOutcome::Failed(e) => Some(e),
            ProbeOutcome::Reachable { .. } => None,
        }
    }

    /// Convert into a `Result`, keeping the latency on success.
    pub fn into_result(self) -> Result<Duration, ProbeError> {
        match self.outcome {
            ProbeOutcome::Reachable { latency } => Ok(latency),
            ProbeOutcome::Failed(e) => Err(e),
        }
    }
}

pub async fn probe(ip: IpAddr, port: u16, timeout: Duration) -> ReachabilityResult {
    let target = SocketAddr::new(ip, port);
    let started = Instant::now();

    let outcome = match tokio::time::timeout(timeout, TcpStream::connect(target)).await {
        Ok(Ok(stream)) => {
            drop(stream);
            let latency = started.elapsed();
            info!(addr = %target, latency_ms = latency.as_millis() as u64, "reachability probe succeeded");
            ProbeOutcome::Reachable { latency }
        }
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            warn!(addr = %target, "reachability probe refused");
            ProbeOutcome::Failed(ProbeError::Refused(target))
        }
        Ok(Err(e)) => {
            warn!(addr = %target, error = %e, "reachability probe failed");
            ProbeOutcome::Failed(ProbeError::Unreachable {
                addr: target,
                source: e,
            })
        }
        Err(_) => {
            warn!(addr = %target, timeout_ms = timeout.as_millis() as u64, "reachability probe timed out");
            ProbeOutcome::Failed(ProbeError::Timeout {
                addr: target,
                after: timeout,
            })
        }
    };

    debug!(addr = %target, reachable = matches!(outcome, ProbeOutcome::Reachable { .. }), "probe finished");
    ReachabilityResult { target, outcome }
}
