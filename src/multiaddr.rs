//! Structured TCP addresses in multiaddr text form.
//!
//! Only the subset this node speaks is supported:
//!
//! ```text
//! /ip4/<addr>/tcp/<port>[/p2p/<peer id hex>]
//! /ip6/<addr>/tcp/<port>[/p2p/<peer id hex>]
//! /dns4|dns6|dns/<host>/tcp/<port>[/p2p/<peer id hex>]
//! ```

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::identity::PeerId;

/// Upper bound on the text form accepted from the network.
const MAX_MULTIADDR_LEN: usize = 256;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MultiaddrError {
    #[error("multiaddr must start with '/'")]
    MissingLeadingSlash,
    #[error("multiaddr exceeds 256 characters")]
    TooLong,
    #[error("unknown protocol '{0}'")]
    UnknownProtocol(String),
    #[error("protocol '{0}' is missing its value")]
    MissingValue(&'static str),
    #[error("invalid {proto} value '{value}'")]
    InvalidValue { proto: &'static str, value: String },
    #[error("multiaddr has no host component")]
    MissingHost,
    #[error("multiaddr has no tcp component")]
    MissingTransport,
    #[error("unexpected component '{0}' after transport")]
    Trailing(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Host {
    Ip(IpAddr),
    Dns { name: String, family: DnsFamily },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DnsFamily {
    Any,
    V4,
    V6,
}

impl DnsFamily {
    fn protocol(self) -> &'static str {
        match self {
            DnsFamily::Any => "dns",
            DnsFamily::V4 => "dns4",
            DnsFamily::V6 => "dns6",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Multiaddr {
    host: Host,
    port: u16,
    peer: Option<PeerId>,
}

impl Multiaddr {
    pub fn new(host: Host, port: u16) -> Self {
        Self {
            host,
            port,
            peer: None,
        }
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self::new(Host::Ip(addr.ip()), addr.port())
    }

    pub fn with_peer(mut self, peer: PeerId) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn without_peer(&self) -> Self {
        Self {
            host: self.host.clone(),
            port: self.port,
            peer: None,
        }
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn peer_id(&self) -> Option<PeerId> {
        self.peer
    }

    pub fn ip(&self) -> Option<IpAddr> {
        match &self.host {
            Host::Ip(ip) => Some(*ip),
            Host::Dns { .. } => None,
        }
    }

    /// Socket address for IP hosts; DNS hosts need [`Multiaddr::resolve`].
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        self.ip().map(|ip| SocketAddr::new(ip, self.port))
    }

    pub async fn resolve(&self) -> std::io::Result<Vec<SocketAddr>> {
        match &self.host {
            Host::Ip(ip) => Ok(vec![SocketAddr::new(*ip, self.port)]),
            Host::Dns { name, family } => {
                let addrs = tokio::net::lookup_host((name.as_str(), self.port)).await?;
                Ok(addrs
                    .filter(|a| match family {
                        DnsFamily::Any => true,
                        DnsFamily::V4 => a.is_ipv4(),
                        DnsFamily::V6 => a.is_ipv6(),
                    })
                    .collect())
            }
        }
    }

    /// Whether a remote peer on the public internet could plausibly dial this address.
    pub fn is_globally_routable(&self) -> bool {
        match &self.host {
            Host::Ip(ip) => is_global_ip(ip),
            Host::Dns { name, .. } => {
                let name = name.trim_end_matches('.').to_ascii_lowercase();
                name != "localhost" && !name.ends_with(".localhost") && !name.ends_with(".local")
            }
        }
    }
}

pub fn is_global_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_global_v4(v4),
        IpAddr::V6(v6) => is_global_v6(v6),
    }
}

fn is_global_v4(ip: &Ipv4Addr) -> bool {
    let [a, b, _, _] = ip.octets();
    !(ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_multicast()
        || ip.is_documentation()
        || a == 0
        // 100.64.0.0/10 carrier-grade NAT
        || (a == 100 && (b & 0xC0) == 64)
        // 198.18.0.0/15 benchmarking
        || (a == 198 && (b & 0xFE) == 18)
        // 240.0.0.0/4 reserved
        || a >= 240)
}

fn is_global_v6(ip: &Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_global_v4(&v4);
    }
    let first = ip.segments()[0];
    !(ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        // fc00::/7 unique local
        || (first & 0xFE00) == 0xFC00
        // fe80::/10 link local
        || (first & 0xFFC0) == 0xFE80
        // 2001:db8::/32 documentation
        || (first == 0x2001 && ip.segments()[1] == 0x0DB8))
}

impl fmt::Display for Multiaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Host::Ip(IpAddr::V4(ip)) => write!(f, "/ip4/{ip}")?,
            Host::Ip(IpAddr::V6(ip)) => write!(f, "/ip6/{ip}")?,
            Host::Dns { name, family } => write!(f, "/{}/{name}", family.protocol())?,
        }
        write!(f, "/tcp/{}", self.port)?;
        if let Some(peer) = &self.peer {
            write!(f, "/p2p/{peer}")?;
        }
        Ok(())
    }
}

impl FromStr for Multiaddr {
    type Err = MultiaddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() > MAX_MULTIADDR_LEN {
            return Err(MultiaddrError::TooLong);
        }
        let rest = s.strip_prefix('/').ok_or(MultiaddrError::MissingLeadingSlash)?;
        let mut parts = rest.split('/').filter(|p| !p.is_empty());

        let mut host = None;
        let mut port = None;
        let mut peer = None;

        while let Some(proto) = parts.next() {
            match proto {
                "ip4" => {
                    let value = parts.next().ok_or(MultiaddrError::MissingValue("ip4"))?;
                    let ip: Ipv4Addr = value.parse().map_err(|_| MultiaddrError::InvalidValue {
                        proto: "ip4",
                        value: value.to_string(),
                    })?;
                    host = Some(Host::Ip(IpAddr::V4(ip)));
                }
                "ip6" => {
                    let value = parts.next().ok_or(MultiaddrError::MissingValue("ip6"))?;
                    let ip: Ipv6Addr = value.parse().map_err(|_| MultiaddrError::InvalidValue {
                        proto: "ip6",
                        value: value.to_string(),
                    })?;
                    host = Some(Host::Ip(IpAddr::V6(ip)));
                }
                "dns" | "dns4" | "dns6" => {
                    let family = match proto {
                        "dns4" => DnsFamily::V4,
                        "dns6" => DnsFamily::V6,
                        _ => DnsFamily::Any,
                    };
                    let value = parts
                        .next()
                        .ok_or(MultiaddrError::MissingValue(family.protocol()))?;
                    host = Some(Host::Dns {
                        name: value.to_string(),
                        family,
                    });
                }
                "tcp" => {
                    if host.is_none() {
                        return Err(MultiaddrError::MissingHost);
                    }
                    let value = parts.next().ok_or(MultiaddrError::MissingValue("tcp"))?;
                    port = Some(value.parse::<u16>().map_err(|_| MultiaddrError::InvalidValue {
                        proto: "tcp",
                        value: value.to_string(),
                    })?);
                }
                "p2p" => {
                    let value = parts.next().ok_or(MultiaddrError::MissingValue("p2p"))?;
                    peer = Some(PeerId::from_hex(value).map_err(|_| {
                        MultiaddrError::InvalidValue {
                            proto: "p2p",
                            value: value.to_string(),
                        }
                    })?);
                    if let Some(extra) = parts.next() {
                        return Err(MultiaddrError::Trailing(extra.to_string()));
                    }
                }
                other => return Err(MultiaddrError::UnknownProtocol(other.to_string())),
            }
        }

        let host = host.ok_or(MultiaddrError::MissingHost)?;
        let port = port.ok_or(MultiaddrError::MissingTransport)?;
        Ok(Self { host, port, peer })
    }
}

impl Serialize for Multiaddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Multiaddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parses_and_displays_ip4() {
        let addr: Multiaddr = "/ip4/203.0.114.7/tcp/4001".parse().unwrap();
        assert_eq!(addr.port(), 4001);
        assert_eq!(addr.ip(), Some("203.0.114.7".parse().unwrap()));
        assert_eq!(addr.to_string(), "/ip4/203.0.114.7/tcp/4001");
        assert_eq!(addr.to_socket_addr(), Some("203.0.114.7:4001".parse().unwrap()));
    }

    #[test]
    fn parses_ip6_dns_and_peer_suffix() {
        let addr: Multiaddr = "/ip6/::1/tcp/9000".parse().unwrap();
        assert_eq!(addr.to_string(), "/ip6/::1/tcp/9000");

        let dns: Multiaddr = "/dns4/boot.example.org/tcp/4001".parse().unwrap();
        assert!(dns.to_socket_addr().is_none());
        assert_eq!(dns.to_string(), "/dns4/boot.example.org/tcp/4001");

        let peer = PeerId::from_bytes([0xAB; 32]);
        let text = format!("/ip4/8.8.4.4/tcp/4001/p2p/{peer}");
        let with_peer: Multiaddr = text.parse().unwrap();
        assert_eq!(with_peer.peer_id(), Some(peer));
        assert_eq!(with_peer.to_string(), text);
        assert_eq!(with_peer.without_peer().to_string(), "/ip4/8.8.4.4/tcp/4001");
    }

    #[test]
    fn rejects_malformed_input() {
        assert_eq!(
            "ip4/1.2.3.4/tcp/1".parse::<Multiaddr>(),
            Err(MultiaddrError::MissingLeadingSlash)
        );
        assert_eq!(
            "/ip4/1.2.3.4".parse::<Multiaddr>(),
            Err(MultiaddrError::MissingTransport)
        );
        assert_eq!(
            "/tcp/80".parse::<Multiaddr>(),
            Err(MultiaddrError::MissingHost)
        );
        assert!(matches!(
            "/ip4/999.1.1.1/tcp/80".parse::<Multiaddr>(),
            Err(MultiaddrError::InvalidValue { proto: "ip4", .. })
        ));
        assert!(matches!(
            "/ip4/1.1.1.1/tcp/70000".parse::<Multiaddr>(),
            Err(MultiaddrError::InvalidValue { proto: "tcp", .. })
        ));
        assert!(matches!(
            "/ip4/1.1.1.1/udp/53".parse::<Multiaddr>(),
            Err(MultiaddrError::UnknownProtocol(_))
        ));
        assert!(matches!(
            "/ip4/1.1.1.1/tcp".parse::<Multiaddr>(),
            Err(MultiaddrError::MissingValue("tcp"))
        ));
    }

    #[test]
    fn private_ranges_are_not_routable() {
        for text in [
            "/ip4/127.0.0.1/tcp/1",
            "/ip4/10.1.2.3/tcp/1",
            "/ip4/172.16.5.4/tcp/1",
            "/ip4/192.168.0.1/tcp/1",
            "/ip4/169.254.1.1/tcp/1",
            "/ip4/100.64.0.1/tcp/1",
            "/ip4/0.0.0.0/tcp/1",
            "/ip6/::1/tcp/1",
            "/ip6/fd00::1/tcp/1",
            "/ip6/fe80::1/tcp/1",
            "/ip6/::ffff:192.168.1.1/tcp/1",
            "/ip4/224.0.0.251/tcp/1",
            "/ip4/239.255.255.250/tcp/1",
            "/ip6/ff02::1/tcp/1",
            "/ip6/ff0e::101/tcp/1",
            "/dns4/localhost/tcp/1",
        ] {
            let addr: Multiaddr = text.parse().unwrap();
            assert!(!addr.is_globally_routable(), "{text} should be filtered");
        }
        for text in [
            "/ip4/8.8.8.8/tcp/1",
            "/ip4/1.1.1.1/tcp/1",
            "/ip6/2606:4700::1111/tcp/1",
            "/dns4/boot.example.org/tcp/1",
        ] {
            let addr: Multiaddr = text.parse().unwrap();
            assert!(addr.is_globally_routable(), "{text} should be routable");
        }
    }

    #[test]
    fn serde_uses_text_form() {
        let addr: Multiaddr = "/ip4/8.8.8.8/tcp/4001".parse().unwrap();
        let bytes = bincode::serialize(&addr).unwrap();
        let decoded: Multiaddr = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, addr);
    }

    proptest! {
        #[test]
        fn ip4_display_parses_back(a: u8, b: u8, c: u8, d: u8, port: u16) {
            let text = format!("/ip4/{a}.{b}.{c}.{d}/tcp/{port}");
            let addr: Multiaddr = text.parse().unwrap();
            prop_assert_eq!(addr.to_string(), text);
        }

        #[test]
        fn rfc1918_never_routable(b: u8, c: u8, d: u8, port: u16) {
            let addr: Multiaddr = format!("/ip4/10.{b}.{c}.{d}/tcp/{port}").parse().unwrap();
            prop_assert!(!addr.is_globally_routable());
            let addr: Multiaddr = format!("/ip4/192.168.{c}.{d}/tcp/{port}").parse().unwrap();
            prop_assert!(!addr.is_globally_routable());
        }
    }
}
