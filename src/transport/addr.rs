//! Network endpoint value types
//!
//! `Address` is an IP or a domain name, `Destination` adds the transport and
//! port. Destinations start out as whatever the client asked for and are
//! rewritten in place once the resolver has produced an IP.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

/// Network-layer address: raw IP or domain name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// IPv4 literal
    Ipv4(Ipv4Addr),
    /// IPv6 literal
    Ipv6(Ipv6Addr),
    /// Domain name, compared case-sensitively
    Domain(String),
}

impl Address {
    /// Parse a host string; IP literals become IP variants, anything else a domain.
    ///
    /// Square brackets around IPv6 literals are accepted.
    pub fn parse(host: &str) -> Self {
        let trimmed = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        match IpAddr::from_str(trimmed) {
            Ok(ip) => Address::from(ip),
            Err(_) => Address::Domain(host.to_string()),
        }
    }

    /// The address as an IP, if it is one
    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            Address::Ipv4(ip) => Some(IpAddr::V4(*ip)),
            Address::Ipv6(ip) => Some(IpAddr::V6(*ip)),
            Address::Domain(_) => None,
        }
    }

    /// Whether this is a domain name
    pub fn is_domain(&self) -> bool {
        matches!(self, Address::Domain(_))
    }
}

impl From<IpAddr> for Address {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => Address::Ipv4(v4),
            IpAddr::V6(v6) => Address::Ipv6(v6),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ipv4(ip) => write!(f, "{}", ip),
            Address::Ipv6(ip) => write!(f, "{}", ip),
            Address::Domain(name) => write!(f, "{}", name),
        }
    }
}

/// Transport of a destination
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Network {
    /// Not yet determined
    #[default]
    Unset,
    /// TCP stream
    Tcp,
    /// UDP datagrams
    Udp,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Unset => write!(f, "unset"),
            Network::Tcp => write!(f, "tcp"),
            Network::Udp => write!(f, "udp"),
        }
    }
}

/// Where a connection is headed
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    /// Transport
    pub network: Network,
    /// Host
    pub address: Address,
    /// Port
    pub port: u16,
}

impl Default for Destination {
    fn default() -> Self {
        Destination {
            network: Network::Unset,
            address: Address::Ipv4(Ipv4Addr::UNSPECIFIED),
            port: 0,
        }
    }
}

impl Destination {
    /// Create a destination
    pub fn new(network: Network, address: Address, port: u16) -> Self {
        Destination {
            network,
            address,
            port,
        }
    }

    /// Create a TCP destination
    pub fn tcp(address: Address, port: u16) -> Self {
        Destination::new(Network::Tcp, address, port)
    }

    /// Create a UDP destination
    pub fn udp(address: Address, port: u16) -> Self {
        Destination::new(Network::Udp, address, port)
    }

    /// Parse `host:port` (IPv6 hosts in brackets) for the given network
    pub fn parse(network: Network, host_port: &str) -> Option<Self> {
        let (host, port) = split_host_port(host_port)?;
        Some(Destination::new(network, Address::parse(host), port))
    }

    /// False only while the network is still unset
    pub fn is_valid(&self) -> bool {
        self.network != Network::Unset
    }

    /// Replace the address with a resolved IP, keeping network and port
    pub fn set_resolved(&mut self, ip: IpAddr) {
        self.address = Address::from(ip);
    }

    /// Socket address, available once the address is an IP
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.address.ip().map(|ip| SocketAddr::new(ip, self.port))
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.address {
            Address::Ipv6(ip) => write!(f, "{}:[{}]:{}", self.network, ip, self.port),
            other => write!(f, "{}:{}:{}", self.network, other, self.port),
        }
    }
}

/// Split `host:port`, accepting `[v6]:port`
pub fn split_host_port(host_port: &str) -> Option<(&str, u16)> {
    if let Some(rest) = host_port.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = tail.strip_prefix(':')?.parse().ok()?;
        return Some((host, port));
    }
    let (host, port) = host_port.rsplit_once(':')?;
    if host.is_empty() || host.contains(':') {
        return None;
    }
    Some((host, port.parse().ok()?))
}
