//! Per-server configuration
//!
//! One `[[servers]]` table per listening endpoint.

use super::TcpConfig;
use crate::helper::{
    duration_from_secs, DEFAULT_DIAL_TIMEOUT_SECS, DEFAULT_HANDSHAKE_TIMEOUT_SECS,
    DEFAULT_UDP_IDLE_TIMEOUT_SECS,
};
use crate::transport::{Destination, Network};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Wire protocol a server speaks
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// SOCKS5 (RFC 1928, CONNECT only)
    #[serde(rename = "socks5")]
    Socks5,
    /// HTTP proxy: CONNECT tunnels and absolute-URI requests
    #[serde(rename = "http")]
    Http,
    /// Fixed port to fixed destination, protocol agnostic
    #[serde(rename = "forward")]
    Forward,
}

/// Transport a server listens on
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ListenNetwork {
    /// TCP
    #[default]
    #[serde(rename = "tcp")]
    Tcp,
    /// UDP (forward servers only)
    #[serde(rename = "udp")]
    Udp,
}

impl From<ListenNetwork> for Network {
    fn from(network: ListenNetwork) -> Self {
        match network {
            ListenNetwork::Tcp => Network::Tcp,
            ListenNetwork::Udp => Network::Udp,
        }
    }
}

fn default_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_dial_timeout() -> u64 {
    DEFAULT_DIAL_TIMEOUT_SECS
}

fn default_handshake_timeout() -> u64 {
    DEFAULT_HANDSHAKE_TIMEOUT_SECS
}

fn default_udp_idle_timeout() -> u64 {
    DEFAULT_UDP_IDLE_TIMEOUT_SECS
}

/// Queued dispatch settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Number of worker tasks driving queued connections
    pub workers: usize,
    /// Connections accepted but not yet picked up by a worker
    pub queue: usize,
}

/// Configuration of one listening server
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    /// Name used in logs
    pub name: String,

    /// Wire protocol
    pub protocol: Protocol,

    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: IpAddr,

    /// Listening port
    pub port: u16,

    /// Listening transport (`udp` only valid for forward servers)
    #[serde(default)]
    pub network: ListenNetwork,

    /// Fixed destination `host:port` for forward servers
    #[serde(default)]
    pub forward_to: Option<String>,

    /// Require credentials from the user table
    #[serde(default)]
    pub auth: bool,

    /// Outbound dial timeout in seconds
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,

    /// Time a client gets to finish its SOCKS5 handshake or HTTP request
    /// head, in seconds
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    /// Idle timeout of forwarded UDP sessions in seconds
    #[serde(default = "default_udp_idle_timeout")]
    pub udp_idle_timeout_secs: u64,

    /// Queued dispatch; absent means every connection runs inline
    #[serde(default)]
    pub dispatch: Option<DispatchConfig>,

    /// Socket tuning
    #[serde(default)]
    pub tcp: TcpConfig,
}

impl ServerConfig {
    /// Create a server config with defaults for everything but the essentials
    pub fn new(name: &str, protocol: Protocol, bind: IpAddr, port: u16) -> Self {
        ServerConfig {
            name: name.to_string(),
            protocol,
            bind,
            port,
            network: ListenNetwork::default(),
            forward_to: None,
            auth: false,
            dial_timeout_secs: default_dial_timeout(),
            handshake_timeout_secs: default_handshake_timeout(),
            udp_idle_timeout_secs: default_udp_idle_timeout(),
            dispatch: None,
            tcp: TcpConfig::default(),
        }
    }

    /// Address to bind
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    /// Dial timeout as a duration
    pub fn dial_timeout(&self) -> Duration {
        duration_from_secs(self.dial_timeout_secs)
    }

    /// Handshake timeout as a duration
    pub fn handshake_timeout(&self) -> Duration {
        duration_from_secs(self.handshake_timeout_secs)
    }

    /// UDP idle timeout as a duration
    pub fn udp_idle_timeout(&self) -> Duration {
        duration_from_secs(self.udp_idle_timeout_secs)
    }

    /// Parsed fixed destination of a forward server
    pub fn forward_destination(&self) -> Option<Destination> {
        self.forward_to
            .as_deref()
            .and_then(|target| Destination::parse(self.network.into(), target))
    }

    /// Validate the server on its own
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("Server name must not be empty".to_string());
        }
        match self.protocol {
            Protocol::Forward => {
                let target = self
                    .forward_to
                    .as_deref()
                    .ok_or_else(|| format!("Server '{}': forward requires forward_to", self.name))?;
                if self.forward_destination().is_none() {
                    return Err(format!(
                        "Server '{}': invalid forward_to '{}'",
                        self.name, target
                    ));
                }
            }
            Protocol::Socks5 | Protocol::Http => {
                if self.network == ListenNetwork::Udp {
                    return Err(format!(
                        "Server '{}': only forward servers may listen on udp",
                        self.name
                    ));
                }
            }
        }
        if self.handshake_timeout_secs == 0 {
            return Err(format!(
                "Server '{}': handshake_timeout_secs must be positive",
                self.name
            ));
        }
        if let Some(dispatch) = &self.dispatch {
            if dispatch.workers == 0 || dispatch.queue == 0 {
                return Err(format!(
                    "Server '{}': dispatch workers and queue must be positive",
                    self.name
                ));
            }
        }
        Ok(())
    }
}
