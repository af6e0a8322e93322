//! Transport module for Switchyard
//!
//! Shared stream plumbing: the dynamic stream trait every listener hands to
//! the pipeline, socket tuning, a stream wrapper that replays bytes already
//! consumed by a protocol parser, and the relay engine.

pub mod addr;
mod prefixed;
pub mod relay;

pub use addr::{Address, Destination, Network};
pub use prefixed::PrefixedStream;
pub use relay::{BenignKind, ErrorClass, RelayError, RelayStats, Tunnel};

use crate::config::TcpConfig;
use std::fmt::Debug;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Socket options for accepted and dialed TCP streams
#[derive(Debug, Clone)]
pub struct SocketOpts {
    /// Enable TCP_NODELAY
    pub nodelay: bool,
    /// TCP keepalive timeout
    pub keepalive_secs: Option<u64>,
    /// TCP keepalive interval
    pub keepalive_interval: Option<u64>,
}

impl Default for SocketOpts {
    fn default() -> Self {
        SocketOpts {
            nodelay: true,
            keepalive_secs: Some(20),
            keepalive_interval: Some(8),
        }
    }
}

impl SocketOpts {
    /// Create socket options from TCP config
    pub fn from_tcp_config(config: &TcpConfig) -> Self {
        SocketOpts {
            nodelay: config.nodelay,
            keepalive_secs: Some(config.keepalive_secs),
            keepalive_interval: Some(config.keepalive_interval),
        }
    }

    /// Apply socket options to a TCP stream
    pub fn apply(&self, stream: &TcpStream) -> std::io::Result<()> {
        stream.set_nodelay(self.nodelay)?;

        if let (Some(timeout), Some(interval)) = (self.keepalive_secs, self.keepalive_interval) {
            let socket = socket2::SockRef::from(stream);
            let keepalive = socket2::TcpKeepalive::new()
                .with_time(Duration::from_secs(timeout))
                .with_interval(Duration::from_secs(interval));
            socket.set_tcp_keepalive(&keepalive)?;
        }

        Ok(())
    }

    /// Apply, logging instead of failing; tuning is never fatal to a connection
    pub fn hint(&self, stream: &TcpStream) {
        if let Err(e) = self.apply(stream) {
            tracing::warn!("Failed to apply socket options: {}", e);
        }
    }
}

/// Dynamic stream trait for boxed streams.
///
/// Lets the pipeline carry TCP sockets, hijacked HTTP connections and test
/// duplex pipes without being generic over them.
pub trait StreamDyn: AsyncRead + AsyncWrite + Unpin + Send + Debug {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Debug> StreamDyn for T {}

/// Close a stream: attempt an immediate shutdown, then drop.
///
/// The shutdown gets no grace period so a stalled peer cannot hold the
/// caller; consuming the stream makes a second close impossible.
pub async fn close_stream<S>(mut stream: S)
where
    S: AsyncWrite + Unpin,
{
    let _ = tokio::time::timeout(Duration::ZERO, stream.shutdown()).await;
    drop(stream);
}
