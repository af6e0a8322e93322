//! Outbound connectors
//!
//! A connector dials the routed destination and reports the dial result to
//! the connection's reply sink. What is left of the connection after a
//! successful dial comes back as a [`Session`] the caller runs on its own.

mod http;
mod reject;
mod tcp;
mod udp;

pub use http::HttpConnector;
pub use reject::RejectConnector;
pub use tcp::TcpConnector;
pub use udp::UdpConnector;

use crate::director::ConnContext;
use crate::error::Result;
use crate::listener::{Connection, Inbound, ReplySink};
use crate::transport::Network;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::fmt::Debug;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;

/// Relay half of a dialed connection
pub type Session = BoxFuture<'static, Result<()>>;

/// Session with nothing left to serve
pub fn finished() -> Session {
    Box::pin(futures::future::ready(Ok(())))
}

/// Strategy for establishing and serving an outbound connection
#[async_trait]
pub trait Connector: Send + Sync + Debug {
    /// Name for logs
    fn name(&self) -> &'static str;

    /// Dial `conn.destination` and report the outcome to `sink`. On success
    /// the returned session serves the connection until it ends.
    async fn dial(
        &self,
        ctx: &ConnContext,
        conn: Connection,
        sink: &mut dyn ReplySink,
    ) -> Result<Session>;

    /// Dial, then serve the connection until it ends
    async fn dial_serve(
        &self,
        ctx: &ConnContext,
        conn: Connection,
        sink: &mut dyn ReplySink,
    ) -> Result<()> {
        self.dial(ctx, conn, sink).await?.await
    }
}

/// Picks the connector for a routed connection
#[derive(Debug, Clone, Default)]
pub struct ConnectorSelector {
    tcp: Option<Arc<dyn Connector>>,
    udp: Option<Arc<dyn Connector>>,
    http: Option<Arc<dyn Connector>>,
}

impl ConnectorSelector {
    /// Empty selector
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector for TCP streams
    pub fn tcp(mut self, connector: Arc<dyn Connector>) -> Self {
        self.tcp = Some(connector);
        self
    }

    /// Connector for UDP sessions
    pub fn udp(mut self, connector: Arc<dyn Connector>) -> Self {
        self.udp = Some(connector);
        self
    }

    /// Connector for plain HTTP requests
    pub fn http(mut self, connector: Arc<dyn Connector>) -> Self {
        self.http = Some(connector);
        self
    }

    /// Whether some connector serves `network`
    pub fn covers(&self, network: Network) -> bool {
        match network {
            Network::Tcp => self.tcp.is_some() || self.http.is_some(),
            Network::Udp => self.udp.is_some(),
            Network::Unset => false,
        }
    }

    /// Connector for `conn`, keyed on destination network and inbound kind
    pub fn select(&self, conn: &Connection) -> Option<Arc<dyn Connector>> {
        match (&conn.inbound, conn.destination.network) {
            (Inbound::Http(_), _) => self.http.clone(),
            (_, Network::Tcp) => self.tcp.clone(),
            (_, Network::Udp) => self.udp.clone(),
            (_, Network::Unset) => None,
        }
    }
}

/// TCP connect bounded by `timeout`
pub(crate) async fn dial_tcp(addr: SocketAddr, timeout: Duration) -> io::Result<TcpStream> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("dial {} timed out after {:?}", addr, timeout),
        )),
    }
}
