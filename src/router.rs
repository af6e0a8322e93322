//! Destination routing
//!
//! Client protocols already carry a destination; forward servers ignore
//! whatever the client wanted and send everything to one fixed place.

use crate::director::ConnContext;
use crate::error::{ProxyError, Result};
use crate::listener::Connection;
use crate::transport::Destination;
use async_trait::async_trait;
use std::fmt::Debug;

/// Decides where an inbound connection goes
#[async_trait]
pub trait Router: Send + Sync + Debug {
    /// Fill in or check `conn.destination`
    async fn route(&self, ctx: &ConnContext, conn: Connection) -> Result<Connection>;
}

/// Keeps the destination the client asked for
#[derive(Debug, Default, Clone, Copy)]
pub struct ClientRouter;

#[async_trait]
impl Router for ClientRouter {
    async fn route(&self, _ctx: &ConnContext, conn: Connection) -> Result<Connection> {
        if !conn.destination.is_valid() {
            return Err(ProxyError::Routing(format!(
                "{} client from {} named no destination",
                conn.inbound.kind(),
                conn.source
            )));
        }
        Ok(conn)
    }
}

/// Sends every connection to one destination, on the connection's network
#[derive(Debug, Clone)]
pub struct ForwardRouter {
    destination: Destination,
}

impl ForwardRouter {
    /// Route everything to `destination`
    pub fn new(destination: Destination) -> Self {
        ForwardRouter { destination }
    }
}

#[async_trait]
impl Router for ForwardRouter {
    async fn route(&self, _ctx: &ConnContext, mut conn: Connection) -> Result<Connection> {
        let mut destination = self.destination.clone();
        destination.network = conn.network;
        if !destination.is_valid() {
            return Err(ProxyError::Routing(format!(
                "cannot forward {} connection from {}",
                conn.network, conn.source
            )));
        }
        conn.destination = destination;
        Ok(conn)
    }
}
