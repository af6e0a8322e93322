use super::{dial_tcp, finished, Connector, Session};
use crate::director::ConnContext;
use crate::error::{ProxyError, Result};
use crate::listener::{Connection, Inbound, ReplySink};
use crate::transport::{SocketOpts, StreamDyn, Tunnel};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Direct TCP dial followed by a byte relay
#[derive(Debug, Clone)]
pub struct TcpConnector {
    dial_timeout: Duration,
    opts: SocketOpts,
}

impl TcpConnector {
    /// Create a connector with the given dial timeout and socket tuning
    pub fn new(dial_timeout: Duration, opts: SocketOpts) -> Self {
        TcpConnector { dial_timeout, opts }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn dial(
        &self,
        ctx: &ConnContext,
        mut conn: Connection,
        sink: &mut dyn ReplySink,
    ) -> Result<Session> {
        let addr = conn.destination.socket_addr().ok_or_else(|| {
            ProxyError::Routing(format!("{} is not resolved", conn.destination))
        })?;

        let dialed = tokio::select! {
            dialed = dial_tcp(addr, self.dial_timeout) => dialed,
            _ = ctx.cancel.cancelled() => return Ok(finished()),
        };
        let outbound = match dialed {
            Ok(stream) => stream,
            Err(e) => {
                debug!("Dial {} failed: {}", addr, e);
                sink.on_dial_outcome(&mut conn.inbound, Err(&e)).await?;
                return Err(ProxyError::Dial(e));
            }
        };

        self.opts.hint(&outbound);
        let local = outbound.local_addr().ok();
        sink.on_dial_outcome(&mut conn.inbound, Ok(local)).await?;

        let kind = conn.inbound.kind();
        let Inbound::Stream(inbound) = conn.inbound else {
            return Err(ProxyError::Protocol(format!(
                "tcp connector cannot serve {} inbound",
                kind
            )));
        };
        Ok(Box::pin(relay(inbound, outbound, ctx.cancel.clone(), addr)))
    }
}

async fn relay(
    inbound: Box<dyn StreamDyn>,
    outbound: TcpStream,
    cancel: CancellationToken,
    addr: SocketAddr,
) -> Result<()> {
    info!("Relaying to {}", addr);
    let mut tunnel = Tunnel::new(inbound, &cancel);
    let stats = tunnel.connect(outbound).await?;
    debug!(
        "Relay to {} done: {} bytes up, {} bytes down",
        addr, stats.uploaded, stats.downloaded
    );
    Ok(())
}
