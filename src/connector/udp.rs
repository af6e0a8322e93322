use super::{Connector, Session};
use crate::director::ConnContext;
use crate::error::{ProxyError, Result};
use crate::helper::MAX_DATAGRAM_SIZE;
use crate::listener::{Connection, Inbound, ReplySink, UdpSession};
use crate::transport::RelayError;
use async_trait::async_trait;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Relays datagrams of one UDP session to a fixed destination
#[derive(Debug, Clone)]
pub struct UdpConnector {
    idle_timeout: Duration,
}

impl UdpConnector {
    /// Create a connector ending sessions after `idle_timeout` without traffic
    pub fn new(idle_timeout: Duration) -> Self {
        UdpConnector { idle_timeout }
    }
}

async fn dial_udp(addr: SocketAddr) -> io::Result<UdpSocket> {
    let local = match addr.ip() {
        IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(addr).await?;
    Ok(socket)
}

/// ICMP errors reported on a connected socket. They describe an earlier
/// datagram, not the session.
fn is_unreachable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::HostUnreachable
            | io::ErrorKind::NetworkUnreachable
    )
}

#[async_trait]
impl Connector for UdpConnector {
    fn name(&self) -> &'static str {
        "udp"
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

        let outbound = match dial_udp(addr).await {
            Ok(socket) => socket,
            Err(e) => {
                sink.on_dial_outcome(&mut conn.inbound, Err(&e)).await?;
                return Err(ProxyError::Dial(e));
            }
        };
        sink.on_dial_outcome(&mut conn.inbound, Ok(outbound.local_addr().ok()))
            .await?;

        let kind = conn.inbound.kind();
        let Inbound::Datagram(session) = conn.inbound else {
            return Err(ProxyError::Protocol(format!(
                "udp connector cannot serve {} inbound",
                kind
            )));
        };
        Ok(Box::pin(relay_datagrams(
            session,
            outbound,
            addr,
            self.idle_timeout,
            ctx.cancel.clone(),
        )))
    }
}

async fn relay_datagrams(
    mut session: UdpSession,
    outbound: UdpSocket,
    addr: SocketAddr,
    idle_timeout: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let (mut sent, mut received) = (0u64, 0u64);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(idle_timeout) => {
                debug!("UDP session to {} idle, closing", addr);
                break;
            }
            datagram = session.recv() => {
                let Some(datagram) = datagram else { break };
                match outbound.send(&datagram).await {
                    Ok(_) => sent += 1,
                    Err(e) if is_unreachable(&e) => {
                        debug!("Dropped datagram to {}: {}", addr, e);
                    }
                    Err(e) => return Err(RelayError::new(e).into()),
                }
            }
            reply = outbound.recv(&mut buf) => match reply {
                Ok(n) => {
                    session.reply(&buf[..n]).await.map_err(RelayError::new)?;
                    received += 1;
                }
                Err(e) if is_unreachable(&e) => {
                    debug!("UDP destination {} unreachable: {}", addr, e);
                }
                Err(e) => return Err(RelayError::new(e).into()),
            },
        }
    }

    debug!(
        "UDP session to {} done: {} datagrams out, {} in",
        addr, sent, received
    );
    Ok(())
}
