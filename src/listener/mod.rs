//! Protocol listeners
//!
//! A listener owns a bound socket, runs the accept loop, performs its
//! protocol handshake on a task per client and hands the resulting
//! [`Connection`] to a [`ConnectionHandler`] together with a [`ReplySink`]
//! that knows how to answer the client at the two pipeline phases that need
//! a protocol-specific reply.

pub mod forward;
pub mod http;
pub mod socks;

pub use forward::{ForwardTcpListener, ForwardUdpListener, UdpSession};
pub use http::{HttpExchange, HttpListener};
pub use socks::SocksListener;

use crate::ruleset::Outcome;
use crate::transport::{close_stream, Destination, Network, SocketOpts, StreamDyn};
use async_trait::async_trait;
use std::fmt::{self, Debug};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// What the listener hands over with a connection
pub enum Inbound {
    /// Raw byte stream: SOCKS5 after the handshake, HTTP CONNECT, TCP forward
    Stream(Box<dyn StreamDyn>),
    /// One plain HTTP proxy request awaiting its response
    Http(HttpExchange),
    /// Datagrams from one UDP client
    Datagram(UdpSession),
}

impl Inbound {
    /// Short kind name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Inbound::Stream(_) => "stream",
            Inbound::Http(_) => "http",
            Inbound::Datagram(_) => "datagram",
        }
    }
}

impl Debug for Inbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Inbound::{}", self.kind())
    }
}

/// Admission slot held from before accept until the dial outcome is known
#[derive(Debug, Default)]
pub struct Reservation(Option<OwnedSemaphorePermit>);

impl Reservation {
    /// A slot backed by a semaphore permit
    pub fn new(permit: OwnedSemaphorePermit) -> Self {
        Reservation(Some(permit))
    }

    /// Whether this slot counts against a limit
    pub fn is_limited(&self) -> bool {
        self.0.is_some()
    }
}

/// Inbound connection descriptor
#[derive(Debug)]
pub struct Connection {
    /// Transport the client used
    pub network: Network,
    /// Client address
    pub source: SocketAddr,
    /// Destination, unset until the listener or router fills it in
    pub destination: Destination,
    /// Client side of the connection
    pub inbound: Inbound,
    reservation: Reservation,
}

impl Connection {
    /// Describe a freshly handshaken connection
    pub fn new(
        network: Network,
        source: SocketAddr,
        destination: Destination,
        inbound: Inbound,
    ) -> Self {
        Connection {
            network,
            source,
            destination,
            inbound,
            reservation: Reservation::default(),
        }
    }

    /// Attach the admission slot taken before accept
    pub fn with_reservation(mut self, reservation: Reservation) -> Self {
        self.reservation = reservation;
        self
    }

    /// Whether the connection holds a limited admission slot
    pub fn is_reserved(&self) -> bool {
        self.reservation.is_limited()
    }

    /// Detach the admission slot, leaving an unlimited one behind
    pub fn take_reservation(&mut self) -> Reservation {
        std::mem::take(&mut self.reservation)
    }

    /// Close the client side. Dropping the connection also closes it.
    pub async fn close(self) {
        if let Inbound::Stream(stream) = self.inbound {
            close_stream(stream).await;
        }
    }
}

/// Dial result reported to a [`ReplySink`]: the local address of the
/// outbound socket on success, when there is one.
pub type DialOutcome<'a> = Result<Option<SocketAddr>, &'a io::Error>;

/// Protocol-specific replies fired by the pipeline.
///
/// The pipeline itself never writes protocol bytes; it calls the sink after
/// the ruleset has decided and after the outbound dial has finished, and the
/// sink answers the client through the connection's inbound side.
#[async_trait]
pub trait ReplySink: Send {
    /// Called once the ruleset has decided
    async fn on_ruleset_decision(&mut self, inbound: &mut Inbound, outcome: &Outcome)
        -> io::Result<()>;

    /// Called once the dial has succeeded or failed
    async fn on_dial_outcome(
        &mut self,
        inbound: &mut Inbound,
        outcome: DialOutcome<'_>,
    ) -> io::Result<()>;
}

/// Sink for protocols with nothing to say (raw forwarding)
#[derive(Debug, Default, Clone, Copy)]
pub struct NoReply;

#[async_trait]
impl ReplySink for NoReply {
    async fn on_ruleset_decision(&mut self, _: &mut Inbound, _: &Outcome) -> io::Result<()> {
        Ok(())
    }

    async fn on_dial_outcome(&mut self, _: &mut Inbound, _: DialOutcome<'_>) -> io::Result<()> {
        Ok(())
    }
}

/// Consumer of handshaken connections
#[async_trait]
pub trait ConnectionHandler: Send + Sync {
    /// Wait for an admission slot before accepting another client
    async fn reserve(&self) -> Reservation {
        Reservation::default()
    }

    /// Drive one connection; `ctx` is the server-wide token
    async fn handle(&self, ctx: &CancellationToken, conn: Connection, sink: Box<dyn ReplySink>);
}

/// Accept loop for one wire protocol
#[async_trait]
pub trait Listener: Send + Sync + Debug {
    /// Protocol name for logs
    fn protocol(&self) -> &'static str;

    /// Bound address
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Accept clients until `ctx` is cancelled or accepting fails
    async fn serve(
        &self,
        ctx: CancellationToken,
        handler: Arc<dyn ConnectionHandler>,
    ) -> crate::error::Result<()>;
}

/// Shared TCP accept loop.
///
/// Takes an admission slot from the handler before every accept, tunes the
/// accepted socket and spawns `client` for it. Returns when `ctx` is
/// cancelled; transient accept errors are logged and skipped.
pub(crate) async fn accept_loop<F, Fut>(
    listener: &TcpListener,
    opts: &SocketOpts,
    ctx: CancellationToken,
    handler: Arc<dyn ConnectionHandler>,
    client: F,
) -> crate::error::Result<()>
where
    F: Fn(TcpStream, SocketAddr, Reservation) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    loop {
        let reservation = tokio::select! {
            _ = ctx.cancelled() => break,
            reservation = handler.reserve() => reservation,
        };

        let accepted = tokio::select! {
            _ = ctx.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                debug!("Accepted connection from {}", peer);
                opts.hint(&stream);
                tokio::spawn(client(stream, peer, reservation));
            }
            Err(e) if is_transient(&e) => {
                warn!("Failed to accept connection: {}", e);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Address;
    use std::sync::Arc;
    use tokio::io::{duplex, AsyncReadExt};
    use tokio::sync::Semaphore;

    fn source() -> SocketAddr {
        "192.168.1.10:40000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_connection_close_shuts_stream() {
        let (inbound, mut client) = duplex(64);
        let conn = Connection::new(
            Network::Tcp,
            source(),
            Destination::default(),
            Inbound::Stream(Box::new(inbound)),
        );
        assert_eq!(conn.inbound.kind(), "stream");
        conn.close().await;

        let mut buf = [0u8; 4];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reservation_released_with_connection() {
        let semaphore = Arc::new(Semaphore::new(1));
        let permit = semaphore.clone().acquire_owned().await.unwrap();
        let (inbound, _client) = duplex(64);

        let conn = Connection::new(
            Network::Tcp,
            source(),
            Destination::tcp(Address::parse("example.com"), 80),
            Inbound::Stream(Box::new(inbound)),
        )
        .with_reservation(Reservation::new(permit));
        assert!(conn.is_reserved());
        assert_eq!(semaphore.available_permits(), 0);

        drop(conn);
        assert_eq!(semaphore.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_take_reservation_detaches_slot() {
        let semaphore = Arc::new(Semaphore::new(1));
        let permit = semaphore.clone().acquire_owned().await.unwrap();
        let (inbound, _client) = duplex(64);
        let mut conn = Connection::new(
            Network::Tcp,
            source(),
            Destination::default(),
            Inbound::Stream(Box::new(inbound)),
        )
        .with_reservation(Reservation::new(permit));

        let slot = conn.take_reservation();
        assert!(!conn.is_reserved());
        drop(slot);
        assert_eq!(semaphore.available_permits(), 1);
        drop(conn);
    }

    #[tokio::test]
    async fn test_no_reply_is_silent() {
        let (inbound, mut client) = duplex(64);
        let mut inbound = Inbound::Stream(Box::new(inbound));
        let mut sink = NoReply;
        sink.on_ruleset_decision(&mut inbound, &Outcome::Deny("x".into()))
            .await
            .unwrap();
        let err = io::Error::from(io::ErrorKind::ConnectionRefused);
        sink.on_dial_outcome(&mut inbound, Err(&err)).await.unwrap();
        drop(inbound);

        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }
}
