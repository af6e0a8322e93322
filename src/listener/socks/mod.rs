//! SOCKS5 listener
//!
//! Handshake states run strictly in order on the client's task:
//! method negotiation, optional username/password, request. Only CONNECT is
//! served; BIND and UDP ASSOCIATE get `CommandNotSupported` and the
//! connection is closed. A parsed CONNECT becomes a stream [`Connection`]
//! whose [`SocksReplySink`] writes the final reply once the pipeline knows
//! the ruleset decision and the dial outcome.

mod auth;
mod consts;
mod reply;
mod request;

pub use auth::AuthMethod;
pub use reply::{decode_reply, encode_reply};

use super::{accept_loop, Connection, ConnectionHandler, DialOutcome, Inbound, Listener, ReplySink};
use crate::auth::Authenticator;
use crate::config::ServerConfig;
use crate::error::{ProxyError, Result, Socks5ReplyCode};
use crate::ruleset::Outcome;
use crate::transport::{close_stream, Address, Destination, Network, SocketOpts};
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Accepts SOCKS5 clients
#[derive(Debug)]
pub struct SocksListener {
    listener: TcpListener,
    opts: SocketOpts,
    handshake_timeout: Duration,
    authenticator: Option<Arc<dyn Authenticator>>,
}

impl SocksListener {
    /// Bind the server's listening address; `authenticator` enables
    /// username/password authentication
    pub async fn bind(
        config: &ServerConfig,
        authenticator: Option<Arc<dyn Authenticator>>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(config.listen_addr()).await?;
        Ok(SocksListener {
            listener,
            opts: SocketOpts::from_tcp_config(&config.tcp),
            handshake_timeout: config.handshake_timeout(),
            authenticator,
        })
    }
}

#[async_trait]
impl Listener for SocksListener {
    fn protocol(&self) -> &'static str {
        "socks5"
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    async fn serve(&self, ctx: CancellationToken, handler: Arc<dyn ConnectionHandler>) -> Result<()> {
        info!("SOCKS5 listening on {}", self.listener.local_addr()?);
        accept_loop(
            &self.listener,
            &self.opts,
            ctx.clone(),
            handler.clone(),
            |mut stream, peer, reservation| {
                let ctx = ctx.clone();
                let handler = handler.clone();
                let authenticator = self.authenticator.clone();
                let limit = self.handshake_timeout;
                async move {
                    let negotiated = tokio::time::timeout(
                        limit,
                        handshake(&mut stream, peer, authenticator.as_deref()),
                    )
                    .await
                    .unwrap_or_else(|_| {
                        Err(ProxyError::Protocol(format!(
                            "handshake not finished within {:?}",
                            limit
                        )))
                    });
                    match negotiated {
                        Ok(destination) => {
                            let conn = Connection::new(
                                Network::Tcp,
                                peer,
                                destination,
                                Inbound::Stream(Box::new(stream)),
                            )
                            .with_reservation(reservation);
                            handler.handle(&ctx, conn, Box::new(SocksReplySink)).await;
                        }
                        Err(e) => {
                            debug!("SOCKS5 handshake with {} failed: {}", peer, e);
                            close_stream(stream).await;
                        }
                    }
                }
            },
        )
        .await
    }
}

/// Run the handshake up to a parsed CONNECT request.
///
/// Requests that are well formed but unsupported are answered here; the
/// returned error only tells the caller to close.
pub async fn handshake<S>(
    stream: &mut S,
    peer: SocketAddr,
    authenticator: Option<&dyn Authenticator>,
) -> Result<Destination>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let method = auth::negotiate(stream, Address::from(peer.ip()), authenticator).await?;
    debug!("Authentication completed with method: {:?}", method);

    match request::read_request(stream).await? {
        Ok((command, address, port)) => {
            let destination = Destination::tcp(address, port);
            info!("SOCKS5 {} request to {}", command, destination);
            Ok(destination)
        }
        Err(rejection) => {
            reply::send_reply(stream, rejection.code, None).await?;
            Err(rejection.error)
        }
    }
}

/// Writes the SOCKS5 reply for the pipeline's decisions
#[derive(Debug, Default, Clone, Copy)]
pub struct SocksReplySink;

#[async_trait]
impl ReplySink for SocksReplySink {
    async fn on_ruleset_decision(&mut self, inbound: &mut Inbound, outcome: &Outcome) -> io::Result<()> {
        let (Outcome::Deny(_), Inbound::Stream(stream)) = (outcome, inbound) else {
            return Ok(());
        };
        write_reply(stream, Socks5ReplyCode::ConnectionNotAllowed, None).await
    }

    async fn on_dial_outcome(&mut self, inbound: &mut Inbound, outcome: DialOutcome<'_>) -> io::Result<()> {
        let Inbound::Stream(stream) = inbound else {
            return Ok(());
        };
        match outcome {
            Ok(bound) => write_reply(stream, Socks5ReplyCode::Succeeded, bound).await,
            Err(e) => write_reply(stream, Socks5ReplyCode::from(e), None).await,
        }
    }
}

async fn write_reply<S>(stream: &mut S, code: Socks5ReplyCode, bound: Option<SocketAddr>) -> io::Result<()>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    reply::send_reply(stream, code, bound)
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
}
