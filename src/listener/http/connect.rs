//! CONNECT tunnels
//!
//! After the head is accepted the socket leaves HTTP entirely: bytes the
//! client sent past the head are replayed in front of the raw stream and
//! the pair is relayed opaquely once the 200 has gone out.

use super::{headers, raw_status, Client, RequestHead};
use crate::listener::{Connection, DialOutcome, Inbound, ReplySink, Reservation};
use crate::ruleset::Outcome;
use crate::transport::{close_stream, Network, PrefixedStream, StreamDyn};
use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

/// Reply that opens the tunnel
pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

/// Handle a client whose first request is `CONNECT`
pub(super) async fn serve<S>(
    client: Client,
    mut stream: S,
    head: RequestHead,
    buf: Bytes,
    reservation: Reservation,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + std::fmt::Debug + 'static,
{
    let Some(destination) = headers::authority_destination(&head.target) else {
        debug!("CONNECT from {} names no host:port: {:?}", client.peer, head.target);
        reject(stream, StatusCode::BAD_REQUEST).await;
        return;
    };

    if let Err(status) = client.authorize(&head.headers, StatusCode::FORBIDDEN).await {
        reject(stream, status).await;
        return;
    }

    info!("HTTP CONNECT request to {}", destination);
    let inbound = PrefixedStream::new(buf.slice(head.len..), stream);
    let conn = Connection::new(
        Network::Tcp,
        client.peer,
        destination,
        Inbound::Stream(Box::new(inbound)),
    )
    .with_reservation(reservation);
    client
        .handler
        .handle(&client.ctx, conn, Box::new(ConnectReplySink))
        .await;
}

async fn reject<S>(mut stream: S, status: StatusCode)
where
    S: AsyncWrite + Unpin,
{
    let mut extra = Vec::new();
    if status == StatusCode::PROXY_AUTHENTICATION_REQUIRED {
        extra.push(("Proxy-Authenticate", headers::CHALLENGE));
    }
    if let Err(e) = stream.write_all(&raw_status(status, &extra)).await {
        debug!("Failed to send {}: {}", status, e);
    }
    close_stream(stream).await;
}

/// Writes the tunnel's status line once the pipeline has decided
#[derive(Debug, Default, Clone, Copy)]
pub struct ConnectReplySink;

impl ConnectReplySink {
    async fn write(stream: &mut Box<dyn StreamDyn>, bytes: &[u8]) -> io::Result<()> {
        stream.write_all(bytes).await?;
        stream.flush().await
    }
}

#[async_trait]
impl ReplySink for ConnectReplySink {
    async fn on_ruleset_decision(&mut self, inbound: &mut Inbound, outcome: &Outcome) -> io::Result<()> {
        match (outcome, inbound) {
            (Outcome::Deny(_), Inbound::Stream(stream)) => {
                Self::write(stream, &raw_status(StatusCode::FORBIDDEN, &[])).await
            }
            _ => Ok(()),
        }
    }

    async fn on_dial_outcome(&mut self, inbound: &mut Inbound, outcome: DialOutcome<'_>) -> io::Result<()> {
        let Inbound::Stream(stream) = inbound else {
            return Ok(());
        };
        match outcome {
            Ok(_) => Self::write(stream, CONNECT_ESTABLISHED).await,
            Err(_) => Self::write(stream, &raw_status(StatusCode::BAD_GATEWAY, &[])).await,
        }
    }
}
