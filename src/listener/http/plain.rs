//! Plain (absolute-URI) proxy requests
//!
//! hyper owns the client connection and its keep-alive loop; each request
//! becomes an [`HttpExchange`] that the pipeline answers through a oneshot.

use super::{headers, status_response, Client, HttpExchange, ProxyBody};
use crate::listener::{Connection, DialOutcome, Inbound, ReplySink, Reservation};
use crate::ruleset::Outcome;
use crate::transport::{Network, PrefixedStream};
use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HOST, PROXY_AUTHENTICATE};
use http::{HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Body;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::io;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tracing::{debug, info};

/// Serve plain proxy requests until the client closes, replaying `buf`
/// (everything already read, head included) in front of the socket.
pub(super) async fn serve<S>(client: Client, stream: S, buf: Bytes, reservation: Reservation)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let ctx = client.ctx.clone();
    let peer = client.peer;
    let client = Arc::new(client);
    // The slot covers the request whose head was read on admission. Later
    // keep-alive requests queue without one.
    let first = Arc::new(Mutex::new(Some(reservation)));
    let service = service_fn(move |req| {
        let client = client.clone();
        let reservation = first
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
            .unwrap_or_default();
        async move { Ok::<_, Infallible>(proxy(&client, req, reservation).await) }
    });

    let io = TokioIo::new(PrefixedStream::new(buf, stream));
    let conn = http1::Builder::new()
        .keep_alive(true)
        .serve_connection(io, service);
    tokio::select! {
        result = conn => {
            if let Err(e) = result {
                debug!("HTTP connection from {} ended: {}", peer, e);
            }
        }
        _ = ctx.cancelled() => {
            debug!("HTTP connection from {} cancelled", peer);
        }
    }
}

/// Run one request through the pipeline and wait for its response
pub(super) async fn proxy<B>(
    client: &Client,
    req: Request<B>,
    reservation: Reservation,
) -> Response<ProxyBody>
where
    B: Body<Data = Bytes, Error = hyper::Error> + Send + Sync + 'static,
{
    if req.method() == Method::CONNECT {
        debug!("CONNECT from {} inside a keep-alive connection", client.peer);
        return status_response(StatusCode::BAD_REQUEST);
    }

    let Some(destination) = headers::absolute_destination(req.uri()) else {
        debug!("Relative URI from {}: {}", client.peer, req.uri());
        return status_response(StatusCode::BAD_REQUEST);
    };

    if let Err(status) = client.authorize(req.headers(), StatusCode::UNAUTHORIZED).await {
        let mut response = status_response(status);
        if status == StatusCode::PROXY_AUTHENTICATION_REQUIRED {
            response
                .headers_mut()
                .insert(PROXY_AUTHENTICATE, headers::challenge());
        }
        return response;
    }

    info!("HTTP {} {}", req.method(), req.uri());
    let (tx, rx) = oneshot::channel();
    let conn = Connection::new(
        Network::Tcp,
        client.peer,
        destination,
        Inbound::Http(HttpExchange::new(outbound_request(req), tx)),
    )
    .with_reservation(reservation);
    client
        .handler
        .handle(&client.ctx, conn, Box::new(PlainReplySink))
        .await;

    rx.await
        .unwrap_or_else(|_| status_response(StatusCode::BAD_GATEWAY))
}

/// Rewrite a proxy request into the request the origin should see.
///
/// Hop-by-hop headers go, `Host` follows the URI authority and the target
/// becomes origin-form. No `User-Agent` is added when the client sent none.
fn outbound_request<B>(req: Request<B>) -> Request<ProxyBody>
where
    B: Body<Data = Bytes, Error = hyper::Error> + Send + Sync + 'static,
{
    let (mut parts, body) = req.into_parts();
    headers::strip_hop_by_hop(&mut parts.headers);

    let host = parts
        .uri
        .authority()
        .and_then(|a| a.as_str().rsplit('@').next())
        .and_then(|h| HeaderValue::from_str(h).ok());
    if let Some(host) = host {
        parts.headers.insert(HOST, host);
    }
    parts.uri = headers::origin_form(&parts.uri);

    Request::from_parts(parts, body.boxed())
}

/// Answers plain requests the pipeline refused
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainReplySink;

#[async_trait]
impl ReplySink for PlainReplySink {
    async fn on_ruleset_decision(&mut self, inbound: &mut Inbound, outcome: &Outcome) -> io::Result<()> {
        if let (Outcome::Deny(_), Inbound::Http(exchange)) = (outcome, inbound) {
            exchange.respond(status_response(StatusCode::FORBIDDEN));
        }
        Ok(())
    }

    async fn on_dial_outcome(&mut self, inbound: &mut Inbound, outcome: DialOutcome<'_>) -> io::Result<()> {
        if let (Err(_), Inbound::Http(exchange)) = (outcome, inbound) {
            exchange.respond(status_response(StatusCode::BAD_GATEWAY));
        }
        Ok(())
    }
}
