use super::{dial_tcp, finished, Connector, Session};
use crate::director::ConnContext;
use crate::error::{ProxyError, Result};
use crate::listener::http::{status_response, ProxyBody};
use crate::listener::{Connection, Inbound, ReplySink};
use crate::transport::SocketOpts;
use async_trait::async_trait;
use http::{Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::client::conn::http1::{Builder, Connection as OriginConnection, SendRequest};
use hyper_util::rt::TokioIo;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// One HTTP/1.1 round-trip to the origin over a freshly dialed connection
#[derive(Debug, Clone)]
pub struct HttpConnector {
    dial_timeout: Duration,
    opts: SocketOpts,
}

impl HttpConnector {
    /// Create a connector with the given dial timeout and socket tuning
    pub fn new(dial_timeout: Duration, opts: SocketOpts) -> Self {
        HttpConnector { dial_timeout, opts }
    }
}

#[async_trait]
impl Connector for HttpConnector {
    fn name(&self) -> &'static str {
        "http"
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
        sink.on_dial_outcome(&mut conn.inbound, Ok(outbound.local_addr().ok()))
            .await?;

        let kind = conn.inbound.kind();
        let Inbound::Http(exchange) = conn.inbound else {
            return Err(ProxyError::Protocol(format!(
                "http connector cannot serve {} inbound",
                kind
            )));
        };
        let (request, responder) = exchange.into_parts();
        let Some(responder) = responder else {
            return Ok(finished());
        };

        let (sender, connection) = match Builder::new()
            .handshake(TokioIo::new(outbound))
            .await
        {
            Ok(pair) => pair,
            Err(e) => {
                let _ = responder.send(status_response(StatusCode::BAD_GATEWAY));
                return Err(ProxyError::Dial(io::Error::new(io::ErrorKind::Other, e)));
            }
        };

        Ok(Box::pin(round_trip(
            Origin {
                addr,
                sender,
                connection,
            },
            request,
            responder,
            ctx.cancel.clone(),
        )))
    }
}

struct Origin {
    addr: SocketAddr,
    sender: SendRequest<ProxyBody>,
    connection: OriginConnection<TokioIo<TcpStream>, ProxyBody>,
}

/// Forward `request` and hand the response to `responder`. Returns once the
/// origin connection is done, which is after the response body has been
/// streamed to the client.
async fn round_trip(
    origin: Origin,
    request: Request<ProxyBody>,
    responder: oneshot::Sender<Response<ProxyBody>>,
    cancel: CancellationToken,
) -> Result<()> {
    let Origin {
        addr,
        mut sender,
        connection,
    } = origin;

    let driver = tokio::spawn(async move {
        tokio::select! {
            result = connection => {
                if let Err(e) = result {
                    debug!("Origin connection to {} failed: {}", addr, e);
                }
            }
            _ = cancel.cancelled() => {}
        }
    });

    info!("Forwarding {} {} to {}", request.method(), request.uri(), addr);
    let response = match sender.send_request(request).await {
        Ok(response) => response,
        Err(e) => {
            let _ = responder.send(status_response(StatusCode::BAD_GATEWAY));
            driver.abort();
            return Err(ProxyError::Io(io::Error::new(io::ErrorKind::Other, e)));
        }
    };
    drop(sender);

    debug!("Origin {} answered {}", addr, response.status());
    if responder.send(response.map(|b| b.boxed())).is_err() {
        debug!("Client went away before the response from {}", addr);
    }
    if let Err(e) = driver.await {
        debug!("Origin connection task for {} ended abnormally: {}", addr, e);
    }
    Ok(())
}
