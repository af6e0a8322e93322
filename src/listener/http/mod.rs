//! HTTP proxy listener
//!
//! The request head is read and parsed once to pick the sub-mode. `CONNECT`
//! turns the socket into an opaque tunnel ([`connect`]); anything else is
//! handed, head included, to a hyper HTTP/1.1 server that turns every
//! request on the connection into its own pipeline run ([`plain`]).

mod connect;
mod headers;
mod plain;

pub use connect::ConnectReplySink;
pub use plain::PlainReplySink;

use super::{accept_loop, ConnectionHandler, Listener};
use crate::auth::Authenticator;
use crate::config::ServerConfig;
use crate::error::{ProxyError, Result};
use crate::transport::SocketOpts;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Largest request head accepted before the first request is parsed
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

const MAX_HEADERS: usize = 64;

/// Body type flowing through the plain proxy in both directions
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// One plain proxy request awaiting its response
pub struct HttpExchange {
    request: Request<ProxyBody>,
    responder: Option<oneshot::Sender<Response<ProxyBody>>>,
}

impl HttpExchange {
    /// Pair a request with the channel its response goes back on
    pub fn new(request: Request<ProxyBody>, responder: oneshot::Sender<Response<ProxyBody>>) -> Self {
        HttpExchange {
            request,
            responder: Some(responder),
        }
    }

    /// The request to forward
    pub fn request(&self) -> &Request<ProxyBody> {
        &self.request
    }

    /// Answer the client; only the first response is delivered
    pub fn respond(&mut self, response: Response<ProxyBody>) -> bool {
        match self.responder.take() {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    /// Whether a response has already been sent
    pub fn is_answered(&self) -> bool {
        self.responder.is_none()
    }

    /// Split into the request and the unused responder
    pub fn into_parts(
        self,
    ) -> (
        Request<ProxyBody>,
        Option<oneshot::Sender<Response<ProxyBody>>>,
    ) {
        (self.request, self.responder)
    }

    #[cfg(test)]
    pub(crate) fn for_test(uri: &str) -> (Self, oneshot::Receiver<Response<ProxyBody>>) {
        let (tx, rx) = oneshot::channel();
        let request = Request::builder()
            .uri(uri)
            .body(empty())
            .unwrap_or_else(|_| Request::new(empty()));
        (HttpExchange::new(request, tx), rx)
    }
}

impl fmt::Debug for HttpExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpExchange")
            .field("method", self.request.method())
            .field("uri", self.request.uri())
            .field("answered", &self.is_answered())
            .finish()
    }
}

/// Empty proxy body
pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

/// Proxy body holding `chunk`
pub fn full<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Bodiless response with the given status
pub fn status_response(status: StatusCode) -> Response<ProxyBody> {
    let mut response = Response::new(empty());
    *response.status_mut() = status;
    response
}

/// Parsed request head of the first request on a connection
#[derive(Debug)]
pub(crate) struct RequestHead {
    pub method: Method,
    pub target: String,
    pub headers: HeaderMap,
    /// Length of the head in the read buffer
    pub len: usize,
}

/// Read until one full request head is buffered.
///
/// Returns the parsed head and every byte read so far, which may run past
/// the head into the body or the tunnel payload.
pub(crate) async fn read_head<S>(stream: &mut S) -> Result<(RequestHead, BytesMut)>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        if let Some(head) = parse_head(&buf)? {
            return Ok((head, buf));
        }
        if buf.len() >= MAX_HEAD_SIZE {
            return Err(ProxyError::Protocol(format!(
                "Request head exceeds {} bytes",
                MAX_HEAD_SIZE
            )));
        }
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(ProxyError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before request head completed",
            )));
        }
    }
}

fn parse_head(buf: &[u8]) -> Result<Option<RequestHead>> {
    let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut slots);
    let len = match request.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(ProxyError::Protocol(format!("Malformed HTTP request: {}", e))),
    };

    let method = request
        .method
        .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
        .ok_or_else(|| ProxyError::Protocol("Invalid HTTP method".to_string()))?;
    let target = request.path.unwrap_or_default().to_string();

    let mut headers = HeaderMap::new();
    for h in request.headers.iter() {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(h.name.as_bytes()),
            HeaderValue::from_bytes(h.value),
        ) else {
            return Err(ProxyError::Protocol(format!("Invalid header: {}", h.name)));
        };
        headers.append(name, value);
    }

    Ok(Some(RequestHead {
        method,
        target,
        headers,
        len,
    }))
}

/// Raw status line response for paths that bypass the HTTP server
pub(crate) fn raw_status(status: StatusCode, extra: &[(&str, &str)]) -> Vec<u8> {
    let mut out = format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    );
    for (name, value) in extra {
        out.push_str(&format!("{}: {}\r\n", name, value));
    }
    out.push_str("Content-Length: 0\r\nConnection: close\r\n\r\n");
    out.into_bytes()
}

/// What a client task needs to hand requests to the pipeline
#[derive(Clone)]
pub(crate) struct Client {
    pub ctx: CancellationToken,
    pub handler: Arc<dyn ConnectionHandler>,
    pub authenticator: Option<Arc<dyn Authenticator>>,
    pub peer: SocketAddr,
}

impl Client {
    /// Check proxy credentials; `Err` carries the status to answer with
    pub async fn authorize(
        &self,
        request_headers: &HeaderMap,
        refused: StatusCode,
    ) -> std::result::Result<(), StatusCode> {
        let Some(authenticator) = &self.authenticator else {
            return Ok(());
        };
        let source = crate::transport::Address::from(self.peer.ip());
        let Some(auth) = headers::proxy_credentials(request_headers, source) else {
            return Err(StatusCode::PROXY_AUTHENTICATION_REQUIRED);
        };
        authenticator.authenticate(&auth).await.map_err(|e| {
            debug!("Proxy authentication from {} failed: {}", self.peer, e);
            refused
        })
    }
}

/// Accepts HTTP proxy clients
#[derive(Debug)]
pub struct HttpListener {
    listener: TcpListener,
    opts: SocketOpts,
    head_timeout: Duration,
    authenticator: Option<Arc<dyn Authenticator>>,
}

impl HttpListener {
    /// Bind the server's listening address; `authenticator` enables
    /// `Proxy-Authorization` checks
    pub async fn bind(
        config: &ServerConfig,
        authenticator: Option<Arc<dyn Authenticator>>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(config.listen_addr()).await?;
        Ok(HttpListener {
            listener,
            opts: SocketOpts::from_tcp_config(&config.tcp),
            head_timeout: config.handshake_timeout(),
            authenticator,
        })
    }
}

#[async_trait]
impl Listener for HttpListener {
    fn protocol(&self) -> &'static str {
        "http"
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    async fn serve(&self, ctx: CancellationToken, handler: Arc<dyn ConnectionHandler>) -> Result<()> {
        info!("HTTP proxy listening on {}", self.listener.local_addr()?);
        accept_loop(
            &self.listener,
            &self.opts,
            ctx.clone(),
            handler.clone(),
            |mut stream, peer, reservation| {
                let ctx = ctx.clone();
                let handler = handler.clone();
                let authenticator = self.authenticator.clone();
                let limit = self.head_timeout;
                async move {
                    let read = match tokio::time::timeout(limit, read_head(&mut stream)).await {
                        Ok(read) => read,
                        Err(_) => {
                            debug!("HTTP request head from {} not received within {:?}", peer, limit);
                            let _ = stream
                                .write_all(&raw_status(StatusCode::REQUEST_TIMEOUT, &[]))
                                .await;
                            return;
                        }
                    };
                    let (head, buf) = match read {
                        Ok(read) => read,
                        Err(e) => {
                            debug!("HTTP request head from {} rejected: {}", peer, e);
                            if matches!(e, ProxyError::Protocol(_)) {
                                let _ = stream
                                    .write_all(&raw_status(StatusCode::BAD_REQUEST, &[]))
                                    .await;
                            }
                            return;
                        }
                    };

                    let client = Client {
                        ctx,
                        handler,
                        authenticator,
                        peer,
                    };
                    if head.method == Method::CONNECT {
                        connect::serve(client, stream, head, buf.freeze(), reservation).await;
                    } else {
                        plain::serve(client, stream, buf.freeze(), reservation).await;
                    }
                }
            },
        )
        .await
    }
}
