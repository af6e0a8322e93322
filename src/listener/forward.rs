//! Fixed-port forwarding
//!
//! Forward listeners speak no protocol. TCP clients are handed over as
//! opaque streams; UDP clients are grouped into sessions keyed by their
//! address. The destination is left unset for the forward router to fill.

use super::{accept_loop, Connection, ConnectionHandler, Inbound, Listener, NoReply};
use crate::config::ServerConfig;
use crate::error::Result;
use crate::helper::MAX_DATAGRAM_SIZE;
use crate::transport::{Destination, Network, SocketOpts};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Datagrams queued per UDP session before new ones are dropped
const SESSION_QUEUE: usize = 64;

/// Accepts raw TCP and forwards it untouched
#[derive(Debug)]
pub struct ForwardTcpListener {
    listener: TcpListener,
    opts: SocketOpts,
}

impl ForwardTcpListener {
    /// Bind the server's listening address
    pub async fn bind(config: &ServerConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(config.listen_addr()).await?;
        Ok(ForwardTcpListener {
            listener,
            opts: SocketOpts::from_tcp_config(&config.tcp),
        })
    }
}

#[async_trait]
impl Listener for ForwardTcpListener {
    fn protocol(&self) -> &'static str {
        "forward/tcp"
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    async fn serve(&self, ctx: CancellationToken, handler: Arc<dyn ConnectionHandler>) -> Result<()> {
        info!("Forwarding tcp on {}", self.listener.local_addr()?);
        accept_loop(
            &self.listener,
            &self.opts,
            ctx.clone(),
            handler.clone(),
            |stream, peer, reservation| {
                let ctx = ctx.clone();
                let handler = handler.clone();
                async move {
                    let conn = Connection::new(
                        Network::Tcp,
                        peer,
                        Destination::default(),
                        Inbound::Stream(Box::new(stream)),
                    )
                    .with_reservation(reservation);
                    handler.handle(&ctx, conn, Box::new(NoReply)).await;
                }
            },
        )
        .await
    }
}

type Sessions = Arc<Mutex<HashMap<SocketAddr, mpsc::Sender<Bytes>>>>;

/// Client side of one forwarded UDP flow
pub struct UdpSession {
    rx: mpsc::Receiver<Bytes>,
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    sessions: Option<Sessions>,
}

impl UdpSession {
    /// Session for `peer`, fed by `rx` and answered through `socket`
    pub fn new(rx: mpsc::Receiver<Bytes>, socket: Arc<UdpSocket>, peer: SocketAddr) -> Self {
        UdpSession {
            rx,
            socket,
            peer,
            sessions: None,
        }
    }

    fn registered(mut self, sessions: Sessions) -> Self {
        self.sessions = Some(sessions);
        self
    }

    /// Client address
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Next datagram from the client; `None` once the listener is gone
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Send a datagram back to the client
    pub async fn reply(&self, datagram: &[u8]) -> io::Result<()> {
        self.socket.send_to(datagram, self.peer).await.map(|_| ())
    }
}

impl fmt::Debug for UdpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpSession").field("peer", &self.peer).finish()
    }
}

impl Drop for UdpSession {
    fn drop(&mut self) {
        self.rx.close();
        if let Some(sessions) = &self.sessions {
            if let Ok(mut sessions) = sessions.lock() {
                // A replacement session for the same peer keeps its entry.
                if sessions.get(&self.peer).is_some_and(|tx| tx.is_closed()) {
                    sessions.remove(&self.peer);
                }
            }
        }
    }
}

/// Receives datagrams and hands each new client address to the pipeline
#[derive(Debug)]
pub struct ForwardUdpListener {
    socket: Arc<UdpSocket>,
    sessions: Sessions,
}

impl ForwardUdpListener {
    /// Bind the server's listening address
    pub async fn bind(config: &ServerConfig) -> io::Result<Self> {
        let socket = UdpSocket::bind(config.listen_addr()).await?;
        Ok(ForwardUdpListener {
            socket: Arc::new(socket),
            sessions: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }

    fn existing(&self, peer: &SocketAddr) -> Option<mpsc::Sender<Bytes>> {
        let sessions = self.sessions.lock().ok()?;
        sessions.get(peer).filter(|tx| !tx.is_closed()).cloned()
    }
}

#[async_trait]
impl Listener for ForwardUdpListener {
    fn protocol(&self) -> &'static str {
        "forward/udp"
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    async fn serve(&self, ctx: CancellationToken, handler: Arc<dyn ConnectionHandler>) -> Result<()> {
        info!("Forwarding udp on {}", self.socket.local_addr()?);
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            let (n, peer) = tokio::select! {
                _ = ctx.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        // ICMP errors from earlier replies surface here.
                        debug!("UDP receive error: {}", e);
                        continue;
                    }
                },
            };
            let datagram = Bytes::copy_from_slice(&buf[..n]);

            if let Some(tx) = self.existing(&peer) {
                if tx.try_send(datagram).is_err() {
                    warn!("UDP session for {} is congested, dropping datagram", peer);
                }
                continue;
            }

            let reservation = tokio::select! {
                _ = ctx.cancelled() => break,
                reservation = handler.reserve() => reservation,
            };

            let (tx, rx) = mpsc::channel(SESSION_QUEUE);
            // Capacity is fresh, the first datagram always fits.
            let _ = tx.try_send(datagram);
            if let Ok(mut sessions) = self.sessions.lock() {
                sessions.insert(peer, tx);
            }
            debug!("New UDP session from {}", peer);

            let session =
                UdpSession::new(rx, self.socket.clone(), peer).registered(self.sessions.clone());
            let conn = Connection::new(
                Network::Udp,
                peer,
                Destination::default(),
                Inbound::Datagram(session),
            )
            .with_reservation(reservation);

            let ctx = ctx.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                handler.handle(&ctx, conn, Box::new(NoReply)).await;
            });
        }
        Ok(())
    }
}
