//! Bidirectional relay engine
//!
//! A [`Tunnel`] owns the inbound stream of one connection. Connecting it to
//! an outbound stream starts two one-way pumps whose terminal results land
//! on a shared queue of capacity 2. The tunnel returns on the first result
//! or when the connection is cancelled, then fires its teardown token; the
//! remaining pump observes the token on its next poll and closes its half.

use crate::helper::DEFAULT_BUFFER_SIZE;
use crate::transport::{close_stream, StreamDyn};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Ordinary ways for a relay to end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BenignKind {
    /// Peer closed or the stream was already shut
    Closed,
    /// A transport timeout fired
    Timeout,
    /// Peer reset or aborted the connection
    Reset,
}

/// Classification attached to an IO error where it is produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Normal termination
    Benign(BenignKind),
    /// A real fault worth reporting
    Fatal,
}

impl ErrorClass {
    /// Classify an IO error by kind
    pub fn of(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::Interrupted => ErrorClass::Benign(BenignKind::Closed),
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                ErrorClass::Benign(BenignKind::Timeout)
            }
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
                ErrorClass::Benign(BenignKind::Reset)
            }
            _ => ErrorClass::Fatal,
        }
    }

    /// Whether this is a normal termination
    pub fn is_benign(&self) -> bool {
        matches!(self, ErrorClass::Benign(_))
    }
}

/// Relay direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to destination
    Upstream,
    /// Destination to client
    Downstream,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upstream => write!(f, "upstream"),
            Direction::Downstream => write!(f, "downstream"),
        }
    }
}

/// Mid-stream IO failure, tagged benign or fatal
#[derive(Error, Debug)]
#[error("{source}")]
pub struct RelayError {
    class: ErrorClass,
    #[source]
    source: io::Error,
}

impl RelayError {
    /// Wrap and classify an IO error
    pub fn new(source: io::Error) -> Self {
        RelayError {
            class: ErrorClass::of(&source),
            source,
        }
    }

    /// The relay was cancelled by its owning connection
    pub fn cancelled() -> Self {
        RelayError {
            class: ErrorClass::Benign(BenignKind::Closed),
            source: io::Error::new(io::ErrorKind::Interrupted, "relay cancelled"),
        }
    }

    /// Classification assigned at creation
    pub fn class(&self) -> ErrorClass {
        self.class
    }

    /// Underlying IO error
    pub fn io_error(&self) -> &io::Error {
        &self.source
    }
}

/// Byte counts of a finished relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Bytes copied client to destination
    pub uploaded: u64,
    /// Bytes copied destination to client
    pub downloaded: u64,
}

/// Live bidirectional relay of one connection
#[derive(Debug)]
pub struct Tunnel {
    inbound: Option<Box<dyn StreamDyn>>,
    teardown: CancellationToken,
}

impl Tunnel {
    /// Create a tunnel for `inbound`, governed by the connection's token
    pub fn new(inbound: Box<dyn StreamDyn>, ctx: &CancellationToken) -> Self {
        Tunnel {
            inbound: Some(inbound),
            teardown: ctx.child_token(),
        }
    }

    /// Relay between the inbound stream and `outbound` until either side finishes.
    ///
    /// Both streams are closed on every exit path. A tunnel relays once;
    /// a second call fails with a benign `NotConnected` error.
    pub async fn connect<O>(&mut self, outbound: O) -> Result<RelayStats, RelayError>
    where
        O: StreamDyn + 'static,
    {
        let inbound = self.inbound.take().ok_or_else(|| {
            RelayError::new(io::Error::new(
                io::ErrorKind::NotConnected,
                "tunnel already relayed or closed",
            ))
        })?;

        let (in_read, in_write) = tokio::io::split(inbound);
        let (out_read, out_write) = tokio::io::split(outbound);

        let uploaded = Arc::new(AtomicU64::new(0));
        let downloaded = Arc::new(AtomicU64::new(0));
        let (tx, mut rx) = mpsc::channel::<(Direction, io::Result<u64>)>(2);

        spawn_pump(
            Direction::Upstream,
            in_read,
            out_write,
            self.teardown.clone(),
            uploaded.clone(),
            tx.clone(),
        );
        spawn_pump(
            Direction::Downstream,
            out_read,
            in_write,
            self.teardown.clone(),
            downloaded.clone(),
            tx,
        );

        let first = tokio::select! {
            result = rx.recv() => result,
            _ = self.teardown.cancelled() => None,
        };

        // Unblock whichever pump is still waiting.
        self.teardown.cancel();

        let stats = RelayStats {
            uploaded: uploaded.load(Ordering::Relaxed),
            downloaded: downloaded.load(Ordering::Relaxed),
        };

        match first {
            Some((direction, Ok(bytes))) => {
                debug!("{} finished after {} bytes", direction, bytes);
                Ok(stats)
            }
            Some((direction, Err(e))) => {
                debug!("{} failed: {}", direction, e);
                Err(RelayError::new(e))
            }
            None => Err(RelayError::cancelled()),
        }
    }

    /// Tear the tunnel down. Safe to call any number of times.
    pub fn close(&mut self) {
        self.teardown.cancel();
        self.inbound.take();
    }

    /// Whether teardown has been triggered
    pub fn is_closed(&self) -> bool {
        self.teardown.is_cancelled()
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.teardown.cancel();
    }
}

fn spawn_pump<R, W>(
    direction: Direction,
    reader: R,
    writer: W,
    teardown: CancellationToken,
    counter: Arc<AtomicU64>,
    results: mpsc::Sender<(Direction, io::Result<u64>)>,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let result = pump(reader, writer, teardown, counter).await;
        // The receiver is gone once the tunnel has returned.
        let _ = results.try_send((direction, result));
    });
}

async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    teardown: CancellationToken,
    counter: Arc<AtomicU64>,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; DEFAULT_BUFFER_SIZE];
    let mut total = 0u64;

    let result = loop {
        let n = tokio::select! {
            biased;
            _ = teardown.cancelled() => break Ok(total),
            read = reader.read(&mut buf) => match read {
                Ok(0) => break Ok(total),
                Ok(n) => n,
                Err(e) => break Err(e),
            },
        };

        let written = tokio::select! {
            biased;
            _ = teardown.cancelled() => break Ok(total),
            written = writer.write_all(&buf[..n]) => written,
        };
        if let Err(e) = written {
            break Err(e);
        }

        total += n as u64;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    };

    close_stream(writer).await;
    result
}
