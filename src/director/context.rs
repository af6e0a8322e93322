use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::Span;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Per-connection state threaded through the pipeline
#[derive(Debug, Clone)]
pub struct ConnContext {
    /// Process-unique connection id
    pub id: u64,
    /// Span carrying id, server and client address
    pub span: Span,
    /// When the pipeline picked the connection up
    pub started: Instant,
    /// Connection-scoped cancellation, a child of the server token
    pub cancel: CancellationToken,
}

impl ConnContext {
    /// Derive a connection context from the server-wide token.
    ///
    /// The token is always a fresh child: cancelling it never reaches the
    /// server, while cancelling the server reaches every connection.
    pub fn new(server: &str, source: SocketAddr, parent: &CancellationToken) -> Self {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        ConnContext {
            id,
            span: tracing::info_span!("conn", id, server, src = %source),
            started: Instant::now(),
            cancel: parent.child_token(),
        }
    }

    /// Time since the pipeline started
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Whether the connection has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
