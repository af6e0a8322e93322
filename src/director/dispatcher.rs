//! Queued dispatch
//!
//! Decouples accept from dial. Listeners enqueue handshaken connections and
//! return to accepting; a fixed pool of workers pulls them off the queue and
//! runs the director's pipeline up to the dial outcome. Each dialed
//! connection is then relayed on a task of its own, so open tunnels never
//! occupy a worker.
//!
//! Backpressure is block-accept: `reserve` hands out one semaphore permit
//! per connection before the listener accepts it, and the permit rides with
//! the connection until its dial outcome is known. With `workers + queue`
//! permits the queue can never overflow, and a stalled dial shows up as a
//! listener that stops accepting instead of a growing backlog.

use super::Director;
use crate::config::DispatchConfig;
use crate::error::Result;
use crate::listener::{Connection, ConnectionHandler, ReplySink, Reservation};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct Job {
    server: CancellationToken,
    conn: Connection,
    sink: Box<dyn ReplySink>,
}

/// Counters for the queue, the workers and the relays they started
#[derive(Debug, Default)]
pub struct DispatchStats {
    queued: AtomicUsize,
    dialing: AtomicUsize,
    relaying: AtomicUsize,
    completed: AtomicUsize,
}

/// Point-in-time copy of [`DispatchStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSnapshot {
    /// Waiting for a worker
    pub queued: usize,
    /// Being dialed by a worker
    pub dialing: usize,
    /// Dialed and relaying
    pub relaying: usize,
    /// Finished since start
    pub completed: usize,
}

impl DispatchStats {
    /// Current values
    pub fn snapshot(&self) -> DispatchSnapshot {
        DispatchSnapshot {
            queued: self.queued.load(Ordering::Relaxed),
            dialing: self.dialing.load(Ordering::Relaxed),
            relaying: self.relaying.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
        }
    }
}

/// Worker pool in front of a [`Director`]
pub struct Dispatcher {
    director: Arc<Director>,
    workers: usize,
    permits: Arc<Semaphore>,
    tx: mpsc::Sender<Job>,
    rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    stats: Arc<DispatchStats>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("server", &self.director.name())
            .field("workers", &self.workers)
            .field("free_slots", &self.permits.available_permits())
            .finish()
    }
}

impl Dispatcher {
    /// Put `config.workers` workers and a queue of `config.queue` slots in
    /// front of `director`
    pub fn new(director: Arc<Director>, config: &DispatchConfig) -> Self {
        let workers = config.workers.max(1);
        let capacity = workers + config.queue.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Dispatcher {
            director,
            workers,
            permits: Arc::new(Semaphore::new(capacity)),
            tx,
            rx: Arc::new(Mutex::new(rx)),
            stats: Arc::new(DispatchStats::default()),
        }
    }

    /// The director whose pipeline the workers run
    pub fn director(&self) -> &Director {
        &self.director
    }

    /// Queue and worker counters
    pub fn stats(&self) -> Arc<DispatchStats> {
        self.stats.clone()
    }

    /// Admission slots not currently held by a connection
    pub fn free_slots(&self) -> usize {
        self.permits.available_permits()
    }

    /// Start the workers, then accept through the director's listener until
    /// `ctx` is cancelled
    pub async fn serve(self: Arc<Self>, ctx: CancellationToken) -> Result<()> {
        let mut workers = Vec::with_capacity(self.workers);
        for id in 0..self.workers {
            workers.push(tokio::spawn(worker(
                id,
                self.director.clone(),
                self.rx.clone(),
                self.stats.clone(),
                ctx.clone(),
            )));
        }
        info!(
            "Server {} dispatching to {} workers",
            self.director.name(),
            self.workers
        );

        let listener = self.director.listener().clone();
        let result = listener.serve(ctx.clone(), self.clone()).await;

        ctx.cancel();
        for handle in workers {
            let _ = handle.await;
        }
        result
    }
}

async fn worker(
    id: usize,
    director: Arc<Director>,
    rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    stats: Arc<DispatchStats>,
    ctx: CancellationToken,
) {
    loop {
        let job = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = ctx.cancelled() => None,
                job = rx.recv() => job,
            }
        };
        let Some(job) = job else {
            break;
        };

        stats.queued.fetch_sub(1, Ordering::Relaxed);
        stats.dialing.fetch_add(1, Ordering::Relaxed);
        let relay = director.dial(&job.server, job.conn, job.sink).await;
        stats.dialing.fetch_sub(1, Ordering::Relaxed);

        let Some(relay) = relay else {
            stats.completed.fetch_add(1, Ordering::Relaxed);
            continue;
        };
        stats.relaying.fetch_add(1, Ordering::Relaxed);
        let stats = stats.clone();
        tokio::spawn(async move {
            relay.run().await;
            stats.relaying.fetch_sub(1, Ordering::Relaxed);
            stats.completed.fetch_add(1, Ordering::Relaxed);
        });
    }
    debug!("Dispatch worker {} stopped", id);
}

#[async_trait]
impl ConnectionHandler for Dispatcher {
    async fn reserve(&self) -> Reservation {
        match self.permits.clone().acquire_owned().await {
            Ok(permit) => Reservation::new(permit),
            // Only reachable if the semaphore is closed, which nothing does.
            Err(_) => Reservation::default(),
        }
    }

    async fn handle(&self, ctx: &CancellationToken, conn: Connection, sink: Box<dyn ReplySink>) {
        self.stats.queued.fetch_add(1, Ordering::Relaxed);
        let job = Job {
            server: ctx.clone(),
            conn,
            sink,
        };
        if self.tx.send(job).await.is_err() {
            self.stats.queued.fetch_sub(1, Ordering::Relaxed);
            warn!("Dispatch queue for {} is closed", self.director.name());
        }
    }
}
