//! Name resolution
//!
//! Resolution order is static hosts, then IP literals, then the configured
//! [`Lookup`]. Successful answers, literals included, are cached by the
//! address string the client sent. Failures are not cached. Concurrent
//! callers asking for the same uncached name share one lookup.

mod cache;

pub use cache::TtlCache;

use crate::config::ResolverConfig;
use crate::error::{ProxyError, Result};
use crate::transport::Address;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::Debug;
use std::io;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Backend that turns a name into an IP
#[async_trait]
pub trait Lookup: Send + Sync + Debug {
    /// Resolve `name` to one address
    async fn lookup(&self, name: &str) -> io::Result<IpAddr>;
}

/// Operating system resolver
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLookup;

#[async_trait]
impl Lookup for SystemLookup {
    async fn lookup(&self, name: &str) -> io::Result<IpAddr> {
        tokio::net::lookup_host((name, 0))
            .await?
            .next()
            .map(|addr| addr.ip())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses found"))
    }
}

type Flight = Arc<OnceCell<std::result::Result<IpAddr, String>>>;

/// Caching resolver shared by every server of one instance
#[derive(Debug)]
pub struct Resolver {
    hosts: HashMap<String, IpAddr>,
    cache: TtlCache,
    lookup: Box<dyn Lookup>,
    in_flight: Mutex<HashMap<String, Flight>>,
}

impl Resolver {
    /// Create a resolver using the system lookup
    pub fn new(config: &ResolverConfig) -> Self {
        Self::with_lookup(config, Box::new(SystemLookup))
    }

    /// Create a resolver with a custom lookup backend
    pub fn with_lookup(config: &ResolverConfig, lookup: Box<dyn Lookup>) -> Self {
        Resolver {
            hosts: config.hosts.clone(),
            cache: TtlCache::new(config.capacity, config.ttl()),
            lookup,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve `address` to an IP, giving up when `ctx` is cancelled
    pub async fn resolve(&self, ctx: &CancellationToken, address: &Address) -> Result<IpAddr> {
        tokio::select! {
            result = self.resolve_inner(address) => result,
            _ = ctx.cancelled() => Err(ProxyError::Resolution {
                name: address.to_string(),
                reason: "cancelled".to_string(),
            }),
        }
    }

    async fn resolve_inner(&self, address: &Address) -> Result<IpAddr> {
        let key = address.to_string();

        if let Address::Domain(name) = address {
            if let Some(ip) = self.hosts.get(name) {
                debug!("{} resolved from static hosts to {}", name, ip);
                return Ok(*ip);
            }
        }

        if let Some(ip) = self.cache.get(&key) {
            return Ok(ip);
        }

        let name = match address {
            Address::Domain(name) => name,
            literal => {
                let ip = literal.ip().ok_or_else(|| ProxyError::Resolution {
                    name: key.clone(),
                    reason: "not an IP literal".to_string(),
                })?;
                self.cache.insert(&key, ip);
                return Ok(ip);
            }
        };

        let flight = self.join_flight(&key);
        let result = flight
            .get_or_init(|| async {
                let result = self.lookup.lookup(name).await.map_err(|e| e.to_string());
                if let Ok(ip) = result {
                    debug!("{} resolved to {}", name, ip);
                    self.cache.insert(&key, ip);
                }
                result
            })
            .await
            .clone();
        self.leave_flight(&key, &flight);

        result.map_err(|reason| ProxyError::Resolution {
            name: name.clone(),
            reason,
        })
    }

    fn join_flight(&self, key: &str) -> Flight {
        match self.in_flight.lock() {
            Ok(mut flights) => flights
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone(),
            Err(_) => Arc::new(OnceCell::new()),
        }
    }

    fn leave_flight(&self, key: &str, flight: &Flight) {
        if let Ok(mut flights) = self.in_flight.lock() {
            // A later flight for the same key may already have replaced ours.
            if flights.get(key).is_some_and(|f| Arc::ptr_eq(f, flight)) {
                flights.remove(key);
            }
        }
    }

    /// Number of cached names
    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}
