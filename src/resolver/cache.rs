//! Bounded TTL cache for resolved names

use lru::LruCache;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct Entry {
    ip: IpAddr,
    expires_at: Instant,
}

/// LRU cache whose entries also expire after a fixed TTL
#[derive(Debug)]
pub struct TtlCache {
    entries: Mutex<LruCache<String, Entry>>,
    ttl: Duration,
}

impl TtlCache {
    /// Create a cache holding at most `capacity` names
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        TtlCache {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// Fresh entry for `key`; an expired entry is dropped and reported as a miss
    pub fn get(&self, key: &str) -> Option<IpAddr> {
        let mut entries = self.entries.lock().ok()?;
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.ip),
            Some(_) => {
                entries.pop(key);
                None
            }
            None => None,
        }
    }

    /// Insert or refresh `key`
    pub fn insert(&self, key: &str, ip: IpAddr) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.put(
                key.to_string(),
                Entry {
                    ip,
                    expires_at: Instant::now() + self.ttl,
                },
            );
        }
    }

    /// Number of cached names, expired ones included
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
