//! LRU cache of leaf certificates with per-entry expiry.

use std::num::NonZeroUsize;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;

struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

/// Bounded, host-keyed cache.
///
/// `get` and `put` promote the entry to most-recently-used. Expired entries
/// are dropped when read and by [`sweep_expired`](Self::sweep_expired).
pub struct CertCache<V> {
    entries: Mutex<LruCache<String, CacheEntry<V>>>,
}

impl<V: Clone + Send + 'static> CertCache<V> {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Returns the cached value for `host` if present and unexpired.
    pub fn get(&self, host: &str) -> Option<V> {
        let mut entries = self.entries.lock();
        match entries.get(host) {
            Some(entry) if entry.expires_at > Instant::now() => return Some(entry.value.clone()),
            Some(_) => {}
            None => return None,
        }
        entries.pop(host);
        None
    }

    /// Inserts or replaces the entry for `host`, evicting the least recently
    /// used entry when full.
    pub fn put(&self, host: &str, value: V, expires_at: Instant) {
        let evicted = self
            .entries
            .lock()
            .push(host.to_string(), CacheEntry { value, expires_at });
        if let Some((evicted_host, _)) = evicted {
            if evicted_host != host {
                tracing::trace!("Evicted certificate for {} from cache", evicted_host);
            }
        }
    }

    /// Removes all expired entries regardless of recency. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(host, _)| host.clone())
            .collect();
        for host in &expired {
            entries.pop(host);
        }
        expired.len()
    }

    /// Removes every entry.
    pub fn purge(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawns a task that sweeps expired entries every `interval`.
    ///
    /// The task ends once the cache is dropped. Must be called from within
    /// a Tokio runtime.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let cache: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                let removed = cache.sweep_expired();
                if removed > 0 {
                    tracing::debug!("Swept {} expired certificates", removed);
                }
            }
        })
    }
}
