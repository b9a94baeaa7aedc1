//! Query result cache with TTL expiry and a background eviction sweep.
//!
//! Entries live in a sharded [`DashMap`], so reads and writes on unrelated
//! keys never contend on a single lock. Expired entries are removed lazily on
//! read and, when a sweep interval is configured, by a periodic sweep task
//! that holds only a weak reference to the cache.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::key::CacheKey;
use crate::config::CacheConfig;

/// A single cached value.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub inserted_at: Instant,
    pub ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) >= self.ttl
    }
}

/// Cache tuning knobs, usually derived from [`CacheConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSettings {
    /// TTL applied by [`TtlCache::set`].
    pub default_ttl: Duration,
    /// Period of the background sweep. `None` disables it.
    pub sweep_interval: Option<Duration>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(3600),
            sweep_interval: Some(Duration::from_secs(600)),
        }
    }
}

impl From<&CacheConfig> for CacheSettings {
    fn from(cfg: &CacheConfig) -> Self {
        Self {
            default_ttl: Duration::from_secs(cfg.ttl_secs),
            sweep_interval: (cfg.sweep_interval_secs > 0)
                .then(|| Duration::from_secs(cfg.sweep_interval_secs)),
        }
    }
}

struct Sweeper {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Process-local TTL cache.
pub struct TtlCache<V> {
    entries: DashMap<CacheKey, CacheEntry<V>>,
    settings: CacheSettings,
    hits: AtomicU64,
    misses: AtomicU64,
    sweeper: Mutex<Option<Sweeper>>,
}

impl<V> TtlCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create an empty cache without a background sweep.
    pub fn new(settings: CacheSettings) -> Self {
        Self {
            entries: DashMap::new(),
            settings,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sweeper: Mutex::new(None),
        }
    }

    /// Create an empty shared cache and start the eviction sweep.
    ///
    /// The sweep only starts when `settings.sweep_interval` is set and a
    /// Tokio runtime is available; otherwise expiry stays purely lazy.
    pub fn init(settings: CacheSettings) -> Arc<Self> {
        let cache = Arc::new(Self::new(settings));
        if let Some(period) = settings.sweep_interval {
            if tokio::runtime::Handle::try_current().is_ok() {
                let sweeper = spawn_sweeper(Arc::downgrade(&cache), period);
                if let Ok(mut slot) = cache.sweeper.lock() {
                    *slot = Some(sweeper);
                }
            } else {
                debug!("No Tokio runtime, cache sweep disabled");
            }
        }
        cache
    }

    /// Stop the background sweep, if running.
    pub async fn shutdown(&self) {
        let sweeper = self.sweeper.lock().ok().and_then(|mut slot| slot.take());
        if let Some(sweeper) = sweeper {
            let _ = sweeper.shutdown_tx.send(true);
            let _ = sweeper.handle.await;
            info!("Cache sweep stopped");
        }
    }

    /// Whether a background sweep task is currently attached.
    pub fn is_sweeping(&self) -> bool {
        self.sweeper
            .lock()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    /// Look up a value. Returns `None` if the key is absent or expired.
    pub fn get(&self, key: &CacheKey) -> Option<V> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            debug!(key = %key.short(), "Cache entry expired, removing");
            // Re-check under the shard write lock: a concurrent set may have
            // replaced the entry since we looked.
            self.entries.remove_if(key, |_, e| e.is_expired(now));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store a value with the default TTL, replacing any previous entry.
    pub fn set(&self, key: CacheKey, value: V) {
        self.set_with_ttl(key, value, self.settings.default_ttl);
    }

    /// Store a value with an explicit TTL.
    pub fn set_with_ttl(&self, key: CacheKey, value: V, ttl: Duration) {
        self.entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: Instant::now(),
                ttl,
            },
        );
    }

    /// Remove all entries.
    pub fn flush(&self) {
        let removed = self.entries.len();
        self.entries.clear();
        info!(removed, "Cache flushed");
    }

    /// Drop every expired entry and return how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    /// Aggregate statistics.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            total_entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn default_ttl(&self) -> Duration {
        self.settings.default_ttl
    }
}

fn spawn_sweeper<V>(cache: Weak<TtlCache<V>>, period: Duration) -> Sweeper
where
    V: Clone + Send + Sync + 'static,
{
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await; // skip first immediate tick

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let Some(cache) = cache.upgrade() else {
                        break;
                    };
                    let removed = cache.purge_expired();
                    if removed > 0 {
                        debug!(
                            removed,
                            remaining = cache.len(),
                            "Cache sweep evicted expired entries"
                        );
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    });
    Sweeper {
        shutdown_tx,
        handle,
    }
}

/// Aggregate cache statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    /// Entries currently stored, including expired ones not yet swept.
    pub total_entries: usize,
    pub hits: u64,
    pub misses: u64,
}
