//! Per-domain response cache.
//!
//! Reads load an immutable snapshot of the domain map without locking; writes
//! are serialized per domain and publish a new snapshot. The cache is a
//! passive store: a miss never triggers a fetch.

use crate::config::CacheConfig;
use crate::worker::WorkerType;
use arc_swap::ArcSwap;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// The full entity listing of a domain
    Listing,
    /// One entity by id
    Entity(String),
}

impl CacheKey {
    pub fn entity(id: impl Into<String>) -> Self {
        CacheKey::Entity(id.into())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Listing => f.write_str("*listing"),
            CacheKey::Entity(id) => f.write_str(id),
        }
    }
}

/// What to drop on invalidation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Key(CacheKey),
    All,
}

pub struct CacheEntry<V> {
    value: V,
    stored_at: Instant,
    expires_at: Instant,
    access_count: AtomicU64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Metadata of a live entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub access_count: u64,
    pub age: Duration,
    pub remaining: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub domain: WorkerType,
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

type Snapshot<V> = HashMap<CacheKey, Arc<CacheEntry<V>>>;

struct DomainCache<V> {
    entries: ArcSwap<Snapshot<V>>,
    write: Mutex<()>,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<V> DomainCache<V> {
    fn new(default_ttl: Duration) -> Self {
        Self {
            entries: ArcSwap::from_pointee(HashMap::new()),
            write: Mutex::new(()),
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Run `f` on a private copy of the map and publish the result
    fn update<R>(&self, f: impl FnOnce(&mut Snapshot<V>) -> R) -> R {
        let _guard = self.write.lock().unwrap_or_else(|e| e.into_inner());
        let mut next = (**self.entries.load()).clone();
        let result = f(&mut next);
        self.entries.store(Arc::new(next));
        result
    }
}

/// Cache service with one map per domain. Constructed once and shared.
pub struct ResponseCache<V> {
    domains: HashMap<WorkerType, DomainCache<V>>,
}

impl<V: Clone + Send + Sync + 'static> ResponseCache<V> {
    pub fn new(config: &CacheConfig) -> Self {
        let domains = WorkerType::ALL
            .into_iter()
            .map(|domain| (domain, DomainCache::new(config.ttl_for(domain))))
            .collect();
        Self { domains }
    }

    fn domain(&self, domain: WorkerType) -> &DomainCache<V> {
        // every worker type gets a map in `new`
        &self.domains[&domain]
    }

    /// Fresh value for `key`, or `None` on miss. Expired entries count as
    /// misses and are removed.
    pub fn get(&self, domain: WorkerType, key: &CacheKey) -> Option<V> {
        let cache = self.domain(domain);
        let now = Instant::now();
        let entry = cache.entries.load().get(key).cloned();

        match entry {
            Some(entry) if !entry.is_expired(now) => {
                entry.access_count.fetch_add(1, Ordering::Relaxed);
                cache.hits.fetch_add(1, Ordering::Relaxed);
                trace!(%domain, %key, "Cache hit");
                Some(entry.value.clone())
            }
            Some(expired) => {
                cache.misses.fetch_add(1, Ordering::Relaxed);
                let removed = cache.update(|map| match map.get(key) {
                    Some(current) if Arc::ptr_eq(current, &expired) => map.remove(key).is_some(),
                    _ => false,
                });
                if removed {
                    cache.evictions.fetch_add(1, Ordering::Relaxed);
                }
                trace!(%domain, %key, "Cache entry expired");
                None
            }
            None => {
                cache.misses.fetch_add(1, Ordering::Relaxed);
                trace!(%domain, %key, "Cache miss");
                None
            }
        }
    }

    /// Store `value`, replacing any previous entry. `ttl` overrides the
    /// domain default.
    pub fn set(&self, domain: WorkerType, key: CacheKey, value: V, ttl: Option<Duration>) {
        let cache = self.domain(domain);
        let ttl = ttl.unwrap_or(cache.default_ttl);
        let now = Instant::now();
        let entry = Arc::new(CacheEntry {
            value,
            stored_at: now,
            expires_at: now + ttl,
            access_count: AtomicU64::new(0),
        });
        trace!(%domain, %key, ttl_secs = ttl.as_secs(), "Cache set");
        cache.update(|map| {
            map.insert(key, entry);
        });
    }

    /// Replace the whole domain map in one swap, so readers never observe a
    /// mix of old and new entries.
    pub fn replace_all(
        &self,
        domain: WorkerType,
        entries: impl IntoIterator<Item = (CacheKey, V)>,
        ttl: Option<Duration>,
    ) {
        let cache = self.domain(domain);
        let ttl = ttl.unwrap_or(cache.default_ttl);
        let now = Instant::now();
        let next: Snapshot<V> = entries
            .into_iter()
            .map(|(key, value)| {
                let entry = CacheEntry {
                    value,
                    stored_at: now,
                    expires_at: now + ttl,
                    access_count: AtomicU64::new(0),
                };
                (key, Arc::new(entry))
            })
            .collect();
        let _guard = cache.write.lock().unwrap_or_else(|e| e.into_inner());
        cache.entries.store(Arc::new(next));
    }

    /// Drop one key or the whole domain; returns how many entries went away
    pub fn invalidate(&self, domain: WorkerType, scope: Scope) -> usize {
        let cache = self.domain(domain);
        let removed = cache.update(|map| match &scope {
            Scope::Key(key) => usize::from(map.remove(key).is_some()),
            Scope::All => {
                let n = map.len();
                map.clear();
                n
            }
        });
        if removed > 0 {
            debug!(%domain, ?scope, removed, "Cache invalidated");
        }
        removed
    }

    pub fn entry_info(&self, domain: WorkerType, key: &CacheKey) -> Option<EntryInfo> {
        let now = Instant::now();
        let snapshot = self.domain(domain).entries.load();
        let entry = snapshot.get(key)?;
        if entry.is_expired(now) {
            return None;
        }
        Some(EntryInfo {
            access_count: entry.access_count.load(Ordering::Relaxed),
            age: now.saturating_duration_since(entry.stored_at),
            remaining: entry.expires_at.saturating_duration_since(now),
        })
    }

    /// Remove expired entries from every domain
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut total = 0;
        for (domain, cache) in &self.domains {
            let has_expired = cache.entries.load().values().any(|e| e.is_expired(now));
            if !has_expired {
                continue;
            }
            let removed = cache.update(|map| {
                let before = map.len();
                map.retain(|_, entry| !entry.is_expired(now));
                before - map.len()
            });
            cache.evictions.fetch_add(removed as u64, Ordering::Relaxed);
            trace!(%domain, removed, "Swept expired entries");
            total += removed;
        }
        total
    }

    pub fn stats(&self) -> Vec<CacheStats> {
        WorkerType::ALL
            .into_iter()
            .map(|domain| {
                let cache = self.domain(domain);
                CacheStats {
                    domain,
                    entries: cache.entries.load().len(),
                    hits: cache.hits.load(Ordering::Relaxed),
                    misses: cache.misses.load(Ordering::Relaxed),
                    evictions: cache.evictions.load(Ordering::Relaxed),
                }
            })
            .collect()
    }

    /// Drop every entry of every domain
    pub fn clear(&self) {
        for domain in WorkerType::ALL {
            self.invalidate(domain, Scope::All);
        }
    }

    /// Sweep on an interval until a shutdown signal arrives
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            info!(?interval, "Cache sweeper started");
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = cache.sweep();
                        if removed > 0 {
                            debug!(removed, "Cache sweep evicted expired entries");
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("Cache sweeper received shutdown signal");
                        break;
                    }
                }
            }
        })
    }
}
