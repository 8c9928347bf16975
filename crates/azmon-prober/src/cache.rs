//! Response caches with per-entry expiry and LRU eviction.
//!
//! Each cache maps a request [`Signature`] to an immutable `Arc` payload.
//! Entries are replaced, never mutated, so a payload handed out to one
//! request stays valid while another request refreshes the entry. Expired
//! entries are removed lazily on access; when the cache is full, expired
//! entries are purged first and then the least-recently-used entry is
//! evicted.
//!
//! Hits, misses, and evictions are counted and exported on `/metrics`.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use azmon_core::{CacheConfig, MetricSample, ResolvedTarget, Signature};
use azmon_metrics::CacheStats;
use tracing::debug;

/// A single cached payload.
struct CacheEntry<V> {
    payload: Arc<V>,
    expires_at: Instant,
    /// Last access, as nanos since the cache epoch.
    last_accessed: u64,
}

struct CacheState<V> {
    entries: HashMap<Signature, CacheEntry<V>>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// Thread-safe TTL cache keyed by request signature.
pub struct ResponseCache<V> {
    name: &'static str,
    enabled: bool,
    ttl: Duration,
    max_entries: usize,
    epoch: Instant,
    state: Mutex<CacheState<V>>,
}

impl<V> ResponseCache<V> {
    pub fn new(name: &'static str, config: &CacheConfig) -> Self {
        Self {
            name,
            enabled: config.enabled,
            ttl: config.ttl,
            max_entries: config.max_entries.max(1),
            epoch: Instant::now(),
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
        }
    }

    /// Replace the default entry lifetime.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn lock(&self) -> MutexGuard<'_, CacheState<V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn now_nanos(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    /// Look up a signature. Returns `None` on miss, expiry, or when disabled.
    pub fn get(&self, signature: &Signature) -> Option<Arc<V>> {
        if !self.enabled {
            return None;
        }
        let now = self.now_nanos();
        let mut guard = self.lock();
        let state = &mut *guard;

        let expired = match state.entries.get_mut(signature) {
            Some(entry) if entry.expires_at > Instant::now() => {
                entry.last_accessed = now;
                let payload = entry.payload.clone();
                state.hits += 1;
                return Some(payload);
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            state.entries.remove(signature);
        }
        state.misses += 1;
        debug!(cache = self.name, %signature, expired, "cache miss");
        None
    }

    /// Insert or replace an entry. `ttl` overrides the configured lifetime.
    pub fn insert(&self, signature: Signature, payload: Arc<V>, ttl: Option<Duration>) {
        if !self.enabled {
            return;
        }
        let ttl = ttl.unwrap_or(self.ttl);
        let Some(expires_at) = Instant::now().checked_add(ttl) else {
            debug!(cache = self.name, ttl_secs = ttl.as_secs(), "ttl out of range, not caching");
            return;
        };
        let now = self.now_nanos();
        let mut guard = self.lock();
        let state = &mut *guard;

        if !state.entries.contains_key(&signature) && state.entries.len() >= self.max_entries {
            self.make_room(state);
        }

        state.entries.insert(
            signature,
            CacheEntry {
                payload,
                expires_at,
                last_accessed: now,
            },
        );
    }

    /// Return the cached payload, or run `fetch` and cache its result.
    ///
    /// Errors are returned to the caller and never cached.
    pub async fn get_or_fetch<F, Fut, E>(
        &self,
        signature: Signature,
        ttl: Option<Duration>,
        fetch: F,
    ) -> Result<Arc<V>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(hit) = self.get(&signature) {
            return Ok(hit);
        }
        let payload = Arc::new(fetch().await?);
        self.insert(signature, payload.clone(), ttl);
        Ok(payload)
    }

    fn make_room(&self, state: &mut CacheState<V>) {
        let now = Instant::now();
        let before = state.entries.len();
        state.entries.retain(|_, e| e.expires_at > now);
        let purged = before - state.entries.len();
        if purged > 0 {
            debug!(cache = self.name, purged, "purged expired cache entries");
            return;
        }

        let lru = state
            .entries
            .iter()
            .min_by_key(|(_, e)| e.last_accessed)
            .map(|(k, _)| k.clone());
        if let Some(key) = lru {
            state.entries.remove(&key);
            state.evictions += 1;
            debug!(cache = self.name, evictions = state.evictions, "cache LRU eviction");
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        CacheStats {
            cache: self.name,
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            entries: state.entries.len(),
        }
    }
}

/// The process-wide caches shared by every probe request.
pub struct Caches {
    /// Target lists keyed by mode + filter/query/type + subscriptions.
    pub resolution: ResponseCache<Vec<ResolvedTarget>>,
    /// Metric samples keyed by target + metric query.
    pub metrics: ResponseCache<Vec<MetricSample>>,
    /// Tag values keyed by resource + tag keys.
    pub tags: ResponseCache<BTreeMap<String, String>>,
}

impl Caches {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            resolution: ResponseCache::new("resolution", config).with_ttl(config.resolution_ttl),
            metrics: ResponseCache::new("metrics", config),
            tags: ResponseCache::new("tags", config),
        }
    }

    pub fn stats(&self) -> Vec<CacheStats> {
        vec![
            self.resolution.stats(),
            self.metrics.stats(),
            self.tags.stats(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use azmon_core::SignatureBuilder;
    use std::thread;

    fn config(ttl: Duration, max_entries: usize) -> CacheConfig {
        CacheConfig {
            enabled: true,
            ttl,
            resolution_ttl: ttl,
            max_entries,
        }
    }

    fn sig(s: &str) -> Signature {
        SignatureBuilder::new("test").field("k", s).finish()
    }

    #[test]
    fn insert_and_get() {
        let cache = ResponseCache::new("t", &config(Duration::from_secs(30), 16));
        cache.insert(sig("a"), Arc::new(1u32), None);
        assert_eq!(cache.get(&sig("a")).as_deref(), Some(&1));
        assert!(cache.get(&sig("b")).is_none());
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[test]
    fn disabled_cache_never_stores() {
        let cache = ResponseCache::new(
            "t",
            &CacheConfig {
                enabled: false,
                ..config(Duration::from_secs(30), 16)
            },
        );
        cache.insert(sig("a"), Arc::new(1u32), None);
        assert!(cache.get(&sig("a")).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn entry_expires_after_ttl() {
        let cache = ResponseCache::new("t", &config(Duration::from_millis(50), 16));
        cache.insert(sig("a"), Arc::new(1u32), None);
        assert!(cache.get(&sig("a")).is_some());

        thread::sleep(Duration::from_millis(80));

        assert!(cache.get(&sig("a")).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn per_entry_ttl_overrides_default() {
        let cache = ResponseCache::new("t", &config(Duration::from_secs(30), 16));
        cache.insert(sig("short"), Arc::new(1u32), Some(Duration::from_millis(30)));
        cache.insert(sig("long"), Arc::new(2u32), None);

        thread::sleep(Duration::from_millis(60));

        assert!(cache.get(&sig("short")).is_none());
        assert!(cache.get(&sig("long")).is_some());
    }

    #[test]
    fn replacing_keeps_old_payload_alive() {
        let cache = ResponseCache::new("t", &config(Duration::from_secs(30), 16));
        cache.insert(sig("a"), Arc::new(vec![1]), None);
        let held = cache.get(&sig("a")).unwrap();
        cache.insert(sig("a"), Arc::new(vec![2]), None);

        assert_eq!(*held, vec![1]);
        assert_eq!(*cache.get(&sig("a")).unwrap(), vec![2]);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn evicts_lru_when_full() {
        let cache = ResponseCache::new("t", &config(Duration::from_secs(30), 2));
        cache.insert(sig("a"), Arc::new(1u32), None);
        thread::sleep(Duration::from_millis(5));
        cache.insert(sig("b"), Arc::new(2u32), None);
        thread::sleep(Duration::from_millis(5));

        // Touch a so b becomes least recently used.
        cache.get(&sig("a"));
        thread::sleep(Duration::from_millis(5));
        cache.insert(sig("c"), Arc::new(3u32), None);

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&sig("a")).is_some());
        assert!(cache.get(&sig("b")).is_none());
        assert!(cache.get(&sig("c")).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn full_cache_purges_expired_before_evicting() {
        let cache = ResponseCache::new("t", &config(Duration::from_secs(30), 2));
        cache.insert(sig("old"), Arc::new(1u32), Some(Duration::from_millis(10)));
        cache.insert(sig("live"), Arc::new(2u32), None);
        thread::sleep(Duration::from_millis(30));

        cache.insert(sig("new"), Arc::new(3u32), None);

        assert!(cache.get(&sig("live")).is_some());
        assert!(cache.get(&sig("new")).is_some());
        assert_eq!(cache.stats().evictions, 0);
    }

    #[tokio::test]
    async fn get_or_fetch_calls_once_within_ttl() {
        let cache: ResponseCache<u32> = ResponseCache::new("t", &config(Duration::from_secs(30), 16));
        let mut calls = 0;

        for _ in 0..3 {
            let value = cache
                .get_or_fetch(sig("a"), None, || {
                    calls += 1;
                    async { Ok::<_, ()>(7) }
                })
                .await
                .unwrap();
            assert_eq!(*value, 7);
        }
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn get_or_fetch_does_not_cache_errors() {
        let cache: ResponseCache<u32> = ResponseCache::new("t", &config(Duration::from_secs(30), 16));
        let first = cache
            .get_or_fetch(sig("a"), None, || async { Err::<u32, _>("boom") })
            .await;
        assert_eq!(first, Err("boom"));
        assert!(cache.is_empty());
    }

    #[test]
    fn unrepresentable_ttl_skips_caching() {
        let cache = ResponseCache::new("t", &config(Duration::from_secs(30), 16));
        cache.insert(sig("a"), Arc::new(1u32), Some(Duration::from_secs(u64::MAX)));
        assert!(cache.is_empty());

        let cache = ResponseCache::<u32>::new("t", &config(Duration::MAX, 16));
        cache.insert(sig("a"), Arc::new(1), None);
        assert!(cache.get(&sig("a")).is_none());
    }

    #[test]
    fn resolution_cache_uses_its_own_ttl() {
        let caches = Caches::new(&CacheConfig {
            resolution_ttl: Duration::from_secs(1800),
            ..config(Duration::from_secs(60), 16)
        });
        assert_eq!(caches.resolution.ttl(), Duration::from_secs(1800));
        assert_eq!(caches.metrics.ttl(), Duration::from_secs(60));
        assert_eq!(caches.tags.ttl(), Duration::from_secs(60));
    }

    #[test]
    fn caches_report_stats_per_cache() {
        let caches = Caches::new(&config(Duration::from_secs(30), 16));
        let names: Vec<_> = caches.stats().iter().map(|s| s.cache).collect();
        assert_eq!(names, vec!["resolution", "metrics", "tags"]);
    }
}
