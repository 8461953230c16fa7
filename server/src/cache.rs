//! In-memory TTL cache with stale-while-revalidate, single-flight coalescing,
//! and LRU eviction.
//!
//! The cache stores JSON values keyed by `namespace:fingerprint`. Concurrent
//! misses on the same key share one running computation; stale hits are
//! served immediately while a background task refreshes the entry. A
//! pluggable [`CacheBackend`] lets the persistent layer interpose on set,
//! miss, invalidate, evict, and clear without the core knowing about disks.

use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde::de::DeserializeOwned;
use serde::{Serialize, Serializer};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::ToolError;
use crate::fingerprint::{fingerprint, full_key};
use crate::types::Clock;

/// Default stale window when SWR is requested without an explicit stale time.
pub const DEFAULT_STALE_TIME: Duration = Duration::from_secs(24 * 60 * 60);

/// Expiry sweep period.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Entries and options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub value: Value,
    pub created_at: u64,
    pub expires_at: u64,
    pub stale_until: Option<u64>,
}

impl CacheEntry {
    pub fn is_fresh(&self, now: u64) -> bool {
        now < self.expires_at
    }

    /// Expired but still within the stale window. `stale_until` is
    /// authoritative no matter which caller wrote it.
    pub fn is_stale(&self, now: u64) -> bool {
        !self.is_fresh(now) && self.stale_until.is_some_and(|s| now < s)
    }

    pub fn is_dead(&self, now: u64) -> bool {
        !self.is_fresh(now) && !self.is_stale(now)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CacheOptions {
    /// Entry lifetime; falls back to the cache-wide default.
    pub ttl: Option<Duration>,
    /// Serve expired entries while refreshing in the background.
    pub stale_while_revalidate: bool,
    /// Stale window appended after `ttl`; defaults to [`DEFAULT_STALE_TIME`].
    pub stale_time: Option<Duration>,
}

impl CacheOptions {
    pub fn ttl(ttl: Duration) -> Self {
        Self { ttl: Some(ttl), ..Self::default() }
    }

    pub fn with_swr(mut self, stale_time: Duration) -> Self {
        self.stale_while_revalidate = true;
        self.stale_time = Some(stale_time);
        self
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub default_ttl: Duration,
    pub max_size: usize,
    /// `None` disables the background expiry sweeper (tests).
    pub sweep_interval: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
            max_size: 1000,
            sweep_interval: Some(SWEEP_INTERVAL),
        }
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Monotonic counters. Preserved across `clear()`; reset only on restart.
#[derive(Default)]
pub struct CacheMetrics {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub errors: AtomicU64,
    pub evictions: AtomicU64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub evictions: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub size: usize,
    #[serde(rename = "pendingPromises")]
    pub pending_computes: usize,
    pub metrics: MetricsSnapshot,
    /// `hits / (hits + misses)` to two decimals, or `"N/A"`.
    #[serde(rename = "hitRatio", serialize_with = "serialize_hit_ratio")]
    pub hit_ratio: Option<f64>,
}

fn serialize_hit_ratio<S: Serializer>(v: &Option<f64>, s: S) -> Result<S::Ok, S::Error> {
    match v {
        Some(r) => s.serialize_str(&format!("{r:.2}")),
        None => s.serialize_str("N/A"),
    }
}

// ---------------------------------------------------------------------------
// Backend interposition
// ---------------------------------------------------------------------------

/// Hooks the persistent layer implements. The no-op default makes the core
/// cache purely in-memory.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// A fresh entry was written (compute result or revalidation).
    async fn on_set(&self, _namespace: &str, _fingerprint: &str, _entry: &CacheEntry) {}

    /// In-memory miss; a lazy backend may hydrate from disk here.
    async fn on_miss(&self, _namespace: &str, _fingerprint: &str) -> Option<CacheEntry> {
        None
    }

    async fn on_invalidate(&self, _namespace: &str, _fingerprint: &str) {}

    /// LRU victims, as `(namespace, fingerprint)` pairs.
    async fn on_evict(&self, _victims: &[(String, String)]) {}

    async fn on_clear(&self) {}
}

pub struct NoopBackend;

#[async_trait]
impl CacheBackend for NoopBackend {}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

type SharedCompute = Shared<BoxFuture<'static, Result<Value, ToolError>>>;

struct CacheInner {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    backend: Arc<dyn CacheBackend>,
    index: Mutex<HashMap<String, CacheEntry>>,
    access_log: Mutex<HashMap<String, u64>>,
    inflight: Mutex<HashMap<String, SharedCompute>>,
    revalidating: Mutex<HashSet<String>>,
    metrics: CacheMetrics,
    sweeper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Cheap-clone handle; all state lives behind the `Arc`.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<CacheInner>,
}

impl Cache {
    pub fn new(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self::with_backend(config, clock, Arc::new(NoopBackend))
    }

    pub fn with_backend(
        config: CacheConfig,
        clock: Arc<dyn Clock>,
        backend: Arc<dyn CacheBackend>,
    ) -> Self {
        let cache = Self {
            inner: Arc::new(CacheInner {
                config,
                clock,
                backend,
                index: Mutex::new(HashMap::new()),
                access_log: Mutex::new(HashMap::new()),
                inflight: Mutex::new(HashMap::new()),
                revalidating: Mutex::new(HashSet::new()),
                metrics: CacheMetrics::default(),
                sweeper: Mutex::new(None),
            }),
        };
        cache.start_sweeper();
        cache
    }

    /// Spawn the periodic expiry sweep. The task holds only a weak handle so
    /// it cannot keep the cache (or the process) alive by itself.
    fn start_sweeper(&self) {
        let Some(interval) = self.inner.config.sweep_interval else {
            return;
        };
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                Cache { inner }.clean_expired();
            }
        });
        *self.inner.sweeper.lock().unwrap() = Some(handle);
    }

    fn now(&self) -> u64 {
        self.inner.clock.now_millis()
    }

    // -----------------------------------------------------------------------
    // Public operations
    // -----------------------------------------------------------------------

    /// Fetch-or-compute with promise coalescing.
    ///
    /// At most one concurrent execution of `compute` runs per key; concurrent
    /// arrivals await the in-flight computation and observe its result.
    /// Compute errors propagate to every awaiter and are never cached.
    pub async fn get_or_compute<T, A, F, Fut>(
        &self,
        namespace: &str,
        arg: &A,
        compute: F,
        opts: CacheOptions,
    ) -> Result<T, ToolError>
    where
        T: Serialize + DeserializeOwned,
        A: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ToolError>> + Send + 'static,
    {
        let fp = fingerprint(namespace, arg);
        let full = full_key(namespace, &fp);
        let now = self.now();

        // Look up in memory, falling back to the backend's lazy probe. The
        // access log refresh is a side effect of the lookup.
        let entry = match self.get(&full) {
            Some(e) => Some(e),
            None => match self.inner.backend.on_miss(namespace, &fp).await {
                Some(e) if !e.is_dead(now) => {
                    self.install_entry(namespace, &fp, e.clone(), false).await;
                    Some(e)
                }
                _ => None,
            },
        };

        if let Some(entry) = entry {
            if entry.is_fresh(now) {
                self.inner.metrics.hits.fetch_add(1, Ordering::Relaxed);
                return decode(entry.value);
            }
            if entry.is_stale(now) && opts.stale_while_revalidate {
                self.inner.metrics.hits.fetch_add(1, Ordering::Relaxed);
                self.schedule_revalidation(namespace, &fp, &full, compute, &opts);
                return decode(entry.value);
            }
        }

        // Miss or dead entry.
        self.inner.metrics.misses.fetch_add(1, Ordering::Relaxed);

        let (shared, installed) = {
            let mut inflight = self.inner.inflight.lock().unwrap();
            match inflight.get(&full) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let fut = compute();
                    let shared: SharedCompute = async move {
                        let value = fut.await?;
                        serde_json::to_value(value)
                            .map_err(|e| ToolError::Serialization(e.to_string()))
                    }
                    .boxed()
                    .shared();
                    inflight.insert(full.clone(), shared.clone());
                    (shared, true)
                }
            }
        };

        let result = shared.await;

        if installed {
            match &result {
                Ok(value) => {
                    let entry = self.build_entry(value.clone(), &opts);
                    self.install_entry(namespace, &fp, entry, true).await;
                }
                Err(_) => {
                    self.inner.metrics.errors.fetch_add(1, Ordering::Relaxed);
                }
            }
            // Removed last so late arrivals join the shared result instead of
            // racing the entry write.
            self.inner.inflight.lock().unwrap().remove(&full);
        }

        result.and_then(decode)
    }

    /// Remove the entry from the index and access log. In-flight
    /// computations are unaffected.
    pub async fn invalidate<A: Serialize>(&self, namespace: &str, arg: &A) {
        let fp = fingerprint(namespace, arg);
        let full = full_key(namespace, &fp);
        self.inner.index.lock().unwrap().remove(&full);
        self.inner.access_log.lock().unwrap().remove(&full);
        self.inner.backend.on_invalidate(namespace, &fp).await;
    }

    /// Empty the cache. Cumulative counters are preserved.
    pub async fn clear(&self) {
        self.inner.index.lock().unwrap().clear();
        self.inner.access_log.lock().unwrap().clear();
        self.inner.inflight.lock().unwrap().clear();
        self.inner.revalidating.lock().unwrap().clear();
        self.inner.backend.on_clear().await;
    }

    pub fn get_stats(&self) -> CacheStats {
        let m = &self.inner.metrics;
        let hits = m.hits.load(Ordering::Relaxed);
        let misses = m.misses.load(Ordering::Relaxed);
        let hit_ratio =
            if hits + misses == 0 { None } else { Some(hits as f64 / (hits + misses) as f64) };
        CacheStats {
            size: self.inner.index.lock().unwrap().len(),
            pending_computes: self.inner.inflight.lock().unwrap().len(),
            metrics: MetricsSnapshot {
                hits,
                misses,
                errors: m.errors.load(Ordering::Relaxed),
                evictions: m.evictions.load(Ordering::Relaxed),
            },
            hit_ratio,
        }
    }

    /// Stop the expiry sweeper.
    pub fn dispose(&self) {
        if let Some(handle) = self.inner.sweeper.lock().unwrap().take() {
            handle.abort();
        }
    }

    // -----------------------------------------------------------------------
    // Internal operations (shared with the persistent composition)
    // -----------------------------------------------------------------------

    /// Raw read: refreshes the access log on hit, does not check expiry.
    pub(crate) fn get(&self, full: &str) -> Option<CacheEntry> {
        let entry = self.inner.index.lock().unwrap().get(full).cloned()?;
        self.inner.access_log.lock().unwrap().insert(full.to_string(), self.now());
        Some(entry)
    }

    pub(crate) fn build_entry(&self, value: Value, opts: &CacheOptions) -> CacheEntry {
        let now = self.now();
        let ttl = opts.ttl.unwrap_or(self.inner.config.default_ttl);
        let expires_at = now + ttl.as_millis() as u64;
        let stale_until = opts.stale_while_revalidate.then(|| {
            expires_at + opts.stale_time.unwrap_or(DEFAULT_STALE_TIME).as_millis() as u64
        });
        CacheEntry { value, created_at: now, expires_at, stale_until }
    }

    /// Insert an entry, refresh its access timestamp, evict LRU victims when
    /// over capacity, and (unless hydrating) notify the backend.
    pub(crate) async fn install_entry(
        &self,
        namespace: &str,
        fingerprint: &str,
        entry: CacheEntry,
        notify_backend: bool,
    ) {
        let full = full_key(namespace, fingerprint);
        let over_capacity = {
            let mut index = self.inner.index.lock().unwrap();
            index.insert(full.clone(), entry.clone());
            index.len() > self.inner.config.max_size
        };
        self.inner.access_log.lock().unwrap().insert(full, self.now());

        if over_capacity {
            let batch = (self.inner.config.max_size as f64 * 0.2).floor() as usize;
            // Batch is 0 for max_size < 5; evict one so the size bound holds.
            self.evict_lru(batch.max(1)).await;
        }

        if notify_backend {
            self.inner.backend.on_set(namespace, fingerprint, &entry).await;
        }
    }

    /// Delete entries whose `expires_at` has passed, stale window included.
    pub(crate) fn clean_expired(&self) {
        let now = self.now();
        let mut index = self.inner.index.lock().unwrap();
        let before = index.len();
        index.retain(|_, e| e.is_fresh(now));
        let removed = before - index.len();
        drop(index);
        if removed > 0 {
            let index = self.inner.index.lock().unwrap();
            self.inner.access_log.lock().unwrap().retain(|k, _| index.contains_key(k));
            debug!(removed = removed, "Expiry sweep removed dead entries");
        }
    }

    /// Evict the `n` least-recently-used entries.
    pub(crate) async fn evict_lru(&self, n: usize) {
        if n == 0 {
            return;
        }
        let victims: Vec<(String, String)> = {
            let access_log = self.inner.access_log.lock().unwrap();
            let mut by_age: Vec<(&String, &u64)> = access_log.iter().collect();
            by_age.sort_by_key(|(_, ts)| **ts);
            by_age
                .iter()
                .take(n)
                .filter_map(|(k, _)| {
                    crate::fingerprint::split_key(k).map(|(ns, fp)| (ns.to_string(), fp.to_string()))
                })
                .collect()
        };
        if victims.is_empty() {
            return;
        }

        let mut removed = 0u64;
        {
            let mut index = self.inner.index.lock().unwrap();
            let mut access_log = self.inner.access_log.lock().unwrap();
            for (ns, fp) in &victims {
                let full = full_key(ns, fp);
                if index.remove(&full).is_some() {
                    removed += 1;
                }
                access_log.remove(&full);
            }
        }
        self.inner.metrics.evictions.fetch_add(removed, Ordering::Relaxed);
        debug!(evicted = removed, "LRU eviction");

        self.inner.backend.on_evict(&victims).await;
    }

    /// Fire-and-forget refresh of a stale entry. Runs `compute` without
    /// coalescing; failures are logged and the stale entry stays in place.
    fn schedule_revalidation<T, F, Fut>(
        &self,
        namespace: &str,
        fp: &str,
        full: &str,
        compute: F,
        opts: &CacheOptions,
    ) where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ToolError>> + Send + 'static,
    {
        {
            let inflight = self.inner.inflight.lock().unwrap();
            let mut revalidating = self.inner.revalidating.lock().unwrap();
            if inflight.contains_key(full) || !revalidating.insert(full.to_string()) {
                return;
            }
        }

        let cache = self.clone();
        let namespace = namespace.to_string();
        let fp = fp.to_string();
        let full = full.to_string();
        let opts = opts.clone();
        let fut = compute();
        tokio::spawn(async move {
            let result = fut.await.and_then(|v| {
                serde_json::to_value(v).map_err(|e| ToolError::Serialization(e.to_string()))
            });
            match result {
                Ok(value) => {
                    let entry = cache.build_entry(value, &opts);
                    cache.install_entry(&namespace, &fp, entry, true).await;
                }
                Err(e) => {
                    warn!(key = full.as_str(), error = %e, "Background revalidation failed");
                }
            }
            cache.inner.revalidating.lock().unwrap().remove(&full);
        });
    }

    // Introspection for tests and stats endpoints.

    pub fn len(&self) -> usize {
        self.inner.index.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains_access_log(&self, namespace: &str, fp: &str) -> bool {
        self.inner.access_log.lock().unwrap().contains_key(&full_key(namespace, fp))
    }
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, ToolError> {
    serde_json::from_value(value).map_err(|e| ToolError::Serialization(e.to_string()))
}
