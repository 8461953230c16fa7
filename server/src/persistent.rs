//! Persistent cache: the in-memory core mirrored onto a disk store.
//!
//! Composition, not inheritance: [`PersistentCache`] owns a [`Cache`] whose
//! backend hooks route set/miss/invalidate/evict/clear through the
//! persistence policy and the on-disk store. The in-memory state is always
//! authoritative; disk failures are logged and absorbed, never surfaced to a
//! request.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cache::{Cache, CacheBackend, CacheConfig, CacheEntry, CacheOptions, CacheStats};
use crate::error::ToolError;
use crate::policy::PersistencePolicy;
use crate::store::{EntryMetadata, PersistStore, PersistedEntry, StoreSnapshot};
use crate::types::Clock;

/// Ceiling on how long a request waits for eager hydration.
const INIT_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Disk backend (the interposition layer)
// ---------------------------------------------------------------------------

struct DiskBackend {
    store: Arc<PersistStore>,
    policy: PersistencePolicy,
    /// Mirror of the in-memory index keyed the way the disk is laid out.
    namespace_index: Mutex<HashMap<String, HashMap<String, CacheEntry>>>,
    /// Raised on any in-memory mutation, cleared when a flush begins.
    dirty: AtomicBool,
    /// Consult the store on miss (lazy mode).
    probe_on_miss: bool,
    clock: Arc<dyn Clock>,
}

impl DiskBackend {
    fn mirror_set(&self, namespace: &str, fingerprint: &str, entry: &CacheEntry) {
        self.namespace_index
            .lock()
            .unwrap()
            .entry(namespace.to_string())
            .or_default()
            .insert(fingerprint.to_string(), entry.clone());
        self.dirty.store(true, Ordering::SeqCst);
    }

    fn mirror_remove(&self, namespace: &str, fingerprint: &str) {
        let mut index = self.namespace_index.lock().unwrap();
        if let Some(entries) = index.get_mut(namespace) {
            entries.remove(fingerprint);
            if entries.is_empty() {
                index.remove(namespace);
            }
        }
    }

    fn snapshot(&self, skip_dead: bool) -> StoreSnapshot {
        let now = self.clock.now_millis();
        let index = self.namespace_index.lock().unwrap();
        let mut snapshot = StoreSnapshot::new();
        for (namespace, entries) in index.iter() {
            for (fingerprint, entry) in entries {
                if skip_dead && entry.is_dead(now) {
                    continue;
                }
                snapshot
                    .entry(namespace.clone())
                    .or_default()
                    .insert(fingerprint.clone(), to_persisted(fingerprint, entry));
            }
        }
        snapshot
    }
}

#[async_trait]
impl CacheBackend for DiskBackend {
    async fn on_set(&self, namespace: &str, fingerprint: &str, entry: &CacheEntry) {
        self.mirror_set(namespace, fingerprint, entry);
        if self.policy.should_persist_on_set(namespace) {
            let persisted = to_persisted(fingerprint, entry);
            if let Err(e) = self.store.save_entry(namespace, fingerprint, &persisted).await {
                warn!(namespace = namespace, error = %e, "Write-through persist failed");
            }
        }
    }

    async fn on_miss(&self, namespace: &str, fingerprint: &str) -> Option<CacheEntry> {
        if !self.probe_on_miss {
            return None;
        }
        let persisted = match self.store.load_entry(namespace, fingerprint).await {
            Ok(found) => found?,
            Err(e) => {
                warn!(namespace = namespace, error = %e, "Disk probe failed on miss");
                return None;
            }
        };
        let entry = from_persisted(&persisted);
        if entry.is_dead(self.clock.now_millis()) {
            if let Err(e) = self.store.remove_entry(namespace, fingerprint).await {
                warn!(namespace = namespace, error = %e, "Failed to drop expired entry");
            }
            return None;
        }
        self.mirror_set(namespace, fingerprint, &entry);
        Some(entry)
    }

    async fn on_invalidate(&self, namespace: &str, fingerprint: &str) {
        self.mirror_remove(namespace, fingerprint);
        if let Err(e) = self.store.remove_entry(namespace, fingerprint).await {
            warn!(namespace = namespace, error = %e, "Failed to remove invalidated entry");
        }
    }

    async fn on_evict(&self, victims: &[(String, String)]) {
        let mut removals = Vec::with_capacity(victims.len());
        for (namespace, fingerprint) in victims {
            self.mirror_remove(namespace, fingerprint);
            removals.push(self.store.remove_entry(namespace, fingerprint));
        }
        for result in futures_util::future::join_all(removals).await {
            if let Err(e) = result {
                warn!(error = %e, "Failed to remove evicted entry from disk");
            }
        }
    }

    async fn on_clear(&self) {
        self.namespace_index.lock().unwrap().clear();
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            if let Err(e) = store.clear().await {
                warn!(error = %e, "Failed to clear persisted cache");
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Persistent cache
// ---------------------------------------------------------------------------

pub struct PersistentCache {
    cache: Cache,
    backend: Arc<DiskBackend>,
    initialized: tokio::sync::watch::Receiver<bool>,
    flush_timer: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl PersistentCache {
    /// Build the layered cache. With `eager_loading`, hydration runs in the
    /// background; requests wait for it with a 10s ceiling and then proceed
    /// against whatever has loaded.
    pub fn new(
        config: CacheConfig,
        policy: PersistencePolicy,
        store: PersistStore,
        clock: Arc<dyn Clock>,
        eager_loading: bool,
    ) -> Self {
        let store = Arc::new(store);
        let backend = Arc::new(DiskBackend {
            store: Arc::clone(&store),
            policy: policy.clone(),
            namespace_index: Mutex::new(HashMap::new()),
            dirty: AtomicBool::new(false),
            probe_on_miss: !eager_loading,
            clock: Arc::clone(&clock),
        });
        let cache = Cache::with_backend(config, clock, backend.clone() as Arc<dyn CacheBackend>);

        let (init_tx, init_rx) = tokio::sync::watch::channel(!eager_loading);
        if eager_loading {
            let cache_bg = cache.clone();
            let backend_bg = Arc::clone(&backend);
            tokio::spawn(async move {
                hydrate(&cache_bg, &backend_bg).await;
                let _ = init_tx.send(true);
            });
        }

        let persistent = Self {
            cache,
            backend,
            initialized: init_rx,
            flush_timer: Mutex::new(None),
        };
        persistent.start_flush_timer(policy.persistence_interval());
        persistent
    }

    fn start_flush_timer(&self, interval: Option<Duration>) {
        let Some(interval) = interval else {
            return;
        };
        let backend = Arc::clone(&self.backend);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                flush(&backend).await;
            }
        });
        *self.flush_timer.lock().unwrap() = Some(handle);
    }

    pub fn is_initialized(&self) -> bool {
        *self.initialized.borrow()
    }

    async fn wait_initialized(&self) {
        let mut rx = self.initialized.clone();
        if *rx.borrow() {
            return;
        }
        let result = tokio::time::timeout(INIT_TIMEOUT, rx.wait_for(|ready| *ready)).await;
        match result {
            Ok(_) => {}
            Err(_) => {
                warn!("Cache hydration exceeded 10s; proceeding with partially loaded cache");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Public surface (delegates to the core after interposition)
    // -----------------------------------------------------------------------

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
        self.wait_initialized().await;
        self.cache.get_or_compute(namespace, arg, compute, opts).await
    }

    pub async fn invalidate<A: Serialize>(&self, namespace: &str, arg: &A) {
        self.cache.invalidate(namespace, arg).await;
    }

    pub async fn clear(&self) {
        self.cache.clear().await;
    }

    pub fn get_stats(&self) -> CacheStats {
        self.cache.get_stats()
    }

    /// Flush in-memory state to disk. No-op when nothing is dirty.
    ///
    /// The dirty flag is cleared before the write begins; a concurrent `set`
    /// re-raises it so the next flush catches the change. A failed write does
    /// not restore the flag — changes pending at that moment ride until the
    /// next `set` or the shutdown flush.
    pub async fn persist_to_disk(&self) {
        flush(&self.backend).await;
    }

    /// Synchronous final flush for process shutdown. Skips dead entries.
    pub fn shutdown_flush(&self) {
        let snapshot = self.backend.snapshot(true);
        self.backend.dirty.store(false, Ordering::SeqCst);
        match self.backend.store.save_all_entries_sync(&snapshot) {
            Ok(()) => {
                let entries: usize = snapshot.values().map(|e| e.len()).sum();
                info!(entries = entries, "Cache flushed on shutdown");
            }
            Err(e) => warn!(error = %e, "Shutdown cache flush failed"),
        }
    }

    /// Stop timers. Called before the shutdown flush.
    pub fn dispose(&self) {
        self.cache.dispose();
        if let Some(handle) = self.flush_timer.lock().unwrap().take() {
            handle.abort();
        }
    }
}

async fn flush(backend: &Arc<DiskBackend>) {
    if !backend.dirty.swap(false, Ordering::SeqCst) {
        return;
    }
    let snapshot = backend.snapshot(false);
    match backend.store.save_all_entries(&snapshot).await {
        Ok(()) => {
            let entries: usize = snapshot.values().map(|e| e.len()).sum();
            debug!(entries = entries, "Periodic cache flush complete");
        }
        Err(e) => warn!(error = %e, "Periodic cache flush failed"),
    }
}

/// Load every persisted entry, skipping dead ones, into both layers.
async fn hydrate(cache: &Cache, backend: &Arc<DiskBackend>) {
    let snapshot = match backend.store.load_all_entries().await {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "Cache hydration failed; starting empty");
            return;
        }
    };
    let now = backend.clock.now_millis();
    let mut loaded = 0usize;
    let mut skipped = 0usize;
    for (namespace, entries) in snapshot {
        for (fingerprint, persisted) in entries {
            let entry = from_persisted(&persisted);
            if entry.is_dead(now) {
                skipped += 1;
                continue;
            }
            backend
                .namespace_index
                .lock()
                .unwrap()
                .entry(namespace.clone())
                .or_default()
                .insert(fingerprint.clone(), entry.clone());
            cache.install_entry(&namespace, &fingerprint, entry, false).await;
            loaded += 1;
        }
    }
    info!(loaded = loaded, expired = skipped, "Cache hydrated from disk");
}

fn to_persisted(fingerprint: &str, entry: &CacheEntry) -> PersistedEntry {
    let size = serde_json::to_string(&entry.value).map(|s| s.len() as u64).unwrap_or(0);
    PersistedEntry {
        key: fingerprint.to_string(),
        value: entry.value.clone(),
        metadata: EntryMetadata {
            created_at: entry.created_at,
            expires_at: entry.expires_at,
            stale_until: entry.stale_until,
            size,
            content_type: Some("application/json".to_string()),
        },
    }
}

fn from_persisted(persisted: &PersistedEntry) -> CacheEntry {
    CacheEntry {
        value: persisted.value.clone(),
        created_at: persisted.metadata.created_at,
        expires_at: persisted.metadata.expires_at,
        stale_until: persisted.metadata.stale_until,
    }
}
