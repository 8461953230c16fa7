//! Persistence policy: pure decisions about when cache entries hit disk.
//!
//! A policy never performs I/O itself; the persistent cache consults it on
//! every set/get and drives the periodic and shutdown flushes.

use std::time::Duration;

/// When should an entry be mirrored to the persistence store?
#[derive(Debug, Clone)]
pub enum PersistencePolicy {
    /// Every set is written through immediately. For critical data.
    WriteThrough { namespaces: Vec<String> },
    /// Writes are batched into a periodic flush. High-write, moderate durability.
    Periodic { namespaces: Vec<String>, interval: Duration },
    /// Nothing is written until shutdown. Ephemeral data.
    OnShutdown { namespaces: Vec<String> },
    /// Write-through for `critical` namespaces, periodic flush for the rest.
    Hybrid { namespaces: Vec<String>, critical: Vec<String>, interval: Duration },
}

impl PersistencePolicy {
    /// Shared namespace whitelist check. An empty whitelist means "all".
    pub fn should_persist_namespace(&self, namespace: &str) -> bool {
        let namespaces = match self {
            PersistencePolicy::WriteThrough { namespaces }
            | PersistencePolicy::Periodic { namespaces, .. }
            | PersistencePolicy::OnShutdown { namespaces }
            | PersistencePolicy::Hybrid { namespaces, .. } => namespaces,
        };
        namespaces.is_empty() || namespaces.iter().any(|n| n == namespace)
    }

    /// Should this set be written through immediately?
    pub fn should_persist_on_set(&self, namespace: &str) -> bool {
        match self {
            PersistencePolicy::WriteThrough { .. } => self.should_persist_namespace(namespace),
            PersistencePolicy::Hybrid { critical, .. } => {
                self.should_persist_namespace(namespace)
                    && critical.iter().any(|n| n == namespace)
            }
            PersistencePolicy::Periodic { .. } | PersistencePolicy::OnShutdown { .. } => false,
        }
    }

    /// Should a read refresh the persisted copy? None of the built-in
    /// variants do; the hook exists for custom policies layered on top.
    pub fn should_persist_on_get(&self, _namespace: &str) -> bool {
        false
    }

    /// Interval for the periodic flush timer, when the variant has one.
    pub fn persistence_interval(&self) -> Option<Duration> {
        match self {
            PersistencePolicy::Periodic { interval, .. }
            | PersistencePolicy::Hybrid { interval, .. } => Some(*interval),
            PersistencePolicy::WriteThrough { .. } | PersistencePolicy::OnShutdown { .. } => None,
        }
    }

    /// Shutdown hook. Intentionally a no-op: the shutdown flush is driven by
    /// the persistent cache, which always writes regardless of variant.
    pub async fn on_shutdown(&self) {}
}
