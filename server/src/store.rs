//! Durable on-disk mirror of the cache, one JSON file per entry.
//!
//! Layout:
//!
//! ```text
//! <root>/
//!   metadata.json
//!   namespaces/
//!     <percent-encoded-namespace>/
//!       <fingerprint>.json
//!       <fingerprint>.json.tmp    # transient
//! ```
//!
//! Writes are atomic: the entry is written to a `.tmp` sibling and renamed
//! onto the final path, so a reader never observes a partial file. Corrupt
//! entries self-heal — the file is deleted and the entry reported absent,
//! never surfaced as an error.

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Characters kept verbatim in namespace directory names.
const NAMESPACE_ENCODE: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.');

const METADATA_FILE: &str = "metadata.json";
const NAMESPACES_DIR: &str = "namespaces";
const STORE_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("cache store I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache store serialization: {0}")]
    Serde(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Persisted schema
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntryMetadata {
    #[serde(rename = "createdAt")]
    pub created_at: u64,
    #[serde(rename = "expiresAt")]
    pub expires_at: u64,
    #[serde(rename = "staleUntil")]
    pub stale_until: Option<u64>,
    /// Byte length of the stringified value.
    pub size: u64,
    #[serde(rename = "contentType")]
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedEntry {
    /// The fingerprint — duplicated inside the file for integrity checks.
    pub key: String,
    pub value: Value,
    pub metadata: EntryMetadata,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub version: u32,
    #[serde(rename = "lastPersisted")]
    pub last_persisted: u64,
    pub stats: MetadataStats,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct MetadataStats {
    #[serde(rename = "totalEntries")]
    pub total_entries: u64,
    #[serde(rename = "totalSize")]
    pub total_size: u64,
}

/// `namespace → fingerprint → entry`, the unit of bulk save/load.
pub type StoreSnapshot = HashMap<String, HashMap<String, PersistedEntry>>;

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct PersistStore {
    root: PathBuf,
}

impl PersistStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn namespace_dir(&self, namespace: &str) -> PathBuf {
        let encoded = utf8_percent_encode(namespace, NAMESPACE_ENCODE).to_string();
        self.root.join(NAMESPACES_DIR).join(encoded)
    }

    fn entry_path(&self, namespace: &str, fingerprint: &str) -> PathBuf {
        self.namespace_dir(namespace).join(format!("{fingerprint}.json"))
    }

    /// Atomically write one entry: `.tmp` sibling, then rename.
    pub async fn save_entry(
        &self,
        namespace: &str,
        fingerprint: &str,
        entry: &PersistedEntry,
    ) -> Result<(), StoreError> {
        let dir = self.namespace_dir(namespace);
        tokio::fs::create_dir_all(&dir).await?;

        let final_path = self.entry_path(namespace, fingerprint);
        let tmp_path = dir.join(format!("{fingerprint}.json.tmp"));

        let bytes = serde_json::to_vec(entry)?;
        tokio::fs::write(&tmp_path, &bytes).await?;
        tokio::fs::rename(&tmp_path, &final_path).await?;
        Ok(())
    }

    /// Load one entry. Absent files return `None`; corrupt files are deleted
    /// and also return `None` — parse failures never reach the caller.
    pub async fn load_entry(
        &self,
        namespace: &str,
        fingerprint: &str,
    ) -> Result<Option<PersistedEntry>, StoreError> {
        let path = self.entry_path(namespace, fingerprint);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice::<PersistedEntry>(&bytes) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                warn!(
                    namespace = namespace,
                    fingerprint = fingerprint,
                    error = %e,
                    "Corrupt cache entry, deleting"
                );
                let _ = tokio::fs::remove_file(&path).await;
                Ok(None)
            }
        }
    }

    /// Bulk save: every entry in the snapshot in parallel, then metadata.
    pub async fn save_all_entries(&self, snapshot: &StoreSnapshot) -> Result<(), StoreError> {
        let mut writes = Vec::new();
        for (namespace, entries) in snapshot {
            for (fingerprint, entry) in entries {
                writes.push(self.save_entry(namespace, fingerprint, entry));
            }
        }
        for result in futures_util::future::join_all(writes).await {
            result?;
        }
        self.write_metadata(snapshot).await
    }

    /// Scan every namespace directory, skipping hidden, temporary, and
    /// non-JSON files. Corrupt entries are logged and skipped.
    pub async fn load_all_entries(&self) -> Result<StoreSnapshot, StoreError> {
        let mut snapshot = StoreSnapshot::new();
        let namespaces_dir = self.root.join(NAMESPACES_DIR);

        let mut dirs = match tokio::fs::read_dir(&namespaces_dir).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(snapshot),
            Err(e) => return Err(e.into()),
        };

        while let Some(dir_entry) = dirs.next_entry().await? {
            if !dir_entry.file_type().await?.is_dir() {
                continue;
            }
            let encoded = dir_entry.file_name().to_string_lossy().into_owned();
            if encoded.starts_with('.') {
                continue;
            }
            let namespace = percent_decode_str(&encoded).decode_utf8_lossy().into_owned();

            let mut files = tokio::fs::read_dir(dir_entry.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let name = file.file_name().to_string_lossy().into_owned();
                if name.starts_with('.') || !name.ends_with(".json") {
                    continue;
                }
                let fingerprint = name.trim_end_matches(".json").to_string();
                match self.load_entry(&namespace, &fingerprint).await? {
                    Some(entry) => {
                        snapshot
                            .entry(namespace.clone())
                            .or_default()
                            .insert(fingerprint, entry);
                    }
                    None => {
                        debug!(
                            namespace = namespace.as_str(),
                            fingerprint = fingerprint.as_str(),
                            "Skipped unreadable cache entry during hydration"
                        );
                    }
                }
            }
        }
        Ok(snapshot)
    }

    /// Idempotent delete: "not found" is success.
    pub async fn remove_entry(&self, namespace: &str, fingerprint: &str) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.entry_path(namespace, fingerprint)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove every namespace directory and rewrite empty metadata.
    pub async fn clear(&self) -> Result<(), StoreError> {
        match tokio::fs::remove_dir_all(self.root.join(NAMESPACES_DIR)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.write_metadata(&StoreSnapshot::new()).await
    }

    async fn write_metadata(&self, snapshot: &StoreSnapshot) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.root).await?;
        let metadata = self.build_metadata(snapshot);
        let bytes = serde_json::to_vec_pretty(&metadata)?;
        let tmp = self.root.join(format!("{METADATA_FILE}.tmp"));
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, self.root.join(METADATA_FILE)).await?;
        Ok(())
    }

    pub async fn load_metadata(&self) -> Result<Option<CacheMetadata>, StoreError> {
        let bytes = match tokio::fs::read(self.root.join(METADATA_FILE)).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&bytes).ok())
    }

    fn build_metadata(&self, snapshot: &StoreSnapshot) -> CacheMetadata {
        let total_entries = snapshot.values().map(|e| e.len() as u64).sum();
        let total_size = snapshot
            .values()
            .flat_map(|e| e.values())
            .map(|entry| entry.metadata.size)
            .sum();
        CacheMetadata {
            version: STORE_VERSION,
            last_persisted: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
            stats: MetadataStats { total_entries, total_size },
        }
    }

    // -----------------------------------------------------------------------
    // Synchronous path for shutdown
    // -----------------------------------------------------------------------

    /// Shutdown flush. Must not await: the process is terminating and the
    /// async runtime may already be winding down.
    pub fn save_all_entries_sync(&self, snapshot: &StoreSnapshot) -> Result<(), StoreError> {
        for (namespace, entries) in snapshot {
            let dir = self.namespace_dir(namespace);
            std::fs::create_dir_all(&dir)?;
            for (fingerprint, entry) in entries {
                let tmp = dir.join(format!("{fingerprint}.json.tmp"));
                let final_path = dir.join(format!("{fingerprint}.json"));
                std::fs::write(&tmp, serde_json::to_vec(entry)?)?;
                std::fs::rename(&tmp, &final_path)?;
            }
        }
        let metadata = self.build_metadata(snapshot);
        std::fs::create_dir_all(&self.root)?;
        let tmp = self.root.join(format!("{METADATA_FILE}.tmp"));
        std::fs::write(&tmp, serde_json::to_vec_pretty(&metadata)?)?;
        std::fs::rename(&tmp, self.root.join(METADATA_FILE))?;
        Ok(())
    }
}
