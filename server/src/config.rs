//! Configuration surface: CLI flags > environment > TOML file > defaults.
//!
//! The optional config file is `websearch.toml` in the working directory (or
//! the path given with `--config`). API credentials only come from the
//! environment so they never land in a checked-in file.

use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::events::{EventStoreConfig, DEFAULT_EVENT_TTL, DEFAULT_MAX_EVENTS_PER_STREAM};
use crate::policy::PersistencePolicy;
use crate::ssrf::SsrfPolicy;

pub const DEFAULT_STORAGE_DIR: &str = ".websearch-cache";
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_SIZE: usize = 1000;
pub const DEFAULT_PERSISTENCE_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyMode {
    WriteThrough,
    Periodic,
    OnShutdown,
    Hybrid,
}

/// Raw shape of `websearch.toml`. All fields optional; [`Settings`] applies
/// defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub storage_path: Option<PathBuf>,
    pub default_ttl_secs: Option<u64>,
    pub max_size: Option<usize>,
    pub persistence_mode: Option<PolicyMode>,
    pub persistence_interval_secs: Option<u64>,
    pub persistent_namespaces: Option<Vec<String>>,
    pub critical_namespaces: Option<Vec<String>>,
    pub eager_loading: Option<bool>,
    pub event_ttl_secs: Option<u64>,
    pub max_events_per_stream: Option<usize>,
    pub critical_stream_ids: Option<Vec<String>>,
    /// Hex-encoded 64-byte AES-256-SIV key for at-rest event encryption.
    pub event_encryption_key: Option<String>,
    pub ssrf_allowed_hosts: Option<Vec<String>>,
    pub ssrf_block_private: Option<bool>,
    pub ssrf_block_loopback: Option<bool>,
    pub transcript_language: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Self {
        let raw = match std::fs::read_to_string(path) {
            Ok(r) => r,
            Err(_) => return Self::default(),
        };
        match toml::from_str(&raw) {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unparsable config file");
                Self::default()
            }
        }
    }
}

/// Fully resolved runtime settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub storage_path: PathBuf,
    pub default_ttl: Duration,
    pub max_size: usize,
    pub persistence_mode: PolicyMode,
    pub persistence_interval: Duration,
    pub persistent_namespaces: Vec<String>,
    pub critical_namespaces: Vec<String>,
    pub eager_loading: bool,
    pub event_ttl: Duration,
    pub max_events_per_stream: usize,
    pub critical_stream_ids: Vec<String>,
    pub event_encryption_key: Option<Vec<u8>>,
    pub ssrf_allowed_hosts: Vec<String>,
    pub ssrf_block_private: bool,
    pub ssrf_block_loopback: bool,
    pub transcript_language: String,
    pub google_api_key: String,
    pub google_cse_id: String,
    /// Pre-shared bearer token for the HTTP transport; env-only.
    pub auth_token: Option<String>,
}

impl Settings {
    /// Merge a parsed config file with the environment. CLI overrides are
    /// applied afterwards by `main`.
    pub fn from_sources(file: FileConfig) -> Self {
        let encryption_key = file
            .event_encryption_key
            .or_else(|| std::env::var("EVENT_ENCRYPTION_KEY").ok())
            .and_then(|hex| match decode_hex_key(&hex) {
                Some(key) => Some(key),
                None => {
                    warn!("EVENT_ENCRYPTION_KEY must be 128 hex chars (64 bytes); ignoring");
                    None
                }
            });

        Self {
            storage_path: file
                .storage_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_DIR)),
            default_ttl: file
                .default_ttl_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_CACHE_TTL),
            max_size: file.max_size.unwrap_or(DEFAULT_MAX_SIZE),
            persistence_mode: file.persistence_mode.unwrap_or(PolicyMode::Hybrid),
            persistence_interval: file
                .persistence_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_PERSISTENCE_INTERVAL),
            persistent_namespaces: file.persistent_namespaces.unwrap_or_default(),
            critical_namespaces: file
                .critical_namespaces
                .unwrap_or_else(|| vec![crate::tools::NS_GOOGLE_SEARCH.to_string()]),
            eager_loading: file.eager_loading.unwrap_or(true),
            event_ttl: file
                .event_ttl_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_EVENT_TTL),
            max_events_per_stream: file
                .max_events_per_stream
                .unwrap_or(DEFAULT_MAX_EVENTS_PER_STREAM),
            critical_stream_ids: file.critical_stream_ids.unwrap_or_default(),
            event_encryption_key: encryption_key,
            ssrf_allowed_hosts: file.ssrf_allowed_hosts.unwrap_or_default(),
            ssrf_block_private: file.ssrf_block_private.unwrap_or(true),
            ssrf_block_loopback: file.ssrf_block_loopback.unwrap_or(true),
            transcript_language: file.transcript_language.unwrap_or_else(|| "en".to_string()),
            google_api_key: std::env::var("GOOGLE_API_KEY").unwrap_or_default(),
            google_cse_id: std::env::var("GOOGLE_CSE_ID").unwrap_or_default(),
            auth_token: std::env::var("WEBSEARCH_AUTH_TOKEN").ok(),
        }
    }

    pub fn build_policy(&self) -> PersistencePolicy {
        let namespaces = self.persistent_namespaces.clone();
        match self.persistence_mode {
            PolicyMode::WriteThrough => PersistencePolicy::WriteThrough { namespaces },
            PolicyMode::Periodic => PersistencePolicy::Periodic {
                namespaces,
                interval: self.persistence_interval,
            },
            PolicyMode::OnShutdown => PersistencePolicy::OnShutdown { namespaces },
            PolicyMode::Hybrid => PersistencePolicy::Hybrid {
                namespaces,
                critical: self.critical_namespaces.clone(),
                interval: self.persistence_interval,
            },
        }
    }

    pub fn build_ssrf_policy(&self) -> SsrfPolicy {
        SsrfPolicy {
            allowed_hosts: self
                .ssrf_allowed_hosts
                .iter()
                .map(|h| h.to_ascii_lowercase())
                .collect::<HashSet<_>>(),
            block_private: self.ssrf_block_private,
            block_loopback: self.ssrf_block_loopback,
        }
    }

    pub fn build_event_config(&self) -> EventStoreConfig {
        EventStoreConfig {
            event_ttl: self.event_ttl,
            max_events_per_stream: self.max_events_per_stream,
            critical_streams: self.critical_stream_ids.clone(),
            persistence_interval: Some(self.persistence_interval),
            storage_path: Some(self.storage_path.join("events")),
            encryption_key: self.event_encryption_key.clone(),
        }
    }
}

fn decode_hex_key(hex: &str) -> Option<Vec<u8>> {
    let hex = hex.trim();
    if hex.len() != 128 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}
