//! Resumable event store backing SSE session replay.
//!
//! Append-only, stream-scoped log with store-wide monotonic event ids. Each
//! stream is capped (oldest evicted) and every event carries a TTL. The
//! persistence strategy mirrors the cache's: periodic flush plus a final
//! synchronous flush on shutdown, with write-through for streams marked
//! critical. Persisted stream files can be encrypted at rest with AES-SIV;
//! the in-memory log is always plaintext.

use aes_siv::aead::{Aead, KeyInit};
use aes_siv::{Aes256SivAead, Nonce};
use percent_encoding::{percent_decode_str, utf8_percent_encode, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::types::Clock;

pub const DEFAULT_EVENT_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_MAX_EVENTS_PER_STREAM: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    #[serde(rename = "eventId")]
    pub event_id: u64,
    #[serde(rename = "streamId")]
    pub stream_id: String,
    pub message: Value,
    pub timestamp: u64,
    #[serde(rename = "expiresAt")]
    pub expires_at: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventStoreStats {
    pub streams: usize,
    pub events: usize,
    #[serde(rename = "memoryBytes")]
    pub memory_bytes: u64,
    #[serde(rename = "diskBytes")]
    pub disk_bytes: u64,
    pub hits: u64,
    pub misses: u64,
}

pub struct EventStoreConfig {
    pub event_ttl: Duration,
    pub max_events_per_stream: usize,
    /// Streams written through on every append.
    pub critical_streams: Vec<String>,
    pub persistence_interval: Option<Duration>,
    /// Directory for persisted stream files; `None` disables persistence.
    pub storage_path: Option<PathBuf>,
    /// 64-byte AES-256-SIV key enabling at-rest encryption.
    pub encryption_key: Option<Vec<u8>>,
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self {
            event_ttl: DEFAULT_EVENT_TTL,
            max_events_per_stream: DEFAULT_MAX_EVENTS_PER_STREAM,
            critical_streams: Vec::new(),
            persistence_interval: None,
            storage_path: None,
            encryption_key: None,
        }
    }
}

struct EventStoreInner {
    config: EventStoreConfig,
    clock: Arc<dyn Clock>,
    streams: Mutex<HashMap<String, VecDeque<Event>>>,
    next_id: AtomicU64,
    dirty: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
    /// Live fan-out for SSE subscribers; replay covers the rest.
    broadcast: tokio::sync::broadcast::Sender<Event>,
    flush_timer: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct EventStore {
    inner: Arc<EventStoreInner>,
}

impl EventStore {
    pub fn new(config: EventStoreConfig, clock: Arc<dyn Clock>) -> Self {
        let (broadcast, _) = tokio::sync::broadcast::channel(256);
        let store = Self {
            inner: Arc::new(EventStoreInner {
                config,
                clock,
                streams: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                dirty: AtomicBool::new(false),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                broadcast,
                flush_timer: Mutex::new(None),
            }),
        };
        store.load_persisted();
        store.start_flush_timer();
        store
    }

    fn start_flush_timer(&self) {
        let Some(interval) = self.inner.config.persistence_interval else {
            return;
        };
        if self.inner.config.storage_path.is_none() {
            return;
        }
        let store = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                store.flush_all();
            }
        });
        *self.inner.flush_timer.lock().unwrap() = Some(handle);
    }

    fn now(&self) -> u64 {
        self.inner.clock.now_millis()
    }

    // -----------------------------------------------------------------------
    // Log operations
    // -----------------------------------------------------------------------

    /// Append a message to a stream. Returns the store-wide monotonic id.
    pub fn append(&self, stream_id: &str, message: Value) -> u64 {
        let now = self.now();
        let event_id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let event = Event {
            event_id,
            stream_id: stream_id.to_string(),
            message,
            timestamp: now,
            expires_at: now + self.inner.config.event_ttl.as_millis() as u64,
        };

        {
            let mut streams = self.inner.streams.lock().unwrap();
            let stream = streams.entry(stream_id.to_string()).or_default();
            stream.retain(|e| e.expires_at > now);
            stream.push_back(event.clone());
            while stream.len() > self.inner.config.max_events_per_stream {
                stream.pop_front();
            }
        }
        self.inner.dirty.store(true, Ordering::SeqCst);

        // Subscribers may lag or be absent; replay covers them.
        let _ = self.inner.broadcast.send(event);

        if self.inner.config.critical_streams.iter().any(|s| s == stream_id) {
            self.flush_stream(stream_id);
        }
        event_id
    }

    /// Events with `event_id > last_event_id`, in order, not yet expired.
    pub fn replay_after(&self, stream_id: &str, last_event_id: u64) -> Vec<Event> {
        let now = self.now();
        let streams = self.inner.streams.lock().unwrap();
        let events: Vec<Event> = streams
            .get(stream_id)
            .map(|stream| {
                stream
                    .iter()
                    .filter(|e| e.event_id > last_event_id && e.expires_at > now)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        if events.is_empty() {
            self.inner.misses.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.hits.fetch_add(1, Ordering::Relaxed);
        }
        events
    }

    /// Live subscription; callers filter by stream id.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.inner.broadcast.subscribe()
    }

    /// Drop a stream entirely (session teardown).
    pub fn remove_stream(&self, stream_id: &str) {
        self.inner.streams.lock().unwrap().remove(stream_id);
        self.inner.dirty.store(true, Ordering::SeqCst);
        if let Some(dir) = self.inner.config.storage_path.as_ref() {
            let _ = std::fs::remove_file(dir.join(stream_file_name(stream_id, self.encrypted())));
        }
    }

    pub fn get_stats(&self) -> EventStoreStats {
        let streams = self.inner.streams.lock().unwrap();
        let events = streams.values().map(|s| s.len()).sum();
        let memory_bytes = streams
            .values()
            .flat_map(|s| s.iter())
            .map(|e| serde_json::to_string(&e.message).map(|m| m.len() as u64).unwrap_or(0))
            .sum();
        let disk_bytes = self
            .inner
            .config
            .storage_path
            .as_ref()
            .and_then(|dir| std::fs::read_dir(dir).ok())
            .map(|entries| {
                entries
                    .flatten()
                    .filter_map(|e| e.metadata().ok())
                    .map(|m| m.len())
                    .sum()
            })
            .unwrap_or(0);
        EventStoreStats {
            streams: streams.len(),
            events,
            memory_bytes,
            disk_bytes,
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
        }
    }

    /// Final flush + timer teardown.
    pub fn dispose(&self) {
        if let Some(handle) = self.inner.flush_timer.lock().unwrap().take() {
            handle.abort();
        }
        self.flush_all();
        info!("Event store disposed");
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    fn encrypted(&self) -> bool {
        self.inner.config.encryption_key.is_some()
    }

    /// Write every live stream to disk. Synchronous by design: this runs on
    /// the shutdown path as well as the periodic timer.
    fn flush_all(&self) {
        if !self.inner.dirty.swap(false, Ordering::SeqCst) {
            return;
        }
        let Some(dir) = self.inner.config.storage_path.clone() else {
            return;
        };
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!(error = %e, "Failed to create event storage directory");
            return;
        }
        let snapshot: Vec<(String, Vec<Event>)> = {
            let streams = self.inner.streams.lock().unwrap();
            streams.iter().map(|(id, s)| (id.clone(), s.iter().cloned().collect())).collect()
        };
        let mut persisted = 0usize;
        for (stream_id, events) in &snapshot {
            if self.write_stream_file(stream_id, events) {
                persisted += 1;
            }
        }
        debug!(streams = persisted, "Event store flushed");
    }

    fn flush_stream(&self, stream_id: &str) {
        let Some(dir) = self.inner.config.storage_path.as_ref() else {
            return;
        };
        if let Err(e) = std::fs::create_dir_all(dir) {
            warn!(error = %e, "Failed to create event storage directory");
            return;
        }
        let events: Vec<Event> = {
            let streams = self.inner.streams.lock().unwrap();
            streams.get(stream_id).map(|s| s.iter().cloned().collect()).unwrap_or_default()
        };
        self.write_stream_file(stream_id, &events);
    }

    fn write_stream_file(&self, stream_id: &str, events: &[Event]) -> bool {
        let Some(dir) = self.inner.config.storage_path.as_ref() else {
            return false;
        };
        let bytes = match serde_json::to_vec(events) {
            Ok(b) => b,
            Err(e) => {
                warn!(stream = stream_id, error = %e, "Failed to serialize event stream");
                return false;
            }
        };
        let payload = match self.seal(&bytes) {
            Ok(p) => p,
            Err(reason) => {
                warn!(stream = stream_id, reason = reason, "Failed to encrypt event stream");
                return false;
            }
        };
        let name = stream_file_name(stream_id, self.encrypted());
        let tmp = dir.join(format!("{name}.tmp"));
        let result = std::fs::write(&tmp, &payload).and_then(|_| std::fs::rename(&tmp, dir.join(&name)));
        if let Err(e) = result {
            warn!(stream = stream_id, error = %e, "Failed to persist event stream");
            return false;
        }
        true
    }

    fn load_persisted(&self) {
        let Some(dir) = self.inner.config.storage_path.clone() else {
            return;
        };
        let entries = match std::fs::read_dir(&dir) {
            Ok(e) => e,
            Err(_) => return,
        };
        let now = self.now();
        let suffix = if self.encrypted() { ".events.enc" } else { ".events.json" };
        let mut max_id = 0u64;
        let mut loaded_streams = 0usize;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !name.ends_with(suffix) {
                continue;
            }
            let stream_id = percent_decode_str(name.trim_end_matches(suffix))
                .decode_utf8_lossy()
                .into_owned();
            let raw = match std::fs::read(entry.path()) {
                Ok(b) => b,
                Err(e) => {
                    warn!(stream = stream_id.as_str(), error = %e, "Failed to read event stream");
                    continue;
                }
            };
            let plaintext = match self.open(&raw) {
                Ok(p) => p,
                Err(reason) => {
                    warn!(
                        stream = stream_id.as_str(),
                        reason = reason,
                        "Skipping undecryptable event stream"
                    );
                    continue;
                }
            };
            let events: Vec<Event> = match serde_json::from_slice(&plaintext) {
                Ok(ev) => ev,
                Err(e) => {
                    // Corrupt stream file: drop it, same discipline as the cache.
                    warn!(stream = stream_id.as_str(), error = %e, "Corrupt event stream, deleting");
                    let _ = std::fs::remove_file(entry.path());
                    continue;
                }
            };
            if let Some(last) = events.last() {
                max_id = max_id.max(last.event_id);
            }
            let live: VecDeque<Event> =
                events.into_iter().filter(|e| e.expires_at > now).collect();
            if !live.is_empty() {
                self.inner.streams.lock().unwrap().insert(stream_id, live);
                loaded_streams += 1;
            }
        }
        if max_id > 0 {
            self.inner.next_id.store(max_id + 1, Ordering::SeqCst);
            info!(streams = loaded_streams, next_id = max_id + 1, "Event store hydrated");
        }
    }

    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, &'static str> {
        let Some(key) = self.inner.config.encryption_key.as_ref() else {
            return Ok(plaintext.to_vec());
        };
        let cipher = Aes256SivAead::new_from_slice(key).map_err(|_| "bad key length")?;
        let nonce_bytes: [u8; 16] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher.encrypt(nonce, plaintext).map_err(|_| "encryption failed")?;
        let mut out = Vec::with_capacity(16 + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn open(&self, raw: &[u8]) -> Result<Vec<u8>, &'static str> {
        let Some(key) = self.inner.config.encryption_key.as_ref() else {
            return Ok(raw.to_vec());
        };
        if raw.len() < 16 {
            return Err("payload too short");
        }
        let cipher = Aes256SivAead::new_from_slice(key).map_err(|_| "bad key length")?;
        let nonce = Nonce::from_slice(&raw[..16]);
        cipher.decrypt(nonce, &raw[16..]).map_err(|_| "decryption failed")
    }
}

fn stream_file_name(stream_id: &str, encrypted: bool) -> String {
    let encoded = utf8_percent_encode(stream_id, NON_ALPHANUMERIC).to_string();
    if encrypted {
        format!("{encoded}.events.enc")
    } else {
        format!("{encoded}.events.json")
    }
}
