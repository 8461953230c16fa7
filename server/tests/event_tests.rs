//! Event store: monotonic ids, replay, stream caps, TTL, persistence,
//! and at-rest encryption.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use websearch_server::events::{EventStore, EventStoreConfig};
use websearch_server::types::ManualClock;

const T0: u64 = 1_000_000;

fn memory_store(clock: Arc<ManualClock>) -> EventStore {
    EventStore::new(EventStoreConfig::default(), clock)
}

#[tokio::test]
async fn event_ids_are_monotonic_across_streams() {
    let clock = Arc::new(ManualClock::new(T0));
    let store = memory_store(clock);

    let a = store.append("stream-a", json!({ "n": 1 }));
    let b = store.append("stream-b", json!({ "n": 2 }));
    let c = store.append("stream-a", json!({ "n": 3 }));

    assert!(a < b && b < c, "ids increase across the whole store");
}

#[tokio::test]
async fn replay_after_returns_only_newer_events_in_order() {
    let clock = Arc::new(ManualClock::new(T0));
    let store = memory_store(clock);

    let first = store.append("s", json!({ "seq": 1 }));
    store.append("s", json!({ "seq": 2 }));
    store.append("s", json!({ "seq": 3 }));
    store.append("other", json!({ "seq": 99 }));

    let replayed = store.replay_after("s", first);
    assert_eq!(replayed.len(), 2);
    assert_eq!(replayed[0].message["seq"], 2);
    assert_eq!(replayed[1].message["seq"], 3);
    assert!(replayed.windows(2).all(|w| w[0].event_id < w[1].event_id));

    assert!(store.replay_after("s", u64::MAX).is_empty());
    assert!(store.replay_after("unknown", 0).is_empty());
}

#[tokio::test]
async fn per_stream_cap_evicts_oldest() {
    let clock = Arc::new(ManualClock::new(T0));
    let store = EventStore::new(
        EventStoreConfig { max_events_per_stream: 3, ..EventStoreConfig::default() },
        clock,
    );

    for n in 1..=5 {
        store.append("s", json!({ "n": n }));
    }

    let events = store.replay_after("s", 0);
    assert_eq!(events.len(), 3);
    assert_eq!(events[0].message["n"], 3, "oldest two were evicted");
    assert_eq!(events[2].message["n"], 5);
}

#[tokio::test]
async fn expired_events_are_not_replayed() {
    let clock = Arc::new(ManualClock::new(T0));
    let store = EventStore::new(
        EventStoreConfig { event_ttl: Duration::from_millis(1000), ..EventStoreConfig::default() },
        clock.clone(),
    );

    store.append("s", json!({ "old": true }));
    clock.advance(1500);
    store.append("s", json!({ "new": true }));

    let events = store.replay_after("s", 0);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].message["new"], true);
}

#[tokio::test]
async fn stats_track_streams_events_and_replay_outcomes() {
    let clock = Arc::new(ManualClock::new(T0));
    let store = memory_store(clock);

    store.append("a", json!({ "payload": "x" }));
    store.append("b", json!({ "payload": "y" }));

    store.replay_after("a", 0);
    store.replay_after("missing", 0);

    let stats = store.get_stats();
    assert_eq!(stats.streams, 2);
    assert_eq!(stats.events, 2);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    assert!(stats.memory_bytes > 0);
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

fn persisted_config(dir: &TempDir, key: Option<Vec<u8>>) -> EventStoreConfig {
    EventStoreConfig {
        storage_path: Some(dir.path().to_path_buf()),
        encryption_key: key,
        ..EventStoreConfig::default()
    }
}

#[tokio::test]
async fn dispose_persists_and_a_new_store_resumes_ids() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(T0));

    let store = EventStore::new(persisted_config(&dir, None), clock.clone());
    store.append("session-1", json!({ "n": 1 }));
    let last = store.append("session-1", json!({ "n": 2 }));
    store.dispose();

    let reloaded = EventStore::new(persisted_config(&dir, None), clock);
    let replayed = reloaded.replay_after("session-1", 0);
    assert_eq!(replayed.len(), 2, "events survive restart");

    let next = reloaded.append("session-1", json!({ "n": 3 }));
    assert!(next > last, "ids stay monotonic across restart");
}

#[tokio::test]
async fn critical_streams_write_through_on_append() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(T0));
    let config = EventStoreConfig {
        critical_streams: vec!["crit".to_string()],
        ..persisted_config(&dir, None)
    };
    let store = EventStore::new(config, clock);

    store.append("crit", json!({ "durable": true }));
    store.append("normal", json!({ "durable": false }));

    let files: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .flatten()
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    assert!(files.iter().any(|f| f.starts_with("crit")), "critical stream flushed on append");
    assert!(
        !files.iter().any(|f| f.starts_with("normal")),
        "non-critical streams wait for the periodic/shutdown flush"
    );
}

#[tokio::test]
async fn encrypted_streams_round_trip_and_are_opaque_on_disk() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(T0));
    let key = vec![7u8; 64];

    let store = EventStore::new(persisted_config(&dir, Some(key.clone())), clock.clone());
    store.append("secret-session", json!({ "token": "super-secret-payload" }));
    store.dispose();

    // The persisted file must not contain the plaintext.
    let enc_file = std::fs::read_dir(dir.path())
        .unwrap()
        .flatten()
        .find(|e| e.file_name().to_string_lossy().ends_with(".events.enc"))
        .expect("encrypted stream file exists");
    let raw = std::fs::read(enc_file.path()).unwrap();
    let as_text = String::from_utf8_lossy(&raw);
    assert!(!as_text.contains("super-secret-payload"));

    let reloaded = EventStore::new(persisted_config(&dir, Some(key)), clock);
    let replayed = reloaded.replay_after("secret-session", 0);
    assert_eq!(replayed.len(), 1);
    assert_eq!(replayed[0].message["token"], "super-secret-payload");
}

#[tokio::test]
async fn corrupt_stream_file_is_deleted_on_load() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(T0));

    let path = dir.path().join("broken.events.json");
    std::fs::write(&path, "not valid json").unwrap();

    let store = EventStore::new(persisted_config(&dir, None), clock);
    assert!(store.replay_after("broken", 0).is_empty());
    assert!(!path.exists(), "corrupt stream file removed");
}

#[tokio::test]
async fn remove_stream_drops_memory_and_disk() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(T0));
    let config = EventStoreConfig {
        critical_streams: vec!["gone".to_string()],
        ..persisted_config(&dir, None)
    };
    let store = EventStore::new(config, clock);

    store.append("gone", json!({ "n": 1 }));
    store.remove_stream("gone");

    assert!(store.replay_after("gone", 0).is_empty());
    let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().flatten().collect();
    assert!(files.is_empty(), "persisted stream file removed with the stream");
}

#[tokio::test]
async fn subscribers_receive_live_events() {
    let clock = Arc::new(ManualClock::new(T0));
    let store = memory_store(clock);
    let mut rx = store.subscribe();

    let id = store.append("s", json!({ "live": true }));
    let event = rx.recv().await.unwrap();
    assert_eq!(event.event_id, id);
    assert_eq!(event.stream_id, "s");
    assert_eq!(event.message["live"], true);
}
