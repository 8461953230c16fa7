//! Test harness for MCP dispatch tests.
//!
//! Builds a full [`ToolContext`] with stubbed outbound collaborators (search,
//! renderer, transcripts) over a real cache and event store in a temp dir,
//! then dispatches JSON-RPC via `dispatch_jsonrpc()` directly — no
//! subprocess, no HTTP.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use url::Url;

use websearch_server::cache::CacheConfig;
use websearch_server::document::TextRunParser;
use websearch_server::events::{EventStore, EventStoreConfig};
use websearch_server::mcp::dispatch_jsonrpc;
use websearch_server::persistent::PersistentCache;
use websearch_server::policy::PersistencePolicy;
use websearch_server::render::PageRenderer;
use websearch_server::scrape::{ScrapeError, Scraper};
use websearch_server::search::{SearchError, SearchKind, SearchProvider, SearchResult};
use websearch_server::ssrf::SsrfPolicy;
use websearch_server::store::PersistStore;
use websearch_server::tools::ToolContext;
use websearch_server::types::SystemClock;
use websearch_server::youtube::{TranscriptError, TranscriptErrorKind, TranscriptFetcher};

pub struct StubSearch;

#[async_trait]
impl SearchProvider for StubSearch {
    async fn search(
        &self,
        query: &str,
        kind: SearchKind,
        num: u8,
    ) -> Result<Vec<SearchResult>, SearchError> {
        Ok((0..num.min(2))
            .map(|i| SearchResult {
                title: format!("{} result {} [{}]", query, i + 1, kind.label()),
                link: format!("https://results.example/{}", i + 1),
                snippet: Some(format!("Snippet {} for '{}'", i + 1, query)),
                display_link: Some("results.example".to_string()),
                thumbnail: None,
            })
            .collect())
    }
}

struct StubRenderer;

#[async_trait]
impl PageRenderer for StubRenderer {
    async fn render(&self, url: &Url) -> Result<String, ScrapeError> {
        Err(ScrapeError::render(url.as_str(), "renderer not available in tests"))
    }
}

struct StubTranscripts;

#[async_trait]
impl TranscriptFetcher for StubTranscripts {
    async fn fetch_transcript(&self, video_id: &str) -> Result<String, TranscriptError> {
        Err(TranscriptError::new(TranscriptErrorKind::NotAvailable, video_id, "stubbed"))
    }
}

pub struct TestHarness {
    pub tools: Arc<ToolContext>,
    _temp_dir: TempDir,
}

impl TestHarness {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("temp dir");
        let clock = Arc::new(SystemClock);

        let cache = Arc::new(PersistentCache::new(
            CacheConfig {
                default_ttl: Duration::from_secs(60),
                max_size: 100,
                sweep_interval: None,
            },
            PersistencePolicy::OnShutdown { namespaces: vec![] },
            PersistStore::new(temp_dir.path()),
            clock.clone(),
            false,
        ));
        let events = Arc::new(EventStore::new(EventStoreConfig::default(), clock.clone()));
        let scraper = Arc::new(Scraper::new(
            SsrfPolicy::default(),
            Arc::new(StubRenderer),
            Arc::new(StubTranscripts),
            Arc::new(TextRunParser::default()),
            clock,
        ));

        let tools = Arc::new(ToolContext {
            cache,
            events: Arc::clone(&events),
            search: Arc::new(StubSearch),
            scraper,
        });
        Self { tools, _temp_dir: temp_dir }
    }

    pub async fn request(&self, method: &str, params: Value) -> Option<Value> {
        let msg = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        dispatch_jsonrpc(&self.tools, &msg).await
    }

    pub async fn initialize(&self) -> Value {
        self.request("initialize", json!({ "protocolVersion": "2025-11-25" }))
            .await
            .expect("initialize response")
    }

    /// Call a tool and return `(content_text, is_error)` — errors use the
    /// warning-prefixed text convention, never `isError: true`.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> (String, bool) {
        let resp = self
            .request("tools/call", json!({ "name": name, "arguments": arguments }))
            .await
            .expect("tool response");
        assert_eq!(resp["result"]["isError"], false);
        let text = resp["result"]["content"][0]["text"].as_str().unwrap_or_default().to_string();
        let is_error = text.starts_with("\u{26a0} Error:");
        (text, is_error)
    }
}
