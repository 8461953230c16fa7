//! Shared types, constants, and the clock abstraction.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::events::EventStore;
use crate::tools::ToolContext;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Timeout for external search API calls.
pub const SEARCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for a static (non-rendered) page fetch.
pub const STATIC_FETCH_TIMEOUT: Duration = Duration::from_secs(15);

/// Timeout for the headless-browser rendering path.
pub const HEADLESS_TIMEOUT: Duration = Duration::from_secs(30);

/// Scraped page content is capped at this many bytes (balanced truncation).
pub const MAX_SCRAPE_BYTES: usize = 50 * 1024;

/// Maximum document (PDF/DOCX/PPTX) download size.
pub const MAX_DOCUMENT_BYTES: usize = 20 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Clock abstraction
// ---------------------------------------------------------------------------

/// Milliseconds-since-epoch wall clock.
///
/// The cache, event store, and circuit breaker read time through this trait so
/// tests can drive expiry deterministically.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

/// Production clock backed by `SystemTime`.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
    }
}

/// Manually advanced clock for tests.
pub struct ManualClock(AtomicU64);

impl ManualClock {
    pub fn new(start_millis: u64) -> Self {
        Self(AtomicU64::new(start_millis))
    }

    pub fn advance(&self, millis: u64) {
        self.0.fetch_add(millis, Ordering::SeqCst);
    }

    pub fn set(&self, millis: u64) {
        self.0.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// MCP session types (HTTP transport)
// ---------------------------------------------------------------------------

/// Per-session state for the streamable HTTP transport.
pub struct McpSession {
    pub protocol_version: String,
    pub last_activity: Instant,
    /// Event-store stream backing SSE replay for this session.
    pub stream_id: String,
}

impl McpSession {
    pub fn new(protocol_version: String, stream_id: String) -> Self {
        Self { protocol_version, last_activity: Instant::now(), stream_id }
    }
}

/// Static configuration for the MCP HTTP transport.
pub struct McpConfig {
    pub allowed_origins: Vec<String>,
    pub auth: crate::auth::AuthMode,
    pub server_url: String,
}

/// Axum state for the MCP HTTP transport routes.
#[derive(Clone)]
pub struct McpAppContext {
    pub tools: Arc<ToolContext>,
    pub events: Arc<EventStore>,
    pub sessions: Arc<DashMap<String, McpSession>>,
    pub config: Arc<McpConfig>,
}
