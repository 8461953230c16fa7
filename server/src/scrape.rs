//! Scrape orchestrator: URL in, extracted content out.
//!
//! Decision tree: SSRF validation, then YouTube transcript, then document
//! parsing, then the web-page path under the scraping circuit breaker —
//! static HTML first, headless rendering when the quality gate says the
//! static result is hollow. Every redirect hop is re-validated against the
//! SSRF policy before it is followed.

use reqwest::header::{CONTENT_TYPE, LOCATION};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::breaker::CircuitBreaker;
use crate::document::{detect_kind, DocumentKind, DocumentParser};
use crate::error::ToolError;
use crate::extract::{compose_text, extract_citation, extract_page, is_meaningful, truncate_balanced};
use crate::render::{is_spa_host, PageRenderer};
use crate::ssrf::{validate_url_resolved, SsrfPolicy};
use crate::types::{Clock, HEADLESS_TIMEOUT, MAX_DOCUMENT_BYTES, MAX_SCRAPE_BYTES, STATIC_FETCH_TIMEOUT};
use crate::youtube::{extract_video_id, TranscriptFetcher};

const MAX_REDIRECTS: u32 = 5;

/// Static HTML larger than this is refused outright.
const MAX_PAGE_BYTES: usize = 5 * 1024 * 1024;

/// `raw_html` is kept in the result (and the cache) only below this size.
const MAX_RAW_HTML_BYTES: usize = 100 * 1024;

pub const BREAKER_FAILURE_THRESHOLD: u32 = 5;
pub const BREAKER_RESET_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, thiserror::Error)]
pub enum ScrapeError {
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("fetch failed for {url}: {reason}")]
    Fetch { url: String, reason: String },
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("{url} exceeds the {limit}-byte limit")]
    TooLarge { url: String, limit: usize },
    #[error("too many redirects from {url}")]
    TooManyRedirects { url: String },
    #[error("rendering failed for {url}: {reason}")]
    Render { url: String, reason: String },
}

impl ScrapeError {
    pub fn render(url: impl Into<String>, reason: impl ToString) -> Self {
        Self::Render { url: url.into(), reason: reason.to_string() }
    }
}

/// The cacheable scrape outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeResult {
    pub content: String,
    #[serde(rename = "rawHtml", skip_serializing_if = "Option::is_none")]
    pub raw_html: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub citation: Option<Value>,
}

struct FetchedPage {
    final_url: Url,
    content_type: Option<String>,
    bytes: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Scraper {
    http: reqwest::Client,
    ssrf: SsrfPolicy,
    breaker: Mutex<CircuitBreaker>,
    renderer: Arc<dyn PageRenderer>,
    transcripts: Arc<dyn TranscriptFetcher>,
    parser: Arc<dyn DocumentParser>,
}

impl Scraper {
    pub fn new(
        ssrf: SsrfPolicy,
        renderer: Arc<dyn PageRenderer>,
        transcripts: Arc<dyn TranscriptFetcher>,
        parser: Arc<dyn DocumentParser>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        // Redirects are followed manually so each hop passes SSRF validation.
        // A default client would follow them internally, so construction must
        // not fall back.
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("websearch/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("HTTP client construction");
        Self {
            http,
            ssrf,
            breaker: Mutex::new(CircuitBreaker::new(
                "web-scraping",
                BREAKER_FAILURE_THRESHOLD,
                BREAKER_RESET_TIMEOUT,
                clock,
            )),
            renderer,
            transcripts,
            parser,
        }
    }

    /// Run the full decision tree for one URL.
    pub async fn scrape(&self, raw_url: &str) -> Result<ScrapeResult, ToolError> {
        let url = Url::parse(raw_url).map_err(|e| ScrapeError::InvalidUrl {
            url: raw_url.to_string(),
            reason: e.to_string(),
        })?;
        validate_url_resolved(&url, &self.ssrf).await?;

        if let Some(video_id) = extract_video_id(raw_url) {
            let transcript = self.transcripts.fetch_transcript(&video_id).await?;
            return Ok(ScrapeResult {
                content: truncate_balanced(&transcript, MAX_SCRAPE_BYTES),
                raw_html: None,
                citation: Some(json!({
                    "source": "youtube",
                    "videoId": video_id,
                    "url": raw_url,
                })),
            });
        }

        if let Some(kind) = detect_kind(url.path(), None) {
            return self.scrape_document(&url, kind).await;
        }

        self.breaker.lock().unwrap().try_acquire()?;
        let result = self.scrape_web(&url).await;
        {
            let mut breaker = self.breaker.lock().unwrap();
            match &result {
                Ok(_) => breaker.record_success(),
                // Policy rejections say nothing about upstream health.
                Err(ToolError::Ssrf(_)) => {}
                Err(_) => breaker.record_failure(),
            }
        }
        result
    }

    // -----------------------------------------------------------------------
    // Paths
    // -----------------------------------------------------------------------

    async fn scrape_document(
        &self,
        url: &Url,
        kind: DocumentKind,
    ) -> Result<ScrapeResult, ToolError> {
        let page = self.fetch_with_ssrf(url, STATIC_FETCH_TIMEOUT, MAX_DOCUMENT_BYTES).await?;
        // The header may correct an extension-based guess.
        let kind = detect_kind(page.final_url.path(), page.content_type.as_deref()).unwrap_or(kind);
        let parsed = self.parser.parse(kind, &page.bytes)?;
        Ok(ScrapeResult {
            content: truncate_balanced(&parsed.text, MAX_SCRAPE_BYTES),
            raw_html: None,
            citation: Some(json!({
                "source": kind.label(),
                "url": page.final_url.as_str(),
                "metadata": parsed.metadata,
            })),
        })
    }

    async fn scrape_web(&self, url: &Url) -> Result<ScrapeResult, ToolError> {
        if !is_spa_host(url) {
            let page = self.fetch_with_ssrf(url, STATIC_FETCH_TIMEOUT, MAX_PAGE_BYTES).await?;

            // A redirect can land on a document even when the URL did not
            // look like one.
            if let Some(kind) = detect_kind(page.final_url.path(), page.content_type.as_deref()) {
                let parsed = self.parser.parse(kind, &page.bytes)?;
                return Ok(ScrapeResult {
                    content: truncate_balanced(&parsed.text, MAX_SCRAPE_BYTES),
                    raw_html: None,
                    citation: Some(json!({
                        "source": kind.label(),
                        "url": page.final_url.as_str(),
                        "metadata": parsed.metadata,
                    })),
                });
            }

            let raw_html = String::from_utf8_lossy(&page.bytes).into_owned();
            let text = compose_text(&extract_page(&raw_html));
            if is_meaningful(&text, &raw_html) {
                return Ok(ScrapeResult {
                    content: truncate_balanced(&text, MAX_SCRAPE_BYTES),
                    citation: Some(extract_citation(&raw_html, page.final_url.as_str())),
                    raw_html: (raw_html.len() <= MAX_RAW_HTML_BYTES).then_some(raw_html),
                });
            }
            debug!(url = url.as_str(), "Static extraction below quality gate, rendering");
        } else {
            debug!(url = url.as_str(), "Known SPA host, skipping static path");
        }

        let html = tokio::time::timeout(HEADLESS_TIMEOUT, self.renderer.render(url))
            .await
            .map_err(|_| ScrapeError::render(url.as_str(), "render timed out"))??;
        let text = compose_text(&extract_page(&html));
        Ok(ScrapeResult {
            content: truncate_balanced(&text, MAX_SCRAPE_BYTES),
            citation: Some(extract_citation(&html, url.as_str())),
            raw_html: (html.len() <= MAX_RAW_HTML_BYTES).then_some(html),
        })
    }

    // -----------------------------------------------------------------------
    // SSRF-guarded fetch with manual redirect handling
    // -----------------------------------------------------------------------

    async fn fetch_with_ssrf(
        &self,
        url: &Url,
        timeout: Duration,
        max_bytes: usize,
    ) -> Result<FetchedPage, ToolError> {
        let mut current = url.clone();
        let mut redirects = 0u32;

        loop {
            validate_url_resolved(&current, &self.ssrf).await?;

            let response = self
                .http
                .get(current.clone())
                .timeout(timeout)
                .send()
                .await
                .map_err(|e| ScrapeError::Fetch {
                    url: current.to_string(),
                    reason: e.to_string(),
                })?;
            let status = response.status();

            if status.is_redirection() {
                redirects += 1;
                if redirects > MAX_REDIRECTS {
                    return Err(ScrapeError::TooManyRedirects { url: url.to_string() }.into());
                }
                let location = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| ScrapeError::Fetch {
                        url: current.to_string(),
                        reason: "redirect without Location header".to_string(),
                    })?;
                let next = current.join(location).map_err(|e| ScrapeError::InvalidUrl {
                    url: location.to_string(),
                    reason: e.to_string(),
                })?;
                debug!(from = current.as_str(), to = next.as_str(), "Following redirect");
                current = next;
                continue;
            }

            if !status.is_success() {
                return Err(ScrapeError::Status {
                    url: current.to_string(),
                    status: status.as_u16(),
                }
                .into());
            }

            if let Some(len) = response.content_length() {
                if len as usize > max_bytes {
                    return Err(
                        ScrapeError::TooLarge { url: current.to_string(), limit: max_bytes }.into()
                    );
                }
            }
            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string());
            let bytes = response.bytes().await.map_err(|e| ScrapeError::Fetch {
                url: current.to_string(),
                reason: e.to_string(),
            })?;
            if bytes.len() > max_bytes {
                warn!(url = current.as_str(), bytes = bytes.len(), "Response over size cap");
                return Err(
                    ScrapeError::TooLarge { url: current.to_string(), limit: max_bytes }.into()
                );
            }

            return Ok(FetchedPage {
                final_url: current,
                content_type,
                bytes: bytes.to_vec(),
            });
        }
    }
}
