//! Scrape orchestrator: SSRF redirect protection, quality-gate fallback to
//! the renderer, document routing, transcripts, and the circuit breaker.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use websearch_server::document::TextRunParser;
use websearch_server::error::ToolError;
use websearch_server::render::PageRenderer;
use websearch_server::scrape::{ScrapeError, Scraper};
use websearch_server::ssrf::SsrfPolicy;
use websearch_server::types::ManualClock;
use websearch_server::youtube::{TranscriptError, TranscriptErrorKind, TranscriptFetcher};

// ---------------------------------------------------------------------------
// Stubs
// ---------------------------------------------------------------------------

/// Renderer stub that records invocations and returns fixed HTML.
struct StubRenderer {
    calls: AtomicU32,
    html: String,
}

impl StubRenderer {
    fn new(html: &str) -> Arc<Self> {
        Arc::new(Self { calls: AtomicU32::new(0), html: html.to_string() })
    }
}

#[async_trait]
impl PageRenderer for StubRenderer {
    async fn render(&self, _url: &Url) -> Result<String, ScrapeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.html.clone())
    }
}

struct StubTranscripts {
    transcript: Option<String>,
}

#[async_trait]
impl TranscriptFetcher for StubTranscripts {
    async fn fetch_transcript(&self, video_id: &str) -> Result<String, TranscriptError> {
        match &self.transcript {
            Some(text) => Ok(text.clone()),
            None => Err(TranscriptError::new(
                TranscriptErrorKind::NotAvailable,
                video_id,
                "no transcript",
            )),
        }
    }
}

fn scraper_with(
    policy: SsrfPolicy,
    renderer: Arc<StubRenderer>,
    transcript: Option<String>,
) -> Scraper {
    Scraper::new(
        policy,
        renderer,
        Arc::new(StubTranscripts { transcript }),
        Arc::new(TextRunParser::default()),
        Arc::new(ManualClock::new(1_000_000)),
    )
}

/// Loopback unblocked so wiremock (127.0.0.1) is reachable; everything else
/// stays at the default policy.
fn local_test_policy() -> SsrfPolicy {
    SsrfPolicy { block_loopback: false, ..SsrfPolicy::default() }
}

const RICH_PAGE: &str = r#"<html><head><title>Observability in Practice</title></head><body>
<h1>Observability in Practice</h1>
<p>Distributed tracing gives teams a causal view of request flow across services,
which turns debugging from guesswork into navigation.</p>
<p>Structured logs complement traces by carrying the local detail a span cannot,
and metrics round out the picture with cheap, aggregable signals over time.</p>
<p>Teams that adopt all three report materially shorter incident timelines because
each signal answers a different question about the same failure.</p>
</body></html>"#;

// ---------------------------------------------------------------------------
// SSRF redirect protection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn redirect_to_blocked_address_fails_before_fetch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(
            ResponseTemplate::new(302).insert_header("Location", "http://169.254.169.254/admin"),
        )
        .mount(&server)
        .await;

    let renderer = StubRenderer::new("");
    let scraper = scraper_with(local_test_policy(), renderer.clone(), None);

    let err = scraper.scrape(&server.uri()).await.unwrap_err();
    match err {
        ToolError::Ssrf(e) => {
            assert!(e.reason.contains("link-local"), "unexpected reason: {}", e.reason);
        }
        other => panic!("expected SSRF rejection, got {other:?}"),
    }
    assert_eq!(renderer.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn redirect_to_private_range_is_blocked() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(301).insert_header("Location", "http://10.0.0.8/"))
        .mount(&server)
        .await;

    let scraper = scraper_with(local_test_policy(), StubRenderer::new(""), None);
    let err = scraper.scrape(&server.uri()).await.unwrap_err();
    assert!(matches!(err, ToolError::Ssrf(_)), "got {err:?}");
}

#[tokio::test]
async fn direct_loopback_is_blocked_under_default_policy() {
    let scraper = scraper_with(SsrfPolicy::default(), StubRenderer::new(""), None);
    let err = scraper.scrape("http://127.0.0.1:9/").await.unwrap_err();
    assert!(matches!(err, ToolError::Ssrf(_)));
}

#[tokio::test]
async fn allowed_redirects_are_followed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/start"))
        .respond_with(ResponseTemplate::new(302).insert_header("Location", "/final"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/final"))
        .respond_with(ResponseTemplate::new(200).set_body_string(RICH_PAGE))
        .mount(&server)
        .await;

    let scraper = scraper_with(local_test_policy(), StubRenderer::new(""), None);
    let result = scraper.scrape(&format!("{}/start", server.uri())).await.unwrap();
    assert!(result.content.contains("Title: Observability in Practice"));
}

// ---------------------------------------------------------------------------
// Fallback to the renderer
// ---------------------------------------------------------------------------

#[tokio::test]
async fn spa_host_skips_static_path_entirely() {
    // No mock server: the static path would fail, proving it is never taken.
    let mut policy = SsrfPolicy::default();
    policy.allowed_hosts.insert("reddit.com".to_string());

    let renderer = StubRenderer::new(RICH_PAGE);
    let scraper = scraper_with(policy, renderer.clone(), None);

    let result = scraper.scrape("https://reddit.com/r/rust").await.unwrap();
    assert_eq!(renderer.calls.load(Ordering::SeqCst), 1, "renderer called directly");
    assert!(result.content.len() > 200);
    assert!(result.content.contains("Distributed tracing"));
}

#[tokio::test]
async fn hollow_static_page_falls_back_to_renderer() {
    let server = MockServer::start().await;
    // Script soup: plenty of bytes, nothing readable.
    let soup = format!(
        "<html><body><script>{}</script></body></html>",
        r#"window.__STATE__={"a":1,"b":[2,3]};"#.repeat(200)
    );
    Mock::given(method("GET"))
        .and(path("/app"))
        .respond_with(ResponseTemplate::new(200).set_body_string(soup))
        .mount(&server)
        .await;

    let renderer = StubRenderer::new(RICH_PAGE);
    let scraper = scraper_with(local_test_policy(), renderer.clone(), None);

    let result = scraper.scrape(&format!("{}/app", server.uri())).await.unwrap();
    assert_eq!(renderer.calls.load(Ordering::SeqCst), 1, "quality gate triggered the renderer");
    assert!(result.content.len() > 200);
    assert!(result.content.contains("incident timelines"));
}

#[tokio::test]
async fn meaningful_static_page_never_touches_the_renderer() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/article"))
        .respond_with(ResponseTemplate::new(200).set_body_string(RICH_PAGE))
        .mount(&server)
        .await;

    let renderer = StubRenderer::new("");
    let scraper = scraper_with(local_test_policy(), renderer.clone(), None);

    let result = scraper.scrape(&format!("{}/article", server.uri())).await.unwrap();
    assert_eq!(renderer.calls.load(Ordering::SeqCst), 0);
    assert!(result.content.contains("Headings:\n- Observability in Practice"));
    assert!(result.raw_html.is_some());
    let citation = result.citation.unwrap();
    assert!(citation["url"].as_str().unwrap().contains("/article"));
}

// ---------------------------------------------------------------------------
// YouTube and documents
// ---------------------------------------------------------------------------

#[tokio::test]
async fn youtube_urls_route_to_the_transcript_client() {
    let mut policy = SsrfPolicy::default();
    policy.allowed_hosts.insert("youtu.be".to_string());

    let renderer = StubRenderer::new("");
    let scraper =
        scraper_with(policy, renderer.clone(), Some("so long and thanks for all the fish".into()));

    let result = scraper.scrape("https://youtu.be/dQw4w9WgXcQ").await.unwrap();
    assert_eq!(result.content, "so long and thanks for all the fish");
    assert_eq!(result.citation.unwrap()["videoId"], "dQw4w9WgXcQ");
    assert_eq!(renderer.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn missing_transcript_surfaces_a_typed_error() {
    let mut policy = SsrfPolicy::default();
    policy.allowed_hosts.insert("youtu.be".to_string());
    let scraper = scraper_with(policy, StubRenderer::new(""), None);

    let err = scraper.scrape("https://youtu.be/dQw4w9WgXcQ").await.unwrap_err();
    match err {
        ToolError::Transcript(e) => {
            assert_eq!(e.kind, TranscriptErrorKind::NotAvailable);
            assert_eq!(e.video_id, "dQw4w9WgXcQ");
        }
        other => panic!("expected transcript error, got {other:?}"),
    }
}

#[tokio::test]
async fn pdf_urls_route_to_the_document_parser() {
    let server = MockServer::start().await;
    let body: Vec<u8> =
        b"%PDF-1.4\x00\x01(Annual safety report findings)\x00(remain unchanged this year)".to_vec();
    Mock::given(method("GET"))
        .and(path("/report.pdf"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/pdf")
                .set_body_bytes(body),
        )
        .mount(&server)
        .await;

    let scraper = scraper_with(local_test_policy(), StubRenderer::new(""), None);
    let result = scraper.scrape(&format!("{}/report.pdf", server.uri())).await.unwrap();
    assert!(result.content.contains("Annual safety report findings"));
    assert_eq!(result.citation.unwrap()["source"], "pdf");
}

// ---------------------------------------------------------------------------
// Circuit breaker and upstream errors
// ---------------------------------------------------------------------------

#[tokio::test]
async fn http_error_status_is_a_typed_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let scraper = scraper_with(local_test_policy(), StubRenderer::new(""), None);
    let err = scraper.scrape(&format!("{}/missing", server.uri())).await.unwrap_err();
    match err {
        ToolError::Scrape(ScrapeError::Status { status, .. }) => assert_eq!(status, 404),
        other => panic!("expected status error, got {other:?}"),
    }
}

#[tokio::test]
async fn repeated_failures_open_the_scraping_circuit() {
    let server = MockServer::start().await;
    Mock::given(method("GET")).respond_with(ResponseTemplate::new(500)).mount(&server).await;

    let scraper = scraper_with(local_test_policy(), StubRenderer::new(""), None);
    let url = format!("{}/flaky", server.uri());

    for _ in 0..5 {
        let err = scraper.scrape(&url).await.unwrap_err();
        assert!(matches!(err, ToolError::Scrape(ScrapeError::Status { .. })));
    }

    // Threshold reached: the next call is rejected without dialing out.
    let err = scraper.scrape(&url).await.unwrap_err();
    assert!(matches!(err, ToolError::Breaker(_)), "got {err:?}");

    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 5, "open circuit makes no outbound call");
}

#[tokio::test]
async fn json_payload_rejected_by_quality_gate_reaches_renderer() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api-ish"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(r#"{"data":{"items":[1,2,3]},"next":null}"#),
        )
        .mount(&server)
        .await;

    let renderer = StubRenderer::new(RICH_PAGE);
    let scraper = scraper_with(local_test_policy(), renderer.clone(), None);

    let result = scraper.scrape(&format!("{}/api-ish", server.uri())).await.unwrap();
    assert_eq!(renderer.calls.load(Ordering::SeqCst), 1);
    assert!(result.content.contains("Observability"));
}
