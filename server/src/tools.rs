//! Tool implementations over the cache, search, and scrape primitives.
//!
//! Every tool is a pure function of its validated arguments and the shared
//! [`ToolContext`]; the MCP layer owns schemas and dispatch. Expensive work
//! always goes through the persistent cache so concurrent identical calls
//! coalesce into one upstream request.

use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::cache::CacheOptions;
use crate::error::ToolError;
use crate::events::EventStore;
use crate::persistent::PersistentCache;
use crate::scrape::{ScrapeResult, Scraper};
use crate::search::{SearchKind, SearchProvider, SearchResult};

// Cache namespaces and lifetimes per tool.
pub const NS_GOOGLE_SEARCH: &str = "googleSearch";
pub const NS_NEWS_SEARCH: &str = "newsSearch";
pub const NS_IMAGE_SEARCH: &str = "imageSearch";
pub const NS_PATENT_SEARCH: &str = "patentSearch";
pub const NS_ACADEMIC_SEARCH: &str = "academicSearch";
pub const NS_SCRAPE: &str = "scrapePage";
pub const NS_DOCUMENT: &str = "parseDocument";

pub const SCRAPE_TTL: Duration = Duration::from_secs(60 * 60);
pub const SCRAPE_STALE_TIME: Duration = Duration::from_secs(24 * 60 * 60);

/// Per-source contribution cap in the combined research output.
const PER_SOURCE_CAP: usize = 10 * 1024;

/// Combined research output cap.
const COMBINED_CAP: usize = 100 * 1024;

/// Paragraphs shorter than this are never deduplicated.
const DEDUPE_MIN_CHARS: usize = 50;

/// Jaccard similarity above which two paragraphs count as duplicates.
const DEDUPE_SIMILARITY: f64 = 0.85;

/// Everything a tool needs, constructed once in `main` and shared by both
/// transports.
pub struct ToolContext {
    pub cache: Arc<PersistentCache>,
    pub events: Arc<EventStore>,
    pub search: Arc<dyn SearchProvider>,
    pub scraper: Arc<Scraper>,
}

// ---------------------------------------------------------------------------
// Argument helpers
// ---------------------------------------------------------------------------

fn required_str(args: &Value, field: &str) -> Result<String, ToolError> {
    args.get(field)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ToolError::InvalidArgs(format!("'{field}' is required")))
}

fn optional_u8(args: &Value, field: &str, default: u8) -> u8 {
    args.get(field).and_then(|v| v.as_u64()).map(|n| n.clamp(1, 10) as u8).unwrap_or(default)
}

// ---------------------------------------------------------------------------
// Search tools
// ---------------------------------------------------------------------------

fn search_namespace(kind: SearchKind) -> (&'static str, Duration) {
    match kind {
        SearchKind::Web => (NS_GOOGLE_SEARCH, Duration::from_secs(5 * 60)),
        SearchKind::News => (NS_NEWS_SEARCH, Duration::from_secs(5 * 60)),
        SearchKind::Image => (NS_IMAGE_SEARCH, Duration::from_secs(60 * 60)),
        SearchKind::Patent => (NS_PATENT_SEARCH, Duration::from_secs(60 * 60)),
        SearchKind::Academic => (NS_ACADEMIC_SEARCH, Duration::from_secs(60 * 60)),
    }
}

/// Cached search for any flavor.
pub async fn cached_search(
    ctx: &Arc<ToolContext>,
    kind: SearchKind,
    query: &str,
    num: u8,
) -> Result<Vec<SearchResult>, ToolError> {
    let (namespace, ttl) = search_namespace(kind);
    let provider = Arc::clone(&ctx.search);
    let owned_query = query.to_string();
    ctx.cache
        .get_or_compute(
            namespace,
            &json!({ "query": query, "num": num }),
            move || async move {
                provider
                    .search(&owned_query, kind, num)
                    .await
                    .map_err(ToolError::from)
            },
            CacheOptions::ttl(ttl),
        )
        .await
}

pub async fn search_tool(
    ctx: &Arc<ToolContext>,
    kind: SearchKind,
    args: &Value,
) -> Result<String, ToolError> {
    let query = required_str(args, "query")?;
    let num = optional_u8(args, "num_results", optional_u8(args, "num", 5));
    let results = cached_search(ctx, kind, &query, num).await?;
    let body = json!({
        "query": query,
        "kind": kind.label(),
        "results": results,
    });
    serde_json::to_string_pretty(&body).map_err(|e| ToolError::Serialization(e.to_string()))
}

// ---------------------------------------------------------------------------
// Scrape tools
// ---------------------------------------------------------------------------

/// Cached scrape: 1h TTL with a 24h stale-while-revalidate window.
pub async fn cached_scrape(
    ctx: &Arc<ToolContext>,
    namespace: &str,
    ttl: Duration,
    url: &str,
) -> Result<ScrapeResult, ToolError> {
    let scraper = Arc::clone(&ctx.scraper);
    let owned_url = url.to_string();
    ctx.cache
        .get_or_compute(
            namespace,
            &json!({ "url": url }),
            move || async move { scraper.scrape(&owned_url).await },
            CacheOptions::ttl(ttl).with_swr(SCRAPE_STALE_TIME),
        )
        .await
}

pub async fn scrape_tool(ctx: &Arc<ToolContext>, args: &Value) -> Result<String, ToolError> {
    let url = required_str(args, "url")?;
    let result = cached_scrape(ctx, NS_SCRAPE, SCRAPE_TTL, &url).await?;
    let body = json!({
        "url": url,
        "content": result.content,
        "citation": result.citation,
    });
    serde_json::to_string_pretty(&body).map_err(|e| ToolError::Serialization(e.to_string()))
}

pub async fn parse_document_tool(
    ctx: &Arc<ToolContext>,
    args: &Value,
) -> Result<String, ToolError> {
    let url = required_str(args, "url")?;
    let result =
        cached_scrape(ctx, NS_DOCUMENT, Duration::from_secs(24 * 60 * 60), &url).await?;
    let body = json!({
        "url": url,
        "text": result.content,
        "citation": result.citation,
    });
    serde_json::to_string_pretty(&body).map_err(|e| ToolError::Serialization(e.to_string()))
}

// ---------------------------------------------------------------------------
// Composite research tool
// ---------------------------------------------------------------------------

pub async fn research_topic_tool(
    ctx: &Arc<ToolContext>,
    args: &Value,
) -> Result<String, ToolError> {
    let query = required_str(args, "query")?;
    let num = optional_u8(args, "num_results", 5);
    let filter_keywords =
        args.get("filter_to_keywords").and_then(|v| v.as_bool()).unwrap_or(false);
    let dedupe = args.get("dedupe_paragraphs").and_then(|v| v.as_bool()).unwrap_or(true);

    let results = cached_search(ctx, SearchKind::Web, &query, num).await?;
    if results.is_empty() {
        return Ok(json!({ "query": query, "sources": [], "content": "" }).to_string());
    }

    // One task per URL with an independent timeout; failures drop the source
    // instead of failing the research call.
    let mut tasks = Vec::new();
    for result in &results {
        let ctx = Arc::clone(ctx);
        let url = result.link.clone();
        let title = result.title.clone();
        tasks.push(tokio::spawn(async move {
            let scraped = tokio::time::timeout(
                crate::types::HEADLESS_TIMEOUT,
                cached_scrape(&ctx, NS_SCRAPE, SCRAPE_TTL, &url),
            )
            .await;
            match scraped {
                Ok(Ok(page)) => Some((title, url, page)),
                Ok(Err(e)) => {
                    debug!(url = url.as_str(), error = %e, "Research scrape failed, skipping");
                    None
                }
                Err(_) => {
                    debug!(url = url.as_str(), "Research scrape timed out, skipping");
                    None
                }
            }
        }));
    }

    let mut sources: Vec<Value> = Vec::new();
    let mut combined = String::new();
    let mut seen_paragraphs: Vec<String> = Vec::new();
    let keywords: Vec<String> = query
        .to_lowercase()
        .split_whitespace()
        .map(|w| w.to_string())
        .collect::<Vec<_>>();

    for task in futures_util::future::join_all(tasks).await {
        let Ok(Some((title, url, page))) = task else {
            continue;
        };
        let capped = crate::extract::truncate_balanced(&page.content, PER_SOURCE_CAP);
        let mut kept: Vec<String> = Vec::new();
        for paragraph in capped.split("\n\n") {
            let paragraph = paragraph.trim();
            if paragraph.is_empty() {
                continue;
            }
            if filter_keywords && !contains_any_keyword(paragraph, &keywords) {
                continue;
            }
            if dedupe && is_duplicate_paragraph(paragraph, &seen_paragraphs) {
                continue;
            }
            if paragraph.len() >= DEDUPE_MIN_CHARS {
                seen_paragraphs.push(paragraph.to_lowercase());
            }
            kept.push(paragraph.to_string());
        }
        if kept.is_empty() {
            continue;
        }
        combined.push_str(&format!("## {title}\n{url}\n\n{}\n\n", kept.join("\n\n")));
        sources.push(json!({ "title": title, "url": url, "citation": page.citation }));
    }

    let body = json!({
        "query": query,
        "sources": sources,
        "content": crate::extract::truncate_balanced(&combined, COMBINED_CAP),
    });
    serde_json::to_string_pretty(&body).map_err(|e| ToolError::Serialization(e.to_string()))
}

fn contains_any_keyword(paragraph: &str, keywords: &[String]) -> bool {
    let lower = paragraph.to_lowercase();
    keywords.iter().any(|k| lower.contains(k))
}

fn is_duplicate_paragraph(paragraph: &str, seen: &[String]) -> bool {
    if paragraph.len() < DEDUPE_MIN_CHARS {
        return false;
    }
    let lower = paragraph.to_lowercase();
    seen.iter().any(|prior| jaccard_similarity(&lower, prior) >= DEDUPE_SIMILARITY)
}

/// Word-set Jaccard similarity.
fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let set_a: HashSet<&str> = a.split_whitespace().collect();
    let set_b: HashSet<&str> = b.split_whitespace().collect();
    if set_a.is_empty() && set_b.is_empty() {
        return 1.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    intersection as f64 / union as f64
}

// ---------------------------------------------------------------------------
// Stats tool
// ---------------------------------------------------------------------------

pub fn cache_stats_tool(ctx: &Arc<ToolContext>) -> Result<String, ToolError> {
    let body = json!({
        "cache": ctx.cache.get_stats(),
        "events": ctx.events.get_stats(),
    });
    serde_json::to_string_pretty(&body).map_err(|e| ToolError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jaccard_detects_near_duplicates() {
        let a = "rust adoption keeps growing across infrastructure teams this year";
        let b = "rust adoption keeps growing across infrastructure teams this month";
        assert!(jaccard_similarity(a, b) >= 0.8);
        assert!(jaccard_similarity(a, "entirely different words about cooking pasta") < 0.1);
    }

    #[test]
    fn short_paragraphs_are_never_deduplicated() {
        let seen = vec!["short line".to_string()];
        assert!(!is_duplicate_paragraph("short line", &seen));
    }

    #[test]
    fn keyword_filter_matches_case_insensitively() {
        let keywords = vec!["rust".to_string(), "cache".to_string()];
        assert!(contains_any_keyword("Rust is fast", &keywords));
        assert!(!contains_any_keyword("Go is also fine", &keywords));
    }
}
