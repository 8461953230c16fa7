//! Integration tests for the MCP tool surface via dispatch_jsonrpc().
//!
//! Each test builds a ToolContext with stubbed collaborators, then sends
//! JSON-RPC requests and validates the responses.

mod helpers;

use helpers::TestHarness;
use serde_json::json;

// ---------------------------------------------------------------------------
// Protocol tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_initialize() {
    let h = TestHarness::new();
    let resp = h.initialize().await;

    // Should negotiate the requested protocol version
    let version = resp["result"]["protocolVersion"].as_str().unwrap();
    assert_eq!(version, "2025-11-25");

    // Should report server info
    let name = resp["result"]["serverInfo"]["name"].as_str().unwrap();
    assert_eq!(name, "websearch");

    // Should include tools capability
    assert!(resp["result"]["capabilities"]["tools"].is_object());
}

#[tokio::test]
async fn test_initialize_falls_back_to_latest_version() {
    let h = TestHarness::new();
    let resp = h
        .request("initialize", json!({ "protocolVersion": "1999-01-01" }))
        .await
        .unwrap();
    assert_eq!(resp["result"]["protocolVersion"], "2025-11-25");
}

#[tokio::test]
async fn test_ping() {
    let h = TestHarness::new();
    let resp = h.request("ping", json!({})).await.unwrap();
    assert!(resp["result"].is_object());
}

#[tokio::test]
async fn test_unknown_method() {
    let h = TestHarness::new();
    let resp = h.request("definitely/not-a-method", json!({})).await.unwrap();
    assert_eq!(resp["error"]["code"], -32601);
}

#[tokio::test]
async fn test_notifications_produce_no_response() {
    let h = TestHarness::new();
    let msg = json!({
        "jsonrpc": "2.0",
        "method": "notifications/initialized",
    });
    let resp = websearch_server::mcp::dispatch_jsonrpc(&h.tools, &msg).await;
    assert!(resp.is_none());
}

#[tokio::test]
async fn test_tools_list_contains_full_surface() {
    let h = TestHarness::new();
    let resp = h.request("tools/list", json!({})).await.unwrap();
    let tools = resp["result"]["tools"].as_array().unwrap();

    let names: Vec<&str> = tools.iter().filter_map(|t| t["name"].as_str()).collect();
    for expected in [
        "google_search",
        "news_search",
        "image_search",
        "patent_search",
        "academic_search",
        "scrape_page",
        "parse_document",
        "research_topic",
        "cache_stats",
    ] {
        assert!(names.contains(&expected), "missing tool {expected}");
    }

    // Every tool declares an input schema and annotations.
    for tool in tools {
        assert!(tool["inputSchema"]["type"] == "object", "schema for {}", tool["name"]);
        assert!(tool["annotations"]["readOnlyHint"] == true);
    }
}

// ---------------------------------------------------------------------------
// Search tools
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_google_search_returns_results() {
    let h = TestHarness::new();
    let (text, is_err) = h.call_tool("google_search", json!({ "query": "rust caching" })).await;
    assert!(!is_err, "google_search errored: {text}");

    let body: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(body["query"], "rust caching");
    assert_eq!(body["kind"], "web");
    assert_eq!(body["results"].as_array().unwrap().len(), 2);
    assert!(body["results"][0]["link"].as_str().unwrap().starts_with("https://"));
}

#[tokio::test]
async fn test_search_kinds_are_routed() {
    let h = TestHarness::new();
    for (tool, kind) in [
        ("news_search", "news"),
        ("image_search", "image"),
        ("patent_search", "patent"),
        ("academic_search", "academic"),
    ] {
        let (text, is_err) = h.call_tool(tool, json!({ "query": "q" })).await;
        assert!(!is_err, "{tool} errored: {text}");
        let body: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(body["kind"], kind, "wrong kind for {tool}");
    }
}

#[tokio::test]
async fn test_identical_searches_hit_the_cache() {
    let h = TestHarness::new();
    let args = json!({ "query": "cache me" });
    let _ = h.call_tool("google_search", args.clone()).await;
    let _ = h.call_tool("google_search", args).await;

    let stats = h.tools.cache.get_stats();
    assert_eq!(stats.metrics.hits, 1, "second identical search is a hit");
    assert_eq!(stats.metrics.misses, 1);
}

#[tokio::test]
async fn test_missing_query_is_a_tool_error() {
    let h = TestHarness::new();
    let (text, is_err) = h.call_tool("google_search", json!({})).await;
    assert!(is_err);
    assert!(text.contains("'query' is required"), "unexpected message: {text}");
}

#[tokio::test]
async fn test_unknown_tool_is_a_tool_error() {
    let h = TestHarness::new();
    let (text, is_err) = h.call_tool("not_a_tool", json!({})).await;
    assert!(is_err);
    assert!(text.contains("Unknown tool"), "unexpected message: {text}");
}

// ---------------------------------------------------------------------------
// Scrape tool errors surface as structured text
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_scrape_page_rejects_blocked_urls() {
    let h = TestHarness::new();
    let (text, is_err) =
        h.call_tool("scrape_page", json!({ "url": "http://127.0.0.1/admin" })).await;
    assert!(is_err);
    assert!(text.contains("SSRF protection"), "unexpected message: {text}");
}

#[tokio::test]
async fn test_scrape_page_rejects_malformed_urls() {
    let h = TestHarness::new();
    let (text, is_err) = h.call_tool("scrape_page", json!({ "url": "not a url" })).await;
    assert!(is_err);
    assert!(text.contains("invalid URL"), "unexpected message: {text}");
}

// ---------------------------------------------------------------------------
// Stats tool
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_cache_stats_reports_both_layers() {
    let h = TestHarness::new();
    let _ = h.call_tool("google_search", json!({ "query": "warm the cache" })).await;

    let (text, is_err) = h.call_tool("cache_stats", json!({})).await;
    assert!(!is_err, "cache_stats errored: {text}");
    let body: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(body["cache"]["size"], 1);
    assert!(body["cache"]["hitRatio"].is_string());
    assert!(body["events"]["streams"].is_number());
}
