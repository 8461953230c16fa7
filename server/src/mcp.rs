//! MCP JSON-RPC server implementing the Model Context Protocol.
//!
//! Handles tool dispatch for the web-research tool set (`google_search`,
//! `news_search`, `image_search`, `patent_search`, `academic_search`,
//! `scrape_page`, `parse_document`, `research_topic`, `cache_stats`),
//! protocol version negotiation, and the stdio transport loop. The streamable
//! HTTP transport reuses [`dispatch_jsonrpc`].

use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::search::SearchKind;
use crate::tools::{
    cache_stats_tool, parse_document_tool, research_topic_tool, scrape_tool, search_tool,
    ToolContext,
};

// ---------------------------------------------------------------------------
// Tool definitions
// ---------------------------------------------------------------------------

fn tool_definitions() -> serde_json::Value {
    // Shared annotation sets (MCP spec 2025-11-25). Every tool reaches the
    // open web, none mutates anything client-visible.
    let ro_web = serde_json::json!({
        "readOnlyHint": true,
        "destructiveHint": false,
        "idempotentHint": true,
        "openWorldHint": true
    });
    let ro_local = serde_json::json!({
        "readOnlyHint": true,
        "destructiveHint": false,
        "idempotentHint": true,
        "openWorldHint": false
    });

    let query_schema = |desc: &str| {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": desc },
                "num_results": { "type": "integer", "description": "Result count, 1-10. Default: 5" }
            },
            "required": ["query"]
        })
    };

    serde_json::json!([
        {
            "name": "google_search",
            "annotations": ro_web,
            "description": "Web search via Google Custom Search. Returns ranked results with title, link, and snippet. Results are cached for 5 minutes. Follow up with scrape_page to read a result, or use research_topic to search and read in one call.",
            "inputSchema": query_schema("Search terms")
        },
        {
            "name": "news_search",
            "annotations": ro_web,
            "description": "News search, most recent first. Same shape as google_search with a date-sorted index.",
            "inputSchema": query_schema("News search terms")
        },
        {
            "name": "image_search",
            "annotations": ro_web,
            "description": "Image search. Results include a thumbnail URL per hit.",
            "inputSchema": query_schema("Image search terms")
        },
        {
            "name": "patent_search",
            "annotations": ro_web,
            "description": "Patent search restricted to Google Patents.",
            "inputSchema": query_schema("Patent search terms (inventor, technology, patent number)")
        },
        {
            "name": "academic_search",
            "annotations": ro_web,
            "description": "Scholarly search restricted to academic hosts (arXiv, PubMed, Semantic Scholar, JSTOR).",
            "inputSchema": query_schema("Academic search terms")
        },
        {
            "name": "scrape_page",
            "annotations": ro_web,
            "description": "Read a web page, YouTube transcript, or linked document. Static pages are parsed directly; JavaScript-heavy pages fall back to a headless browser automatically. YouTube URLs return the video transcript. Results are cached for 1 hour and served stale for up to 24 hours while refreshing.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "url": { "type": "string", "description": "Absolute http(s) URL to read" }
                },
                "required": ["url"]
            }
        },
        {
            "name": "parse_document",
            "annotations": ro_web,
            "description": "Fetch and extract text from a PDF, DOCX, or PPTX document by URL.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "url": { "type": "string", "description": "Absolute http(s) URL of the document" }
                },
                "required": ["url"]
            }
        },
        {
            "name": "research_topic",
            "annotations": ro_web,
            "description": "Multi-step research: search the web, read the top results in parallel, and return a combined, deduplicated digest with per-source citations. Sources that fail or time out are skipped.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "Research question or topic" },
                    "num_results": { "type": "integer", "description": "Sources to read, 1-10. Default: 5" },
                    "filter_to_keywords": { "type": "boolean", "description": "Keep only paragraphs containing query keywords. Default: false" },
                    "dedupe_paragraphs": { "type": "boolean", "description": "Drop near-duplicate paragraphs across sources. Default: true" }
                },
                "required": ["query"]
            }
        },
        {
            "name": "cache_stats",
            "annotations": ro_local,
            "description": "Cache and event-store statistics: sizes, hit ratio, pending computations, evictions.",
            "inputSchema": {
                "type": "object",
                "properties": {},
                "additionalProperties": false
            }
        }
    ])
}

// ---------------------------------------------------------------------------
// Tool call handler
// ---------------------------------------------------------------------------

async fn handle_tool_call(
    ctx: &Arc<ToolContext>,
    name: &str,
    args: &serde_json::Value,
) -> (String, bool) {
    let result = match name {
        "google_search" => search_tool(ctx, SearchKind::Web, args).await,
        "news_search" => search_tool(ctx, SearchKind::News, args).await,
        "image_search" => search_tool(ctx, SearchKind::Image, args).await,
        "patent_search" => search_tool(ctx, SearchKind::Patent, args).await,
        "academic_search" => search_tool(ctx, SearchKind::Academic, args).await,
        "scrape_page" => scrape_tool(ctx, args).await,
        "parse_document" => parse_document_tool(ctx, args).await,
        "research_topic" => research_topic_tool(ctx, args).await,
        "cache_stats" => cache_stats_tool(ctx),
        _ => return (format!("Unknown tool: {name}"), true),
    };
    match result {
        Ok(text) => (text, false),
        Err(e) => (e.to_string(), true),
    }
}

// ---------------------------------------------------------------------------
// Protocol version negotiation
// ---------------------------------------------------------------------------

pub(crate) const SUPPORTED_VERSIONS: &[&str] = &["2025-11-25", "2025-06-18"];
pub(crate) const LATEST_VERSION: &str = "2025-11-25";

/// Negotiate protocol version: echo client's version if supported, else return latest.
pub(crate) fn negotiate_version(client_version: &str) -> &'static str {
    SUPPORTED_VERSIONS
        .iter()
        .find(|&&v| v == client_version)
        .copied()
        .unwrap_or(LATEST_VERSION)
}

// ---------------------------------------------------------------------------
// Shared JSON-RPC dispatch (used by both stdio and HTTP transports)
// ---------------------------------------------------------------------------

/// Process a single JSON-RPC request and return the response.
///
/// Returns `None` for notifications (no `id` field). Init-ordering
/// enforcement happens in the transports, not here.
pub async fn dispatch_jsonrpc(
    ctx: &Arc<ToolContext>,
    msg: &serde_json::Value,
) -> Option<serde_json::Value> {
    let method = msg["method"].as_str().unwrap_or("");
    let id = msg.get("id").cloned();

    // Notifications have no id and produce no response
    if id.is_none() || method.starts_with("notifications/") {
        return None;
    }

    let response = match method {
        "initialize" => {
            let client_version = msg["params"]["protocolVersion"].as_str().unwrap_or("");
            let negotiated = negotiate_version(client_version);
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "protocolVersion": negotiated,
                    "capabilities": {
                        "tools": { "listChanged": false }
                    },
                    "serverInfo": {
                        "name": "websearch",
                        "version": env!("CARGO_PKG_VERSION")
                    },
                    "instructions": "Web research tools. Start with google_search for discovery, scrape_page to read a URL (handles JavaScript pages, YouTube transcripts, and documents), and research_topic to search and read several sources in one call. Results are cached; identical concurrent calls share one upstream request."
                }
            })
        }
        "tools/list" => {
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "tools": tool_definitions()
                }
            })
        }
        "tools/call" => {
            let tool_name = msg["params"]["name"].as_str().unwrap_or("");
            let arguments =
                msg["params"].get("arguments").cloned().unwrap_or(serde_json::json!({}));

            let (text, is_error) = handle_tool_call(ctx, tool_name, &arguments).await;

            // Never set isError: true — clients treat it as a hard failure and
            // cancel sibling parallel calls. The prefix lets the model detect
            // and recover instead.
            let content_text = if is_error { format!("\u{26a0} Error: {text}") } else { text };
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "content": [{ "type": "text", "text": content_text }],
                    "isError": false
                }
            })
        }
        "ping" => {
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {}
            })
        }
        _ => {
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": -32601, "message": "Method not found" }
            })
        }
    };

    Some(response)
}

// ---------------------------------------------------------------------------
// MCP stdio server loop
// ---------------------------------------------------------------------------

/// Run the MCP stdio server loop, reading JSON-RPC from stdin and writing
/// responses to stdout. Logging goes to stderr only.
pub async fn run_mcp(ctx: Arc<ToolContext>) {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    let mut lines = stdin.lines();
    let mut initialized = false;

    tracing::info!("MCP stdio server ready");

    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }

        let msg: serde_json::Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(_) => {
                let err = serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": null,
                    "error": { "code": -32700, "message": "Parse error" }
                });
                write_line(&mut stdout, &err).await;
                continue;
            }
        };

        let method = msg["method"].as_str().unwrap_or("");

        // Notifications produce no response
        if method.starts_with("notifications/") {
            continue;
        }

        // Init ordering enforcement: reject non-init requests before initialize
        if !initialized && method != "initialize" && method != "ping" {
            if let Some(id) = msg.get("id").cloned() {
                let err = serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {
                        "code": -32002,
                        "message": "Server not initialized. Send 'initialize' first."
                    }
                });
                write_line(&mut stdout, &err).await;
            }
            continue;
        }

        if let Some(response) = dispatch_jsonrpc(&ctx, &msg).await {
            if method == "initialize" {
                initialized = true;
            }
            write_line(&mut stdout, &response).await;
        }
    }
}

async fn write_line(stdout: &mut tokio::io::Stdout, value: &serde_json::Value) {
    let line = match serde_json::to_string(value) {
        Ok(l) => l,
        Err(_) => return,
    };
    let _ = stdout.write_all(line.as_bytes()).await;
    let _ = stdout.write_all(b"\n").await;
    let _ = stdout.flush().await;
}
