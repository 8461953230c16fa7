//! Streamable HTTP transport for the MCP protocol (MCP 2025-11-25).
//!
//! Provides `POST /mcp` for JSON-RPC request/response, `GET /mcp` for the
//! SSE stream with `Last-Event-ID` resume, and `DELETE /mcp` for session
//! termination.
//!
//! Session management via `Mcp-Session-Id` header. Every response produced on
//! a session is appended to that session's event stream before it is sent, so
//! a client that drops mid-call can reconnect and replay what it missed.

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    response::Response,
};
use futures_util::stream::{self, Stream, StreamExt};
use std::convert::Infallible;
use std::time::Instant;
use uuid::Uuid;

use crate::mcp::{dispatch_jsonrpc, negotiate_version};
use crate::types::{McpAppContext, McpSession};

const SESSION_HEADER: &str = "mcp-session-id";
const PROTOCOL_VERSION_HEADER: &str = "mcp-protocol-version";
const LAST_EVENT_ID_HEADER: &str = "last-event-id";

// ---------------------------------------------------------------------------
// POST /mcp — JSON-RPC dispatch with session management
// ---------------------------------------------------------------------------

/// Streamable HTTP MCP transport endpoint.
///
/// Handles single JSON-RPC requests and batches (arrays). Creates sessions on
/// `initialize`, validates session ID on all other requests.
pub async fn handle_mcp_post(
    State(ctx): State<McpAppContext>,
    headers: HeaderMap,
    body: String,
) -> Result<Response, Response> {
    // Parse JSON body
    let parsed: serde_json::Value = match serde_json::from_str(&body) {
        Ok(v) => v,
        Err(_) => {
            let err = serde_json::json!({
                "jsonrpc": "2.0",
                "id": null,
                "error": { "code": -32700, "message": "Parse error" }
            });
            return Ok(json_response(StatusCode::BAD_REQUEST, &err));
        }
    };

    let is_batch = parsed.is_array();
    let requests: Vec<serde_json::Value> =
        if is_batch { parsed.as_array().unwrap().clone() } else { vec![parsed] };

    let has_initialize = requests.iter().any(|r| r["method"].as_str() == Some("initialize"));

    let session_id =
        headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()).map(|s| s.to_string());

    // Session validation for non-initialize requests
    if !has_initialize {
        let sid = match session_id.as_ref() {
            Some(s) if ctx.sessions.contains_key(s) => s.clone(),
            Some(_) => {
                return Err(error_response(
                    StatusCode::BAD_REQUEST,
                    "Invalid or expired session ID",
                ));
            }
            None => {
                return Err(error_response(
                    StatusCode::BAD_REQUEST,
                    "Missing Mcp-Session-Id header. Send 'initialize' first.",
                ));
            }
        };

        // Validate MCP-Protocol-Version header
        if let Some(pv) = headers.get(PROTOCOL_VERSION_HEADER).and_then(|v| v.to_str().ok()) {
            if let Some(session) = ctx.sessions.get(&sid) {
                if pv != session.protocol_version {
                    return Err(error_response(
                        StatusCode::BAD_REQUEST,
                        &format!(
                            "Protocol version mismatch: header '{}' != negotiated '{}'",
                            pv, session.protocol_version
                        ),
                    ));
                }
            }
        }
    }

    // Process requests
    let mut responses: Vec<serde_json::Value> = Vec::new();
    let mut new_session_id: Option<String> = None;

    for req in &requests {
        let method = req["method"].as_str().unwrap_or("");

        if method == "initialize" {
            let client_version = req["params"]["protocolVersion"].as_str().unwrap_or("");
            let negotiated = negotiate_version(client_version);

            // The session id doubles as the event-store stream id.
            let sid = Uuid::new_v4().to_string();
            let session = McpSession::new(negotiated.to_string(), sid.clone());
            ctx.sessions.insert(sid.clone(), session);
            new_session_id = Some(sid);

            if let Some(resp) = dispatch_jsonrpc(&ctx.tools, req).await {
                responses.push(resp);
            }
        } else if method.starts_with("notifications/") {
            // Notifications produce no response, but update session activity
            if let Some(ref sid) = session_id {
                if let Some(mut s) = ctx.sessions.get_mut(sid) {
                    s.last_activity = Instant::now();
                }
            }
        } else {
            // A batch can order a request before its initialize; skip those.
            let Some(sid) = session_id.as_ref().or(new_session_id.as_ref()).cloned() else {
                continue;
            };
            if let Some(mut s) = ctx.sessions.get_mut(&sid) {
                s.last_activity = Instant::now();
            }

            if let Some(resp) = dispatch_jsonrpc(&ctx.tools, req).await {
                // Record before sending so a dropped client can resume.
                ctx.events.append(&sid, resp.clone());
                responses.push(resp);
            }
        }
    }

    // Build HTTP response
    if responses.is_empty() {
        // All notifications — 202 Accepted
        return Ok(Response::builder().status(StatusCode::ACCEPTED).body(Body::empty()).unwrap());
    }

    let body_json = if is_batch {
        serde_json::to_string(&responses).unwrap()
    } else {
        serde_json::to_string(&responses[0]).unwrap()
    };

    let mut builder =
        Response::builder().status(StatusCode::OK).header("content-type", "application/json");

    if let Some(ref sid) = new_session_id {
        builder = builder.header(SESSION_HEADER, sid);
    }

    Ok(builder.body(Body::from(body_json)).unwrap())
}

// ---------------------------------------------------------------------------
// GET /mcp — SSE stream with Last-Event-ID resume
// ---------------------------------------------------------------------------

/// Server-sent events stream for a session.
///
/// Replays events newer than `Last-Event-ID` from the event store, then stays
/// open relaying live events for the session.
pub async fn handle_mcp_get(
    State(ctx): State<McpAppContext>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, Response> {
    let sid = match headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) {
        Some(s) if ctx.sessions.contains_key(s) => s.to_string(),
        _ => {
            return Err(error_response(
                StatusCode::BAD_REQUEST,
                "SSE stream requires a valid Mcp-Session-Id header",
            ));
        }
    };

    let last_event_id = headers
        .get(LAST_EVENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);

    let replayed = ctx.events.replay_after(&sid, last_event_id);
    let replay_cursor = replayed.last().map(|e| e.event_id).unwrap_or(last_event_id);
    tracing::debug!(
        session = sid.as_str(),
        after = last_event_id,
        replayed = replayed.len(),
        "SSE stream attached"
    );

    let replay_stream = stream::iter(replayed.into_iter().map(to_sse));

    // Live tail: relay broadcast events for this session, skipping anything
    // already covered by the replay.
    let receiver = ctx.events.subscribe();
    let stream_sid = sid.clone();
    let live_stream = stream::unfold(
        (receiver, stream_sid, replay_cursor),
        |(mut rx, sid, cursor)| async move {
            loop {
                match rx.recv().await {
                    Ok(event) if event.stream_id == sid && event.event_id > cursor => {
                        let next = event.event_id;
                        return Some((to_sse(event), (rx, sid, next)));
                    }
                    Ok(_) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            session = sid.as_str(),
                            skipped = skipped,
                            "SSE subscriber lagged; client should resume via Last-Event-ID"
                        );
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
                }
            }
        },
    );

    Ok(Sse::new(replay_stream.chain(live_stream)).keep_alive(KeepAlive::default()))
}

fn to_sse(event: crate::events::Event) -> Result<SseEvent, Infallible> {
    Ok(SseEvent::default()
        .id(event.event_id.to_string())
        .event("message")
        .data(event.message.to_string()))
}

// ---------------------------------------------------------------------------
// DELETE /mcp — Session termination
// ---------------------------------------------------------------------------

pub async fn handle_mcp_delete(State(ctx): State<McpAppContext>, headers: HeaderMap) -> StatusCode {
    if let Some(sid) = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) {
        if let Some((_, session)) = ctx.sessions.remove(sid) {
            ctx.events.remove_stream(&session.stream_id);
        }
    }
    StatusCode::OK
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn json_response(status: StatusCode, body: &serde_json::Value) -> Response {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(body).unwrap()))
        .unwrap()
}

fn error_response(status: StatusCode, message: &str) -> Response {
    let body = serde_json::json!({
        "jsonrpc": "2.0",
        "id": null,
        "error": { "code": -32600, "message": message }
    });
    json_response(status, &body)
}
