//! Websearch binary — thin CLI shell over the [`websearch_server`] library crate.

use axum::{
    routing::{get, post},
    Router,
};
use clap::Parser;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info};

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use websearch_server::cache::CacheConfig;
use websearch_server::config::{FileConfig, Settings};
use websearch_server::document::TextRunParser;
use websearch_server::events::EventStore;
use websearch_server::mcp::run_mcp;
use websearch_server::persistent::PersistentCache;
use websearch_server::render::ChromiumRenderer;
use websearch_server::scrape::Scraper;
use websearch_server::search::{GoogleCseClient, SearchProvider, UnconfiguredSearch};
use websearch_server::store::PersistStore;
use websearch_server::tools::ToolContext;
use websearch_server::types::{McpAppContext, McpConfig, McpSession, SystemClock};
use websearch_server::youtube::TimedTextFetcher;

// ---------------------------------------------------------------------------
// CLI definition (clap derive)
// ---------------------------------------------------------------------------

/// Web-research MCP server — cached search, scraping, and document tools for LLM clients.
#[derive(Parser)]
#[command(name = "websearch", version, about, long_about = None)]
struct Cli {
    /// Run as MCP stdio server (for MCP clients launched as a subprocess)
    #[arg(long)]
    mcp: bool,

    /// Cache storage directory (default: ./.websearch-cache)
    #[arg(long)]
    storage: Option<PathBuf>,

    /// Load settings from a TOML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Disable eager cache hydration at startup
    #[arg(long)]
    no_eager: bool,

    /// Enable OAuth with authorization server URL
    #[arg(long)]
    auth_issuer: Option<String>,

    /// Comma-separated allowed Origin headers for the MCP HTTP transport
    #[arg(long)]
    allowed_origins: Option<String>,

    /// Bind to 0.0.0.0 instead of 127.0.0.1 (localhost)
    #[arg(long)]
    bind_all: bool,
}

// ---------------------------------------------------------------------------
// Graceful shutdown signal
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }
}

/// Dispose the cache and event store, flushing both. Each step must survive
/// the prior one failing.
fn drive_shutdown(cache: &PersistentCache, events: &EventStore) {
    cache.dispose();
    cache.shutdown_flush();
    events.dispose();
    info!("Shutdown complete");
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    // Structured logging on stderr; stdout belongs to the stdio transport.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("websearch=info".parse().unwrap()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // ---------------------------------------------------------------------------
    // Settings: CLI > env > config file > defaults
    // ---------------------------------------------------------------------------

    let config_path = cli.config.clone().unwrap_or_else(|| PathBuf::from("websearch.toml"));
    let mut settings = Settings::from_sources(FileConfig::load(&config_path));
    if let Some(storage) = cli.storage {
        settings.storage_path = storage;
    }
    if cli.no_eager {
        settings.eager_loading = false;
    }

    // ---------------------------------------------------------------------------
    // Shared state: cache, event store, scraper, search client
    // ---------------------------------------------------------------------------

    let clock = Arc::new(SystemClock);

    let cache = Arc::new(PersistentCache::new(
        CacheConfig {
            default_ttl: settings.default_ttl,
            max_size: settings.max_size,
            ..CacheConfig::default()
        },
        settings.build_policy(),
        PersistStore::new(settings.storage_path.clone()),
        clock.clone(),
        settings.eager_loading,
    ));

    let events = Arc::new(EventStore::new(settings.build_event_config(), clock.clone()));

    let search: Arc<dyn SearchProvider> = match GoogleCseClient::new(
        settings.google_api_key.clone(),
        settings.google_cse_id.clone(),
    ) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!(error = %e, "Search disabled; search tools will return an error");
            Arc::new(UnconfiguredSearch)
        }
    };

    let scraper = Arc::new(Scraper::new(
        settings.build_ssrf_policy(),
        Arc::new(ChromiumRenderer::new()),
        Arc::new(TimedTextFetcher::new(settings.transcript_language.clone())),
        Arc::new(TextRunParser::default()),
        clock.clone(),
    ));

    let tools = Arc::new(ToolContext {
        cache: Arc::clone(&cache),
        events: Arc::clone(&events),
        search,
        scraper,
    });

    info!(
        storage = %settings.storage_path.display(),
        max_size = settings.max_size,
        eager = settings.eager_loading,
        "State constructed"
    );

    // ---------------------------------------------------------------------------
    // Transport: stdio or streamable HTTP
    // ---------------------------------------------------------------------------

    if cli.mcp {
        let ctx = Arc::clone(&tools);
        tokio::select! {
            _ = run_mcp(ctx) => info!("stdin closed"),
            _ = shutdown_signal() => {}
        }
        drive_shutdown(&cache, &events);
        return;
    }

    // Bind address: 127.0.0.1 by default (MCP spec), --bind-all for 0.0.0.0
    let bind_addr = if cli.bind_all { "0.0.0.0" } else { "127.0.0.1" };

    let explicit_port: Option<u16> = std::env::var("PORT").ok().and_then(|p| p.parse().ok());

    let listener = if let Some(port) = explicit_port {
        tokio::net::TcpListener::bind(format!("{bind_addr}:{port}")).await.unwrap_or_else(|e| {
            error!(port = port, error = %e, "Could not bind to port");
            eprintln!("  PORT={port} was set explicitly. Choose a different port.");
            std::process::exit(1);
        })
    } else {
        // Auto-scan: try 8732..=8741
        const BASE: u16 = 8732;
        const RANGE: u16 = 10;
        let mut found = None;
        for port in BASE..BASE + RANGE {
            match tokio::net::TcpListener::bind(format!("{bind_addr}:{port}")).await {
                Ok(l) => {
                    found = Some(l);
                    break;
                }
                Err(_) => continue,
            }
        }
        found.unwrap_or_else(|| {
            error!(range_start = BASE, range_end = BASE + RANGE - 1, "No free port found");
            eprintln!("  Try: PORT=<port> websearch");
            std::process::exit(1);
        })
    };

    let port = listener.local_addr().unwrap().port();

    let cli_allowed_origins: Option<Vec<String>> =
        cli.allowed_origins.map(|s| s.split(',').map(|o| o.trim().to_string()).collect());

    let allowed_origins = cli_allowed_origins.unwrap_or_else(|| {
        vec![
            format!("http://localhost:{port}"),
            format!("http://127.0.0.1:{port}"),
            "http://localhost".to_string(),
            "http://127.0.0.1".to_string(),
            "null".to_string(),
        ]
    });

    let auth = websearch_server::auth::AuthMode::resolve(cli.auth_issuer, settings.auth_token.clone());
    if auth.requires_credentials() {
        info!("Bearer authentication enabled on /mcp");
    }

    let mcp_config = McpConfig {
        allowed_origins,
        auth,
        server_url: format!("http://{bind_addr}:{port}"),
    };

    let sessions: Arc<DashMap<String, McpSession>> = Arc::new(DashMap::new());
    let mcp_ctx = McpAppContext {
        tools: Arc::clone(&tools),
        events: Arc::clone(&events),
        sessions: sessions.clone(),
        config: Arc::new(mcp_config),
    };

    // Bearer enforcement wraps /mcp only; the PRM discovery endpoint and
    // /health must stay reachable without a token.
    let mcp_router = Router::new()
        .route(
            "/mcp",
            post(websearch_server::mcp_http::handle_mcp_post)
                .get(websearch_server::mcp_http::handle_mcp_get)
                .delete(websearch_server::mcp_http::handle_mcp_delete),
        )
        .layer(axum::middleware::from_fn_with_state(
            mcp_ctx.clone(),
            websearch_server::auth::require_bearer,
        ));

    let health_tools = Arc::clone(&tools);
    let app = Router::new()
        .route(
            "/.well-known/oauth-protected-resource/mcp",
            get(websearch_server::auth::protected_resource_metadata),
        )
        .route(
            "/health",
            get(move || {
                let tools = Arc::clone(&health_tools);
                async move {
                    axum::Json(serde_json::json!({
                        "status": "ok",
                        "cache": tools.cache.get_stats(),
                        "events": tools.events.get_stats(),
                    }))
                }
            }),
        )
        .merge(mcp_router)
        .layer(axum::middleware::from_fn_with_state(
            mcp_ctx.clone(),
            websearch_server::auth::enforce_origin,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(mcp_ctx);

    // Session cleanup: prune idle sessions every 5 minutes
    let prune_events = Arc::clone(&events);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
        loop {
            interval.tick().await;
            let cutoff = std::time::Instant::now() - std::time::Duration::from_secs(1800);
            let before = sessions.len();
            let mut dropped_streams = Vec::new();
            sessions.retain(|_, session| {
                let live = session.last_activity > cutoff;
                if !live {
                    dropped_streams.push(session.stream_id.clone());
                }
                live
            });
            for stream_id in &dropped_streams {
                prune_events.remove_stream(stream_id);
            }
            let pruned = before - sessions.len();
            if pruned > 0 {
                debug!(pruned = pruned, remaining = sessions.len(), "Pruned idle MCP sessions");
            }
        }
    });

    info!("MCP HTTP transport at /mcp");
    info!(port = port, "http://localhost:{port}");
    // Machine-readable line for scripts (not through tracing)
    eprintln!("WEBSEARCH_PORT={port}");

    if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await {
        error!(error = %e, "Server error");
    }
    drive_shutdown(&cache, &events);
}
