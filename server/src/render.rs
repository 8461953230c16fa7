//! Headless-browser rendering fallback for JavaScript-heavy pages.
//!
//! The orchestrator talks to a [`PageRenderer`] trait; production wires in
//! [`ChromiumRenderer`], tests substitute a stub. The browser is launched
//! lazily on the first render and reused afterwards.

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use url::Url;

use crate::scrape::ScrapeError;

/// Hosts that render nothing useful without JavaScript; the static path is
/// skipped entirely for them.
pub const SPA_HOSTS: &[&str] = &[
    "twitter.com",
    "x.com",
    "instagram.com",
    "facebook.com",
    "linkedin.com",
    "reddit.com",
    "tiktok.com",
    "threads.net",
];

/// Wait ceiling for network-idle after `domcontentloaded`.
const NETWORK_IDLE_TIMEOUT: Duration = Duration::from_secs(15);

/// Settle delay after navigation completes.
const SETTLE_DELAY: Duration = Duration::from_secs(2);

/// Extra wait applied to known SPA hosts before scraping the DOM.
const SPA_EXTRA_WAIT: Duration = Duration::from_secs(3);

pub fn is_spa_host(url: &Url) -> bool {
    let Some(host) = url.host_str() else {
        return false;
    };
    let host = host.trim_start_matches("www.").to_ascii_lowercase();
    SPA_HOSTS.iter().any(|spa| host == *spa || host.ends_with(&format!(".{spa}")))
}

/// Render a URL to its post-JavaScript HTML.
#[async_trait]
pub trait PageRenderer: Send + Sync {
    async fn render(&self, url: &Url) -> Result<String, ScrapeError>;
}

// ---------------------------------------------------------------------------
// Chromium implementation
// ---------------------------------------------------------------------------

pub struct ChromiumRenderer {
    browser: Mutex<Option<Arc<Browser>>>,
}

impl ChromiumRenderer {
    pub fn new() -> Self {
        Self { browser: Mutex::new(None) }
    }

    async fn browser(&self) -> Result<Arc<Browser>, ScrapeError> {
        let mut guard = self.browser.lock().await;
        if let Some(browser) = guard.as_ref() {
            return Ok(Arc::clone(browser));
        }

        let config = BrowserConfig::builder()
            .no_sandbox()
            .build()
            .map_err(|e| ScrapeError::render("browser config", e))?;
        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| ScrapeError::render("browser launch", e.to_string()))?;
        // The CDP event pump runs for the life of the browser.
        tokio::spawn(async move { while handler.next().await.is_some() {} });

        let browser = Arc::new(browser);
        *guard = Some(Arc::clone(&browser));
        debug!("Headless browser launched");
        Ok(browser)
    }
}

impl Default for ChromiumRenderer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PageRenderer for ChromiumRenderer {
    async fn render(&self, url: &Url) -> Result<String, ScrapeError> {
        let browser = self.browser().await?;
        let page = browser
            .new_page(url.as_str())
            .await
            .map_err(|e| ScrapeError::render(url.as_str(), e.to_string()))?;

        // domcontentloaded fires inside new_page; bound the network-idle wait.
        if tokio::time::timeout(NETWORK_IDLE_TIMEOUT, page.wait_for_navigation())
            .await
            .is_err()
        {
            warn!(url = url.as_str(), "Network-idle wait timed out, scraping current DOM");
        }
        tokio::time::sleep(SETTLE_DELAY).await;

        if is_spa_host(url) {
            // Nudge lazy-loaded feeds, then let the framework paint.
            let _ = page
                .evaluate("window.scrollTo(0, document.body.scrollHeight)")
                .await;
            tokio::time::sleep(SPA_EXTRA_WAIT).await;
            let _ = page.evaluate("window.scrollTo(0, 0)").await;
        }

        let html = page
            .content()
            .await
            .map_err(|e| ScrapeError::render(url.as_str(), e.to_string()))?;
        let _ = page.close().await;
        Ok(html)
    }
}
