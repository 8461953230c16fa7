//! Google Custom Search client, shaped per search flavor.
//!
//! One provider trait covers web, news, image, patent, and academic search;
//! the flavors differ only in the query parameters sent to the CSE endpoint.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::SEARCH_TIMEOUT;

const CSE_ENDPOINT: &str = "https://www.googleapis.com/customsearch/v1";

/// Hosts appended to academic queries as `site:` restrictions.
const ACADEMIC_HOSTS: &[&str] =
    &["arxiv.org", "pubmed.ncbi.nlm.nih.gov", "semanticscholar.org", "jstor.org"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchKind {
    Web,
    News,
    Image,
    Patent,
    Academic,
}

impl SearchKind {
    pub fn label(&self) -> &'static str {
        match self {
            SearchKind::Web => "web",
            SearchKind::News => "news",
            SearchKind::Image => "image",
            SearchKind::Patent => "patent",
            SearchKind::Academic => "academic",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SearchError {
    #[error("search credentials missing: set GOOGLE_API_KEY and GOOGLE_CSE_ID")]
    MissingCredentials,
    #[error("search request failed: {0}")]
    Http(String),
    #[error("search API returned HTTP {0}")]
    Status(u16),
    #[error("search response could not be decoded: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub link: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    #[serde(rename = "displayLink", skip_serializing_if = "Option::is_none")]
    pub display_link: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(
        &self,
        query: &str,
        kind: SearchKind,
        num: u8,
    ) -> Result<Vec<SearchResult>, SearchError>;
}

/// Stand-in provider when credentials are absent: every call surfaces
/// [`SearchError::MissingCredentials`] instead of failing at startup.
pub struct UnconfiguredSearch;

#[async_trait]
impl SearchProvider for UnconfiguredSearch {
    async fn search(
        &self,
        _query: &str,
        _kind: SearchKind,
        _num: u8,
    ) -> Result<Vec<SearchResult>, SearchError> {
        Err(SearchError::MissingCredentials)
    }
}

// ---------------------------------------------------------------------------
// Google CSE implementation
// ---------------------------------------------------------------------------

pub struct GoogleCseClient {
    http: reqwest::Client,
    api_key: String,
    cse_id: String,
}

impl GoogleCseClient {
    pub fn new(api_key: String, cse_id: String) -> Result<Self, SearchError> {
        if api_key.is_empty() || cse_id.is_empty() {
            return Err(SearchError::MissingCredentials);
        }
        let http = reqwest::Client::builder()
            .timeout(SEARCH_TIMEOUT)
            .build()
            .map_err(|e| SearchError::Http(e.to_string()))?;
        Ok(Self { http, api_key, cse_id })
    }
}

// Wire types for the CSE response; only the fields we surface.

#[derive(Deserialize)]
struct CseResponse {
    items: Option<Vec<CseItem>>,
}

#[derive(Deserialize)]
struct CseItem {
    title: Option<String>,
    link: Option<String>,
    snippet: Option<String>,
    #[serde(rename = "displayLink")]
    display_link: Option<String>,
    image: Option<CseImage>,
}

#[derive(Deserialize)]
struct CseImage {
    #[serde(rename = "thumbnailLink")]
    thumbnail_link: Option<String>,
}

#[async_trait]
impl SearchProvider for GoogleCseClient {
    async fn search(
        &self,
        query: &str,
        kind: SearchKind,
        num: u8,
    ) -> Result<Vec<SearchResult>, SearchError> {
        let num = num.clamp(1, 10).to_string();
        let mut params: Vec<(&str, String)> = vec![
            ("key", self.api_key.clone()),
            ("cx", self.cse_id.clone()),
            ("num", num),
        ];
        match kind {
            SearchKind::Web => params.push(("q", query.to_string())),
            SearchKind::News => {
                params.push(("q", query.to_string()));
                params.push(("sort", "date".to_string()));
            }
            SearchKind::Image => {
                params.push(("q", query.to_string()));
                params.push(("searchType", "image".to_string()));
            }
            SearchKind::Patent => {
                params.push(("q", query.to_string()));
                params.push(("siteSearch", "patents.google.com".to_string()));
                params.push(("siteSearchFilter", "i".to_string()));
            }
            SearchKind::Academic => {
                let sites = ACADEMIC_HOSTS
                    .iter()
                    .map(|h| format!("site:{h}"))
                    .collect::<Vec<_>>()
                    .join(" OR ");
                params.push(("q", format!("{query} ({sites})")));
            }
        }

        let response = self
            .http
            .get(CSE_ENDPOINT)
            .query(&params)
            .send()
            .await
            .map_err(|e| SearchError::Http(e.to_string()))?;
        if !response.status().is_success() {
            return Err(SearchError::Status(response.status().as_u16()));
        }
        let body: CseResponse =
            response.json().await.map_err(|e| SearchError::Decode(e.to_string()))?;

        Ok(body
            .items
            .unwrap_or_default()
            .into_iter()
            .filter_map(|item| {
                Some(SearchResult {
                    title: item.title?,
                    link: item.link?,
                    snippet: item.snippet,
                    display_link: item.display_link,
                    thumbnail: item.image.and_then(|i| i.thumbnail_link),
                })
            })
            .collect())
    }
}
