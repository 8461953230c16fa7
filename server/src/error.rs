//! Crate-wide tool error.
//!
//! Every failure a tool computation can surface is folded into [`ToolError`].
//! The type is `Clone` because cache single-flight shares one computation
//! outcome between all concurrent awaiters.

use crate::breaker::BreakerError;
use crate::document::DocumentError;
use crate::scrape::ScrapeError;
use crate::search::SearchError;
use crate::ssrf::SsrfError;
use crate::youtube::TranscriptError;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ToolError {
    #[error(transparent)]
    Ssrf(#[from] SsrfError),
    #[error(transparent)]
    Breaker(#[from] BreakerError),
    #[error(transparent)]
    Scrape(#[from] ScrapeError),
    #[error(transparent)]
    Transcript(#[from] TranscriptError),
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error(transparent)]
    Search(#[from] SearchError),
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),
    #[error("serialization: {0}")]
    Serialization(String),
}
