//! YouTube transcript path: video-id detection and the transcript client.

use async_trait::async_trait;
use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptErrorKind {
    /// No transcript exists for the video.
    NotAvailable,
    /// The channel disabled transcripts.
    Disabled,
    Network,
    Other,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("transcript error ({kind:?}) for video {video_id}: {reason}")]
pub struct TranscriptError {
    pub kind: TranscriptErrorKind,
    pub video_id: String,
    pub reason: String,
}

impl TranscriptError {
    pub fn new(kind: TranscriptErrorKind, video_id: &str, reason: impl Into<String>) -> Self {
        Self { kind, video_id: video_id.to_string(), reason: reason.into() }
    }
}

/// Match `youtu.be/<id>` and `youtube.com/watch?v=<id>` URLs.
pub fn extract_video_id(url: &str) -> Option<String> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let re = PATTERN.get_or_init(|| {
        Regex::new(r"(?:youtu\.be/|youtube\.com/watch\?(?:[^#]*&)?v=)([A-Za-z0-9_-]{6,})")
            .expect("static regex")
    });
    re.captures(url).map(|c| c[1].to_string())
}

/// External transcript client. Production talks to YouTube's caption
/// endpoint; tests substitute a stub.
#[async_trait]
pub trait TranscriptFetcher: Send + Sync {
    async fn fetch_transcript(&self, video_id: &str) -> Result<String, TranscriptError>;
}

/// Transcript client over the public timedtext endpoint.
pub struct TimedTextFetcher {
    http: reqwest::Client,
    language: String,
}

impl TimedTextFetcher {
    pub fn new(language: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("HTTP client construction");
        Self { http, language: language.into() }
    }
}

#[async_trait]
impl TranscriptFetcher for TimedTextFetcher {
    async fn fetch_transcript(&self, video_id: &str) -> Result<String, TranscriptError> {
        let url = format!(
            "https://video.google.com/timedtext?lang={}&v={}",
            self.language, video_id
        );
        let response = self.http.get(&url).send().await.map_err(|e| {
            TranscriptError::new(TranscriptErrorKind::Network, video_id, e.to_string())
        })?;

        if response.status() == reqwest::StatusCode::FORBIDDEN {
            return Err(TranscriptError::new(
                TranscriptErrorKind::Disabled,
                video_id,
                "captions are disabled for this video",
            ));
        }
        if !response.status().is_success() {
            return Err(TranscriptError::new(
                TranscriptErrorKind::Network,
                video_id,
                format!("transcript endpoint returned {}", response.status()),
            ));
        }

        let body = response.text().await.map_err(|e| {
            TranscriptError::new(TranscriptErrorKind::Network, video_id, e.to_string())
        })?;
        let transcript = strip_timedtext_markup(&body);
        if transcript.is_empty() {
            return Err(TranscriptError::new(
                TranscriptErrorKind::NotAvailable,
                video_id,
                "no transcript available",
            ));
        }
        Ok(transcript)
    }
}

/// Flatten the timedtext XML into plain caption text.
fn strip_timedtext_markup(xml: &str) -> String {
    static TAGS: OnceLock<Regex> = OnceLock::new();
    let tags = TAGS.get_or_init(|| Regex::new(r"<[^>]+>").expect("static regex"));
    let text = tags.replace_all(xml, " ");
    text.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
