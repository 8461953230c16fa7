//! HTML content extraction: composite text blocks, citation metadata, and
//! the quality heuristics that decide when static HTML is good enough.

use scraper::{Html, Selector};
use serde_json::{json, Value};

/// Text shorter than this is never meaningful.
const MIN_MEANINGFUL_BYTES: usize = 100;

/// Minimum readable remainder after stripping script-like tokens.
const MIN_READABLE_BYTES: usize = 200;

/// Readable remainder must be at least this fraction of the raw HTML.
const MIN_READABLE_RATIO: f64 = 0.10;

#[derive(Debug, Clone, Default)]
pub struct ExtractedPage {
    pub title: Option<String>,
    pub headings: Vec<String>,
    pub paragraphs: Vec<String>,
    pub body_text: String,
}

fn selector(css: &str) -> Selector {
    // The selectors below are string literals; parse failure is a programmer
    // error caught by the unit tests.
    Selector::parse(css).expect("static selector")
}

/// Pull title, headings, paragraphs, and full body text out of a document.
pub fn extract_page(html: &str) -> ExtractedPage {
    let doc = Html::parse_document(html);

    let title = doc
        .select(&selector("title"))
        .next()
        .map(|t| collapse_whitespace(&t.text().collect::<String>()))
        .filter(|t| !t.is_empty());

    let headings: Vec<String> = doc
        .select(&selector("h1, h2, h3, h4, h5, h6"))
        .map(|h| collapse_whitespace(&h.text().collect::<String>()))
        .filter(|h| !h.is_empty())
        .take(40)
        .collect();

    let paragraphs: Vec<String> = doc
        .select(&selector("p"))
        .map(|p| collapse_whitespace(&p.text().collect::<String>()))
        .filter(|p| !p.is_empty())
        .collect();

    let body_text = doc
        .select(&selector("body"))
        .next()
        .map(|b| collapse_whitespace(&b.text().collect::<String>()))
        .unwrap_or_default();

    ExtractedPage { title, headings, paragraphs, body_text }
}

/// Compose the labelled text block served to clients.
pub fn compose_text(page: &ExtractedPage) -> String {
    let mut out = String::new();
    if let Some(title) = &page.title {
        out.push_str("Title: ");
        out.push_str(title);
        out.push_str("\n\n");
    }
    if !page.headings.is_empty() {
        out.push_str("Headings:\n");
        for h in &page.headings {
            out.push_str("- ");
            out.push_str(h);
            out.push('\n');
        }
        out.push('\n');
    }
    if !page.paragraphs.is_empty() {
        out.push_str("Paragraphs:\n");
        out.push_str(&page.paragraphs.join("\n\n"));
        out.push_str("\n\n");
    }
    out.push_str("Body:\n");
    out.push_str(&page.body_text);
    out
}

/// Citation metadata from meta tags and the canonical link.
pub fn extract_citation(html: &str, url: &str) -> Value {
    let doc = Html::parse_document(html);
    let meta = |names: &[&str]| -> Option<String> {
        for name in names {
            let css = format!("meta[name=\"{name}\"], meta[property=\"{name}\"]");
            let parsed = Selector::parse(&css);
            if let Ok(sel) = parsed {
                if let Some(content) =
                    doc.select(&sel).next().and_then(|m| m.value().attr("content"))
                {
                    let content = content.trim();
                    if !content.is_empty() {
                        return Some(content.to_string());
                    }
                }
            }
        }
        None
    };

    let canonical = doc
        .select(&selector("link[rel=\"canonical\"]"))
        .next()
        .and_then(|l| l.value().attr("href"))
        .map(|h| h.to_string());

    json!({
        "url": canonical.unwrap_or_else(|| url.to_string()),
        "title": meta(&["og:title", "twitter:title"]),
        "author": meta(&["author", "article:author"]),
        "publishedAt": meta(&["article:published_time", "date"]),
        "siteName": meta(&["og:site_name"]),
        "description": meta(&["og:description", "description"]),
    })
}

// ---------------------------------------------------------------------------
// Quality gate
// ---------------------------------------------------------------------------

/// Does the static extraction carry real content, or do we need a browser?
///
/// Non-meaningful when the text is under 100 bytes, or when the readable
/// remainder after stripping JSON/script-like tokens is under 200 bytes or
/// under 10% of the raw HTML size.
pub fn is_meaningful(text: &str, raw_html: &str) -> bool {
    if text.len() < MIN_MEANINGFUL_BYTES {
        return false;
    }
    let readable = readable_remainder(text);
    if readable.len() < MIN_READABLE_BYTES {
        return false;
    }
    if !raw_html.is_empty()
        && (readable.len() as f64) < raw_html.len() as f64 * MIN_READABLE_RATIO
    {
        return false;
    }
    true
}

/// Drop tokens that look like serialized code or data rather than prose.
fn readable_remainder(text: &str) -> String {
    text.split_whitespace()
        .filter(|token| {
            !token.chars().any(|c| matches!(c, '{' | '}' | '[' | ']' | '<' | '>' | '=' | ';'))
                && !token.starts_with("function")
                && !token.starts_with("var ")
                && !token.contains("://")
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Cap a string at `max_bytes`, keeping the first and last halves with a
/// marker in between. Splits on char boundaries.
pub fn truncate_balanced(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    const MARKER: &str = "\n\n[... content truncated ...]\n\n";
    let keep = max_bytes.saturating_sub(MARKER.len());
    let half = keep / 2;

    let mut head_end = half.min(text.len());
    while head_end > 0 && !text.is_char_boundary(head_end) {
        head_end -= 1;
    }
    let mut tail_start = text.len().saturating_sub(half);
    while tail_start < text.len() && !text.is_char_boundary(tail_start) {
        tail_start += 1;
    }
    format!("{}{}{}", &text[..head_end], MARKER, &text[tail_start..])
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
