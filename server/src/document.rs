//! Document parsing contract: byte buffer in, text + metadata out.
//!
//! The real PDF/DOCX/PPTX parsers are external collaborators; this module
//! pins down the shared invariant (typed error or parsed text, never a
//! panic) plus content-kind detection from URL extension and Content-Type.

use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Pdf,
    Docx,
    Pptx,
}

impl DocumentKind {
    pub fn label(&self) -> &'static str {
        match self {
            DocumentKind::Pdf => "pdf",
            DocumentKind::Docx => "docx",
            DocumentKind::Pptx => "pptx",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentErrorKind {
    UnsupportedFormat,
    TooLarge,
    Parse,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("document error ({kind:?}): {reason}")]
pub struct DocumentError {
    pub kind: DocumentErrorKind,
    pub reason: String,
}

impl DocumentError {
    pub fn new(kind: DocumentErrorKind, reason: impl Into<String>) -> Self {
        Self { kind, reason: reason.into() }
    }
}

#[derive(Debug, Clone)]
pub struct ParsedDocument {
    pub text: String,
    pub metadata: Value,
}

/// Detect a parseable document from the URL path and/or the Content-Type
/// header. Extension wins; the header is the fallback for extensionless URLs.
pub fn detect_kind(url_path: &str, content_type: Option<&str>) -> Option<DocumentKind> {
    let path = url_path.to_ascii_lowercase();
    if path.ends_with(".pdf") {
        return Some(DocumentKind::Pdf);
    }
    if path.ends_with(".docx") {
        return Some(DocumentKind::Docx);
    }
    if path.ends_with(".pptx") {
        return Some(DocumentKind::Pptx);
    }
    match content_type.map(|c| c.split(';').next().unwrap_or(c).trim().to_ascii_lowercase()) {
        Some(ct) if ct == "application/pdf" => Some(DocumentKind::Pdf),
        Some(ct)
            if ct == "application/vnd.openxmlformats-officedocument.wordprocessingml.document" =>
        {
            Some(DocumentKind::Docx)
        }
        Some(ct)
            if ct
                == "application/vnd.openxmlformats-officedocument.presentationml.presentation" =>
        {
            Some(DocumentKind::Pptx)
        }
        _ => None,
    }
}

/// The parser seam. Implementations must turn a byte buffer into text and
/// metadata or a [`DocumentError`] — parse failures never unwind.
pub trait DocumentParser: Send + Sync {
    fn parse(&self, kind: DocumentKind, bytes: &[u8]) -> Result<ParsedDocument, DocumentError>;
}

/// Fallback parser that recovers printable text runs from the raw bytes.
///
/// Not a substitute for a format-aware parser, but it extracts uncompressed
/// PDF text objects and the XML prose inside unzipped OOXML parts, and it
/// keeps the contract total until a real parser is plugged in.
pub struct TextRunParser {
    /// Minimum run length kept, in characters.
    pub min_run: usize,
}

impl Default for TextRunParser {
    fn default() -> Self {
        Self { min_run: 4 }
    }
}

impl DocumentParser for TextRunParser {
    fn parse(&self, kind: DocumentKind, bytes: &[u8]) -> Result<ParsedDocument, DocumentError> {
        if kind == DocumentKind::Pdf && !bytes.starts_with(b"%PDF") {
            return Err(DocumentError::new(
                DocumentErrorKind::Parse,
                "missing %PDF header",
            ));
        }

        let mut runs: Vec<String> = Vec::new();
        let mut current = String::new();
        for &b in bytes {
            if (0x20..0x7f).contains(&b) || b == b'\n' {
                current.push(b as char);
            } else if !current.is_empty() {
                if current.trim().chars().count() >= self.min_run {
                    runs.push(current.trim().to_string());
                }
                current.clear();
            }
        }
        if current.trim().chars().count() >= self.min_run {
            runs.push(current.trim().to_string());
        }

        let text = runs.join("\n");
        if text.is_empty() {
            return Err(DocumentError::new(
                DocumentErrorKind::Parse,
                format!("no extractable text in {} buffer", kind.label()),
            ));
        }
        Ok(ParsedDocument {
            metadata: json!({
                "format": kind.label(),
                "bytes": bytes.len(),
                "extractor": "text-runs",
            }),
            text,
        })
    }
}
