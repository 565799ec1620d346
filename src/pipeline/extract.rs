//! Context documents: plain text pulled from local files and appended to
//! every analysis request.
//!
//! Only text-family formats are read. Any other extension produces a
//! placeholder line so one odd attachment never fails a whole batch.

use crate::error::PipelineError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Text extracted from one context document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedDocument {
    pub path: PathBuf,
    pub text: String,
    /// False when `text` is the unsupported-type placeholder.
    pub supported: bool,
}

impl ExtractedDocument {
    /// File name shown to the model.
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

/// Placeholder emitted for extensions that have no extractor.
pub fn unsupported_placeholder(ext: &str) -> String {
    format!("[unsupported document type: .{ext}]")
}

static RE_SCRIPT_STYLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<(script|style)\b[^>]*>.*?</(script|style)>").unwrap());
static RE_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").unwrap());
static RE_SPACES: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t]+").unwrap());
static RE_BLANKS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n\s*\n+").unwrap());

/// Reduce an HTML document to its visible text.
pub fn html_to_text(html: &str) -> String {
    let s = RE_SCRIPT_STYLE.replace_all(html, " ");
    let s = RE_TAG.replace_all(&s, " ");
    let s = s
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    let s = RE_SPACES.replace_all(&s, " ");
    let lines: Vec<&str> = s.lines().map(str::trim).collect();
    RE_BLANKS
        .replace_all(&lines.join("\n"), "\n\n")
        .trim()
        .to_string()
}

/// Extract the text of one document.
///
/// # Errors
/// [`PipelineError::InvalidInput`] when a supported file cannot be read.
pub async fn extract_text(path: &Path) -> Result<ExtractedDocument, PipelineError> {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    let (text, supported) = match ext.as_str() {
        "txt" | "md" | "markdown" | "csv" | "json" => (read_lossy(path).await?, true),
        "html" | "htm" => (html_to_text(&read_lossy(path).await?), true),
        other => {
            warn!("No text extractor for {}; using placeholder", path.display());
            (unsupported_placeholder(other), false)
        }
    };

    debug!("Extracted {} chars from {}", text.len(), path.display());
    Ok(ExtractedDocument {
        path: path.to_path_buf(),
        text,
        supported,
    })
}

async fn read_lossy(path: &Path) -> Result<String, PipelineError> {
    tokio::fs::read(path)
        .await
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .map_err(|e| PipelineError::InvalidInput {
            input: path.display().to_string(),
            reason: format!("cannot read context document: {e}"),
        })
}

/// Extract every document, keeping the given order.
pub async fn load_documents(paths: &[PathBuf]) -> Result<Vec<ExtractedDocument>, PipelineError> {
    let mut docs = Vec::with_capacity(paths.len());
    for path in paths {
        docs.push(extract_text(path).await?);
    }
    Ok(docs)
}
