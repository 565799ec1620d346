//! Input resolution: turn user-supplied strings into [`ChannelJob`]s.
//!
//! An input is one of:
//!
//! * an `http(s)` URL: the channel page to capture
//! * an image file: an existing screenshot; its run starts at tiling
//! * a directory: every image inside it, in file-name order
//! * any other file: a list of URLs, one per line
//!
//! The shape is decided once here; the pipeline never re-inspects its input. URL lists skip blank lines and `#` comments, warn about lines that
//! are not valid URLs, and drop duplicates while keeping first-seen order.

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Extensions treated as screenshots.
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "bmp", "tif", "tiff", "webp"];

/// One unit of batch work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChannelJob {
    /// Capture the page at `url`, then tile and analyze it.
    Capture { url: String },
    /// Tile and analyze an existing screenshot.
    Screenshot { path: PathBuf },
}

impl ChannelJob {
    /// The channel identifier reported in [`crate::output::PipelineRun`].
    pub fn identifier(&self) -> String {
        match self {
            ChannelJob::Capture { url } => url.clone(),
            ChannelJob::Screenshot { path } => path.display().to_string(),
        }
    }

    pub fn needs_capture(&self) -> bool {
        matches!(self, ChannelJob::Capture { .. })
    }
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// An absolute `http(s)` URL with a host.
pub fn is_valid_url(input: &str) -> bool {
    reqwest::Url::parse(input)
        .map(|u| matches!(u.scheme(), "http" | "https") && u.host_str().is_some_and(|h| !h.is_empty()))
        .unwrap_or(false)
}

pub fn is_image_path(path: &Path) -> bool {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.as_str()))
}

/// Parse a URL list.
pub fn parse_url_list(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut urls = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if !is_valid_url(line) {
            warn!("Skipping invalid URL on line {}: {}", lineno + 1, line);
            continue;
        }
        if seen.insert(line.to_string()) {
            urls.push(line.to_string());
        } else {
            debug!("Skipping duplicate URL: {}", line);
        }
    }
    urls
}

/// Read and parse a URL list file.
pub async fn read_url_file(path: &Path) -> Result<Vec<String>, PipelineError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| PipelineError::InvalidInput {
            input: path.display().to_string(),
            reason: format!("cannot read URL list: {e}"),
        })?;
    Ok(parse_url_list(&text))
}

async fn images_in_dir(dir: &Path) -> Result<Vec<PathBuf>, PipelineError> {
    let list_err = |e: std::io::Error| PipelineError::InvalidInput {
        input: dir.display().to_string(),
        reason: e.to_string(),
    };
    let mut entries = tokio::fs::read_dir(dir).await.map_err(list_err)?;
    let mut images = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(list_err)? {
        let path = entry.path();
        if path.is_file() && is_image_path(&path) {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}

/// Resolve every input into jobs, in input order, without duplicates.
///
/// # Errors
/// [`PipelineError::InvalidInput`] for a malformed URL argument or a path
/// that does not exist or cannot be read.
pub async fn resolve_inputs(inputs: &[String]) -> Result<Vec<ChannelJob>, PipelineError> {
    let mut jobs = Vec::new();
    for input in inputs {
        let input = input.trim();
        if is_url(input) {
            if !is_valid_url(input) {
                return Err(PipelineError::InvalidInput {
                    input: input.to_string(),
                    reason: "not a valid http(s) URL".into(),
                });
            }
            jobs.push(ChannelJob::Capture {
                url: input.to_string(),
            });
            continue;
        }

        let path = PathBuf::from(input);
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| PipelineError::InvalidInput {
                input: input.to_string(),
                reason: e.to_string(),
            })?;

        if meta.is_dir() {
            let images = images_in_dir(&path).await?;
            if images.is_empty() {
                warn!("No images found in {}", path.display());
            }
            jobs.extend(images.into_iter().map(|path| ChannelJob::Screenshot { path }));
        } else if is_image_path(&path) {
            jobs.push(ChannelJob::Screenshot { path });
        } else {
            let urls = read_url_file(&path).await?;
            debug!("{}: {} URLs", path.display(), urls.len());
            jobs.extend(urls.into_iter().map(|url| ChannelJob::Capture { url }));
        }
    }

    let mut seen = HashSet::new();
    jobs.retain(|job| seen.insert(job.clone()));
    Ok(jobs)
}
