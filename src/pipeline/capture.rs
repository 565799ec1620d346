//! Screenshot capture of a channel page through a remote screenshot API.
//!
//! [`Capturer`] is the pipeline's view of the capture collaborator: give it a
//! URL and a directory, get back the path of a raster image. The production
//! implementation, [`ScreenshotApiCapturer`], calls screenshotapi.net with the
//! options in [`CaptureOptions`] and stores the returned image as
//! `<dest_dir>/<channel-slug>_<YYYYmmdd_HHMMSS>.<ext>`.
//!
//! Every failure (transport error, non-2xx status, empty body, body that is
//! not an image) is reported as [`PipelineError::TransientIo`] so the retry
//! executor gets another go at it.

use crate::config::{require_env, CaptureOptions};
use crate::error::PipelineError;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use image::ImageFormat;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Endpoint of the screenshot service.
pub const SCREENSHOT_API_URL: &str = "https://shot.screenshotapi.net/screenshot";

/// Environment variable holding the screenshot service token.
pub const TOKEN_ENV: &str = "SCREENSHOT_API_TOKEN";

/// Produces a raster screenshot of `target` inside `dest_dir`.
///
/// Implementations are called through the retry executor and must tolerate
/// repeated calls for the same target.
#[async_trait]
pub trait Capturer: Send + Sync {
    async fn capture(&self, target: &str, dest_dir: &Path) -> Result<PathBuf, PipelineError>;
}

// ── Naming ───────────────────────────────────────────────────────────────

/// Short, filesystem-safe name for a channel URL.
///
/// `https://www.youtube.com/@veritasium/videos` → `veritasium`,
/// `https://youtube.com/c/LinusTechTips` → `LinusTechTips`. Falls back to the
/// last path segment, then the host, then `channel`.
pub fn channel_slug(target: &str) -> String {
    let raw = match reqwest::Url::parse(target) {
        Ok(url) => {
            let segments: Vec<String> = url
                .path_segments()
                .map(|s| s.filter(|p| !p.is_empty()).map(str::to_string).collect())
                .unwrap_or_default();

            if let Some(handle) = segments.iter().find(|s| s.starts_with('@')) {
                handle.trim_start_matches('@').to_string()
            } else if let Some(pos) = segments
                .iter()
                .position(|s| matches!(s.as_str(), "c" | "channel" | "user"))
                .filter(|&pos| pos + 1 < segments.len())
            {
                segments[pos + 1].clone()
            } else if let Some(last) = segments.last() {
                last.clone()
            } else {
                url.host_str().unwrap_or_default().to_string()
            }
        }
        Err(_) => target.to_string(),
    };

    let slug: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let slug = slug.trim_matches('_');
    if slug.is_empty() {
        "channel".to_string()
    } else {
        slug.to_string()
    }
}

/// `<slug>_<YYYYmmdd_HHMMSS>.<ext>`
pub fn snapshot_file_name(target: &str, ext: &str, at: DateTime<Local>) -> String {
    format!(
        "{}_{}.{ext}",
        channel_slug(target),
        at.format("%Y%m%d_%H%M%S")
    )
}

// ── screenshotapi.net ────────────────────────────────────────────────────

/// [`Capturer`] backed by the screenshotapi.net HTTP API.
#[derive(Clone)]
pub struct ScreenshotApiCapturer {
    token: String,
    options: CaptureOptions,
    client: reqwest::Client,
    base_url: String,
}

impl fmt::Debug for ScreenshotApiCapturer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScreenshotApiCapturer")
            .field("token", &"<redacted>")
            .field("options", &self.options)
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl ScreenshotApiCapturer {
    pub fn new(token: impl Into<String>, options: CaptureOptions) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(options.timeout_secs))
            .build()
            .map_err(|e| PipelineError::Internal(format!("HTTP client: {e}")))?;
        Ok(Self {
            token: token.into(),
            options,
            client,
            base_url: SCREENSHOT_API_URL.to_string(),
        })
    }

    /// Read the token from `SCREENSHOT_API_TOKEN`.
    ///
    /// # Errors
    /// [`PipelineError::CredentialMissing`] when the variable is unset or empty.
    pub fn from_env(options: CaptureOptions) -> Result<Self, PipelineError> {
        Self::new(require_env(TOKEN_ENV)?, options)
    }

    /// Point at another deployment of the same API.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn options(&self) -> &CaptureOptions {
        &self.options
    }

    /// Full request URL for `target`, token included.
    pub fn request_url(&self, target: &str) -> Result<reqwest::Url, PipelineError> {
        let o = &self.options;
        let mut params: Vec<(&str, String)> = vec![
            ("token", self.token.clone()),
            ("url", target.to_string()),
            ("output", "image".to_string()),
            ("file_type", o.format.as_str().to_string()),
            ("width", o.width.to_string()),
            ("height", o.height.to_string()),
            ("full_page", o.full_page.to_string()),
            ("delay", o.delay_ms.to_string()),
            ("wait_for_event", o.wait_for_event.clone()),
            ("lazy_load", o.lazy_load.to_string()),
            ("fresh", o.fresh.to_string()),
            ("block_ads", o.block_ads.to_string()),
            ("no_cookie_banners", o.no_cookie_banners.to_string()),
            ("retina", o.retina.to_string()),
        ];
        if let Some(ref css) = o.css {
            params.push(("css", css.clone()));
        }
        if let Some(ref agent) = o.user_agent {
            params.push(("user_agent", agent.clone()));
        }

        reqwest::Url::parse_with_params(&self.base_url, &params).map_err(|e| {
            PipelineError::InvalidParameter(format!("screenshot endpoint '{}': {e}", self.base_url))
        })
    }

    fn extension_for(&self, bytes: &[u8]) -> Result<&'static str, PipelineError> {
        match image::guess_format(bytes) {
            Ok(ImageFormat::Png) => Ok("png"),
            Ok(ImageFormat::Jpeg) => Ok("jpg"),
            Ok(ImageFormat::WebP) => Ok("webp"),
            Ok(_) => Ok(self.options.format.as_str()),
            Err(_) => Err(PipelineError::transient(
                "capture",
                "response body is not an image",
            )),
        }
    }
}

#[async_trait]
impl Capturer for ScreenshotApiCapturer {
    async fn capture(&self, target: &str, dest_dir: &Path) -> Result<PathBuf, PipelineError> {
        let url = self.request_url(target)?;
        info!("Capturing {}", target);

        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                PipelineError::transient(
                    "capture",
                    format!("timed out after {}s", self.options.timeout_secs),
                )
            } else {
                PipelineError::transient("capture", e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::transient("capture", format!("HTTP {status}")));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| PipelineError::transient("capture", e))?;
        if bytes.is_empty() {
            return Err(PipelineError::transient("capture", "empty response body"));
        }
        let ext = self.extension_for(&bytes)?;

        let write_err = |source| PipelineError::OutputWriteFailed {
            path: dest_dir.to_path_buf(),
            source,
        };
        tokio::fs::create_dir_all(dest_dir).await.map_err(write_err)?;

        let path = dest_dir.join(snapshot_file_name(target, ext, Local::now()));
        tokio::fs::write(&path, &bytes).await.map_err(write_err)?;

        debug!("Screenshot: {} bytes", bytes.len());
        info!("Saved screenshot {}", path.display());
        Ok(path)
    }
}
