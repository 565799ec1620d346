//! Configuration types for a capture → tile → analyse run.
//!
//! All pipeline behaviour is controlled through [`PipelineConfig`], built via
//! its [`PipelineConfigBuilder`]. The two collaborator-facing option sets,
//! [`CaptureOptions`] and [`AnalysisOptions`], enumerate every knob with its
//! default so overrides are plain struct updates:
//!
//! ```rust
//! use channel_persona::CaptureOptions;
//!
//! let options = CaptureOptions {
//!     full_page: true,
//!     delay_ms: 5_000,
//!     ..CaptureOptions::default()
//! };
//! assert_eq!(options.width, 1920);
//! ```

use crate::error::PipelineError;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for a batch of channel pipelines.
///
/// Built via [`PipelineConfig::builder()`] or using
/// [`PipelineConfig::default()`].
///
/// # Example
/// ```rust
/// use channel_persona::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .data_root("data")
///     .part_height(1000)
///     .overlap(200)
///     .max_attempts(5)
///     .build()
///     .unwrap();
/// assert_eq!(config.overlap, 200);
/// ```
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Root directory for every artefact. Default: `data`.
    ///
    /// Screenshots land in `<data_root>/web_snapshots/`, tiles in
    /// `<data_root>/crop_<stem>/` and the analysis next to the tile directory.
    pub data_root: PathBuf,

    /// Height of one tile in pixels. Must be > 0. Default: 1024.
    ///
    /// Vision APIs downscale anything much taller than ~1 500 px, which
    /// turns small channel-page text into mush. 1 024 px keeps every tile
    /// legible while a typical channel page still fits in 3–4 tiles.
    pub part_height: u32,

    /// Rows shared by consecutive tiles. Must be < `part_height`. Default: 100.
    ///
    /// Overlap keeps a line of text that straddles a cut readable in at least
    /// one tile.
    pub overlap: u32,

    /// Attempts per stage before the channel is marked FAILED. Default: 3.
    pub max_attempts: u32,

    /// Backoff base unit; the wait before retry `n` is `unit * 2^(n-1)`. Default: 1 s.
    pub backoff_unit: Duration,

    /// Upper bound for a single backoff wait. Default: 60 s.
    pub max_backoff: Duration,

    /// Number of channels processed at the same time. Default: 1.
    ///
    /// Remote collaborators are rate limited; this is the main backpressure
    /// control.
    pub concurrency: usize,

    /// Pause before dispatching each channel after the first. Default: 0.
    pub channel_delay: Duration,

    /// Files whose extracted text is appended to every analysis request.
    pub context_documents: Vec<PathBuf>,

    /// Options forwarded to the capture collaborator.
    pub capture: CaptureOptions,

    /// Options forwarded to the analysis collaborator.
    pub analysis: AnalysisOptions,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("data"),
            part_height: 1024,
            overlap: 100,
            max_attempts: 3,
            backoff_unit: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            concurrency: 1,
            channel_delay: Duration::ZERO,
            context_documents: Vec::new(),
            capture: CaptureOptions::default(),
            analysis: AnalysisOptions::default(),
        }
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    /// Directory that receives raw screenshots.
    pub fn snapshot_dir(&self) -> PathBuf {
        self.data_root.join("web_snapshots")
    }

    /// Check the tiling and retry invariants.
    pub fn validate(&self) -> Result<(), PipelineError> {
        validate_tiling(self.part_height, self.overlap)?;
        if self.max_attempts == 0 {
            return Err(PipelineError::InvalidParameter(
                "max_attempts must be ≥ 1".into(),
            ));
        }
        if self.concurrency == 0 {
            return Err(PipelineError::InvalidParameter(
                "concurrency must be ≥ 1".into(),
            ));
        }
        Ok(())
    }
}

/// Validate a `(part_height, overlap)` pair.
///
/// `overlap >= part_height` would give a stride of zero (or less), so tiling
/// would never reach the bottom of the image.
pub fn validate_tiling(part_height: u32, overlap: u32) -> Result<(), PipelineError> {
    if part_height == 0 {
        return Err(PipelineError::InvalidParameter(
            "part_height must be > 0".into(),
        ));
    }
    if overlap >= part_height {
        return Err(PipelineError::InvalidParameter(format!(
            "overlap ({overlap}) must be smaller than part_height ({part_height})"
        )));
    }
    Ok(())
}

/// Read a required credential from the environment.
///
/// Call at startup only; an unset or empty variable is
/// [`PipelineError::CredentialMissing`].
pub fn require_env(var: &str) -> Result<String, PipelineError> {
    std::env::var(var)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| PipelineError::CredentialMissing {
            var: var.to_string(),
        })
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn data_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.data_root = root.into();
        self
    }

    pub fn part_height(mut self, px: u32) -> Self {
        self.config.part_height = px;
        self
    }

    pub fn overlap(mut self, px: u32) -> Self {
        self.config.overlap = px;
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.config.max_attempts = n;
        self
    }

    pub fn backoff_unit(mut self, unit: Duration) -> Self {
        self.config.backoff_unit = unit;
        self
    }

    pub fn max_backoff(mut self, cap: Duration) -> Self {
        self.config.max_backoff = cap;
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n;
        self
    }

    pub fn channel_delay(mut self, delay: Duration) -> Self {
        self.config.channel_delay = delay;
        self
    }

    pub fn context_document(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.context_documents.push(path.into());
        self
    }

    pub fn capture(mut self, options: CaptureOptions) -> Self {
        self.config.capture = options;
        self
    }

    pub fn analysis(mut self, options: AnalysisOptions) -> Self {
        self.config.analysis = options;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, PipelineError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

// ── Capture options ──────────────────────────────────────────────────────

/// Raster format requested from the screenshot service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureFormat {
    #[default]
    Png,
    Jpeg,
}

impl CaptureFormat {
    /// Value of the service's `file_type` parameter, also used as extension.
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureFormat::Png => "png",
            CaptureFormat::Jpeg => "jpg",
        }
    }
}

/// Every option recognised by the screenshot collaborator, with defaults
/// tuned for YouTube channel pages (lazy-loaded shelves, cookie banners).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureOptions {
    /// Viewport width in pixels. Default: 1920.
    pub width: u32,
    /// Viewport height in pixels. Default: 3240.
    pub height: u32,
    /// Output raster format. Default: PNG.
    pub format: CaptureFormat,
    /// Capture the whole scrollable page instead of the viewport. Default: false.
    pub full_page: bool,
    /// Wait before capturing, in milliseconds. Default: 12 000.
    pub delay_ms: u64,
    /// Browser event to wait for. Default: `networkidle0`.
    pub wait_for_event: String,
    /// Scroll to trigger lazy-loaded content. Default: true.
    pub lazy_load: bool,
    /// Bypass the service cache. Default: true.
    pub fresh: bool,
    /// Default: true.
    pub block_ads: bool,
    /// Default: true.
    pub no_cookie_banners: bool,
    /// Default: false.
    pub retina: bool,
    /// Extra CSS injected before capture.
    pub css: Option<String>,
    /// Custom browser user agent.
    pub user_agent: Option<String>,
    /// HTTP request timeout in seconds. Default: 120.
    pub timeout_secs: u64,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 3240,
            format: CaptureFormat::Png,
            full_page: false,
            delay_ms: 12_000,
            wait_for_event: "networkidle0".to_string(),
            lazy_load: true,
            fresh: true,
            block_ads: true,
            no_cookie_banners: true,
            retina: false,
            css: None,
            user_agent: None,
            timeout_secs: 120,
        }
    }
}

// ── Analysis options ─────────────────────────────────────────────────────

/// Options for the vision analysis collaborator.
#[derive(Clone)]
pub struct AnalysisOptions {
    /// LLM model identifier. If None, uses `DEFAULT_MODEL`.
    pub model: Option<String>,

    /// LLM provider name (e.g. "anthropic", "openai").
    /// If None along with `provider`, the provider is auto-detected from the environment.
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature. Default: 0.0.
    pub temperature: f32,

    /// Maximum tokens generated per analysis. Default: 1000.
    pub max_tokens: usize,

    /// Prompt override. If None, uses [`crate::prompts::DEFAULT_ANALYSIS_PROMPT`].
    pub prompt: Option<String>,

    /// Per-call timeout in seconds. Default: 120.
    pub api_timeout_secs: u64,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.0,
            max_tokens: 1000,
            prompt: None,
            api_timeout_secs: 120,
        }
    }
}

impl fmt::Debug for AnalysisOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalysisOptions")
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("prompt", &self.prompt.as_ref().map(|p| p.len()))
            .field("api_timeout_secs", &self.api_timeout_secs)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_channel_pipeline() {
        let c = PipelineConfig::default();
        assert_eq!(c.part_height, 1024);
        assert_eq!(c.overlap, 100);
        assert_eq!(c.max_attempts, 3);
        assert_eq!(c.concurrency, 1);
        assert_eq!(c.snapshot_dir(), PathBuf::from("data/web_snapshots"));
    }

    #[test]
    fn overlap_must_be_smaller_than_part_height() {
        let err = PipelineConfig::builder()
            .part_height(500)
            .overlap(500)
            .build()
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidParameter(_)));
    }

    #[test]
    fn zero_part_height_rejected() {
        assert!(validate_tiling(0, 0).is_err());
        assert!(validate_tiling(1, 0).is_ok());
    }

    #[test]
    fn unset_credential_is_fatal() {
        let err = require_env("CHANNEL_PERSONA_TEST_SURELY_UNSET_TOKEN").unwrap_err();
        assert!(matches!(err, PipelineError::CredentialMissing { .. }));
    }

    #[test]
    fn zero_attempts_rejected() {
        let err = PipelineConfig::builder().max_attempts(0).build();
        assert!(err.is_err());
    }

    #[test]
    fn capture_override_keeps_other_defaults() {
        let o = CaptureOptions {
            width: 1280,
            ..CaptureOptions::default()
        };
        assert_eq!(o.width, 1280);
        assert_eq!(o.height, 3240);
        assert_eq!(o.wait_for_event, "networkidle0");
        assert_eq!(o.format.as_str(), "png");
    }

    #[test]
    fn analysis_debug_hides_prompt_body() {
        let o = AnalysisOptions {
            prompt: Some("secret persona prompt".into()),
            ..AnalysisOptions::default()
        };
        let dbg = format!("{o:?}");
        assert!(!dbg.contains("secret"));
    }
}
