//! Persona analysis: send a channel's ordered tiles to a vision model and
//! persist the returned Markdown next to the tile directory.
//!
//! [`Analyzer`] is the seam between the pipeline and the model. The production
//! implementation, [`VisionAnalyzer`], drives any `edgequake-llm` provider; tests
//! substitute their own implementation.
//!
//! ## Message layout
//!
//! 1. **System message**: [`crate::prompts::SYSTEM_PROMPT`]
//! 2. **User message**: the analysis prompt (plus any context documents) with
//!    every tile attached as an image, in top-to-bottom order
//!
//! One request covers the whole tile set. The model sees the page the way a
//! reader scrolls it, which is why tile order matters.

use crate::config::AnalysisOptions;
use crate::error::PipelineError;
use crate::pipeline::encode::encode_tile;
use crate::pipeline::extract::ExtractedDocument;
use crate::pipeline::postprocess::clean_markdown;
use crate::prompts::{analysis_prompt, SYSTEM_PROMPT};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Provider used when nothing else is configured and an Anthropic key exists.
pub const DEFAULT_PROVIDER: &str = "anthropic";

/// Model used with [`DEFAULT_PROVIDER`] when none is given.
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

/// Input to one analysis call.
#[derive(Debug, Clone, Default)]
pub struct AnalysisRequest {
    /// Directory holding the tiles.
    pub tile_dir: PathBuf,
    /// Tiles in reading order: exactly the set the tiling stage wrote, never
    /// a scan of `tile_dir`.
    pub images: Vec<PathBuf>,
    pub documents: Vec<ExtractedDocument>,
}

/// Turns an ordered tile set into a Markdown report.
///
/// Implementations are called through the retry executor and must tolerate
/// repeated calls with the same request.
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<String, PipelineError>;
}

// ── Output paths ─────────────────────────────────────────────────────────

/// `<tile_dir>_analysis.md`, a sibling of the tile directory.
pub fn analysis_path_for(tile_dir: &Path) -> PathBuf {
    let name = tile_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    tile_dir.with_file_name(format!("{name}_analysis.md"))
}

/// Write the report atomically (temp file + rename) so readers never see a
/// partial file.
pub async fn write_analysis(path: &Path, markdown: &str) -> Result<(), PipelineError> {
    let write_err = |source| PipelineError::OutputWriteFailed {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
    }

    let tmp_path = path.with_extension("md.tmp");
    tokio::fs::write(&tmp_path, markdown).await.map_err(write_err)?;
    tokio::fs::rename(&tmp_path, path).await.map_err(write_err)?;
    Ok(())
}

// ── LLM-backed analyzer ──────────────────────────────────────────────────

/// [`Analyzer`] backed by an `edgequake-llm` vision provider.
#[derive(Clone)]
pub struct VisionAnalyzer {
    provider: Arc<dyn LLMProvider>,
    options: AnalysisOptions,
}

impl fmt::Debug for VisionAnalyzer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VisionAnalyzer")
            .field("provider", &"<dyn LLMProvider>")
            .field("options", &self.options)
            .finish()
    }
}

impl VisionAnalyzer {
    pub fn new(provider: Arc<dyn LLMProvider>, options: AnalysisOptions) -> Self {
        Self { provider, options }
    }

    /// Resolve the provider described by `options` (see [`resolve_provider`]).
    ///
    /// Call once at startup: a missing API key is reported here rather than
    /// on the first channel.
    pub fn from_options(options: AnalysisOptions) -> Result<Self, PipelineError> {
        let provider = resolve_provider(&options)?;
        Ok(Self::new(provider, options))
    }
}

fn completion_options(options: &AnalysisOptions) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(options.temperature),
        max_tokens: Some(options.max_tokens),
        ..Default::default()
    }
}

#[async_trait]
impl Analyzer for VisionAnalyzer {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<String, PipelineError> {
        if request.images.is_empty() {
            return Err(PipelineError::InvalidInput {
                input: request.tile_dir.display().to_string(),
                reason: "no tiles to analyze".into(),
            });
        }

        let mut images = Vec::with_capacity(request.images.len());
        for path in &request.images {
            images.push(encode_tile(path).await?);
        }

        let prompt = analysis_prompt(self.options.prompt.as_deref(), &request.documents);
        let messages = vec![
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user_with_images(&prompt, images),
        ];
        let options = completion_options(&self.options);

        let start = Instant::now();
        let timeout = Duration::from_secs(self.options.api_timeout_secs);
        let response = tokio::time::timeout(timeout, self.provider.chat(&messages, Some(&options)))
            .await
            .map_err(|_| {
                PipelineError::transient("analyze", format!("no response within {timeout:?}"))
            })?
            .map_err(|e| PipelineError::transient("analyze", e))?;

        debug!(
            "{}: {} input tokens, {} output tokens, {:?}",
            request.tile_dir.display(),
            response.prompt_tokens,
            response.completion_tokens,
            start.elapsed()
        );

        if response.content.trim().is_empty() {
            return Err(PipelineError::transient("analyze", "empty response"));
        }
        Ok(clean_markdown(&response.content))
    }
}

// ── Provider resolution ──────────────────────────────────────────────────

/// Fallback model for a named provider.
pub fn default_model_for(provider: &str) -> &'static str {
    match provider {
        "anthropic" => DEFAULT_MODEL,
        "gemini" => "gemini-2.5-flash",
        _ => "gpt-4.1-nano",
    }
}

fn create_vision_provider(name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, PipelineError> {
    info!("Using LLM provider {} ({})", name, model);
    ProviderFactory::create_llm_provider(name, model).map_err(|e| {
        PipelineError::ProviderNotConfigured {
            provider: name.to_string(),
            hint: format!("{e}"),
        }
    })
}

fn non_empty_env(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.is_empty())
}

/// Resolve the LLM provider, most specific first:
///
/// 1. a pre-built `options.provider`
/// 2. `options.provider_name` with `options.model` (or that provider's default)
/// 3. `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL` from the environment
/// 4. Anthropic when `ANTHROPIC_API_KEY` is set
/// 5. whatever `ProviderFactory::from_env` detects
pub fn resolve_provider(options: &AnalysisOptions) -> Result<Arc<dyn LLMProvider>, PipelineError> {
    if let Some(ref provider) = options.provider {
        return Ok(Arc::clone(provider));
    }

    if let Some(ref name) = options.provider_name {
        let model = options
            .model
            .as_deref()
            .unwrap_or_else(|| default_model_for(name));
        return create_vision_provider(name, model);
    }

    if let (Some(provider), Some(model)) = (
        non_empty_env("EDGEQUAKE_LLM_PROVIDER"),
        non_empty_env("EDGEQUAKE_MODEL"),
    ) {
        return create_vision_provider(&provider, &model);
    }

    if non_empty_env("ANTHROPIC_API_KEY").is_some() {
        let model = options.model.as_deref().unwrap_or(DEFAULT_MODEL);
        return create_vision_provider(DEFAULT_PROVIDER, model);
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| PipelineError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be detected from the environment.\n\
                 Set ANTHROPIC_API_KEY or OPENAI_API_KEY, or pass --provider.\n\
                 Error: {e}"
            ),
        })?;
    Ok(llm_provider)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn analysis_path_is_sibling() {
        assert_eq!(
            analysis_path_for(Path::new("data/crop_veritasium_20240101_120000")),
            PathBuf::from("data/crop_veritasium_20240101_120000_analysis.md")
        );
    }

    #[tokio::test]
    async fn write_analysis_replaces_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("crop_x_analysis.md");

        write_analysis(&path, "# first\n").await.unwrap();
        write_analysis(&path, "# second\n").await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "# second\n");
        assert!(!dir.path().join("crop_x_analysis.md.tmp").exists());
    }

    #[test]
    fn default_models() {
        assert_eq!(default_model_for("anthropic"), DEFAULT_MODEL);
        assert_eq!(default_model_for("openai"), "gpt-4.1-nano");
    }

    #[test]
    fn completion_options_follow_analysis_options() {
        let opts = completion_options(&AnalysisOptions {
            max_tokens: 1500,
            ..AnalysisOptions::default()
        });
        assert_eq!(opts.temperature, Some(0.0));
        assert_eq!(opts.max_tokens, Some(1500));
    }
}
