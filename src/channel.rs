//! One channel's run: `CAPTURING → TILING → ANALYZING → DONE`.
//!
//! [`ChannelPipeline::run`] drives a [`PipelineRun`] through its stages. Each
//! stage is wrapped in the shared [`RetryExecutor`]; a stage that succeeds
//! records its artifact and advances, a stage that fails moves the run to
//! `FAILED` and nothing after it runs.
//!
//! `run` never returns an error. Every outcome, including cancellation, is
//! expressed in the returned run so the batch runner can keep going.
//!
//! Artifacts are never deleted. A screenshot captured before tiling failed
//! stays on disk so the channel can be resumed from it by hand.

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::output::{PipelineRun, Stage};
use crate::pipeline::analyze::{
    analysis_path_for, write_analysis, AnalysisRequest, Analyzer, VisionAnalyzer,
};
use crate::pipeline::capture::{Capturer, ScreenshotApiCapturer};
use crate::pipeline::extract::{load_documents, ExtractedDocument};
use crate::pipeline::input::ChannelJob;
use crate::pipeline::tile::{ImageTiler, TilingOutput};
use crate::progress::ProgressCallback;
use crate::retry::RetryExecutor;
use futures::FutureExt;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Runs channels through capture, tiling and analysis.
///
/// Cheap to share: wrap it in an `Arc` and call [`ChannelPipeline::run`] from
/// as many tasks as needed.
pub struct ChannelPipeline {
    config: Arc<PipelineConfig>,
    capturer: Option<Arc<dyn Capturer>>,
    analyzer: Arc<dyn Analyzer>,
    documents: Arc<[ExtractedDocument]>,
    tiler: ImageTiler,
    retry: RetryExecutor,
    cancel: CancellationToken,
    progress: Option<ProgressCallback>,
}

impl fmt::Debug for ChannelPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelPipeline")
            .field("config", &self.config)
            .field("has_capturer", &self.capturer.is_some())
            .field("documents", &self.documents.len())
            .field("retry", &self.retry)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl ChannelPipeline {
    /// Pipeline for screenshot jobs. Add a capturer with
    /// [`ChannelPipeline::with_capturer`] to run URL jobs.
    ///
    /// # Errors
    /// [`PipelineError::InvalidParameter`] when `config` fails validation.
    pub fn new(config: PipelineConfig, analyzer: Arc<dyn Analyzer>) -> Result<Self, PipelineError> {
        config.validate()?;
        let cancel = CancellationToken::new();
        let tiler = ImageTiler::from_config(&config)?;
        let retry = RetryExecutor::from_config(&config).with_cancellation(cancel.clone());
        Ok(Self {
            config: Arc::new(config),
            capturer: None,
            analyzer,
            documents: Arc::from(Vec::new()),
            tiler,
            retry,
            cancel,
            progress: None,
        })
    }

    /// Build the production collaborators from the environment.
    ///
    /// The screenshot token is only required when some job needs a capture.
    /// The LLM provider is always resolved. Context documents are read here,
    /// once for the whole batch.
    pub async fn from_env(config: PipelineConfig, jobs: &[ChannelJob]) -> Result<Self, PipelineError> {
        let analyzer = VisionAnalyzer::from_options(config.analysis.clone())?;
        let documents = load_documents(&config.context_documents).await?;
        let capturer = if jobs.iter().any(ChannelJob::needs_capture) {
            Some(ScreenshotApiCapturer::from_env(config.capture.clone())?)
        } else {
            None
        };

        let mut pipeline = Self::new(config, Arc::new(analyzer))?.with_documents(documents);
        if let Some(capturer) = capturer {
            pipeline = pipeline.with_capturer(Arc::new(capturer));
        }
        Ok(pipeline)
    }

    pub fn with_capturer(mut self, capturer: Arc<dyn Capturer>) -> Self {
        self.capturer = Some(capturer);
        self
    }

    /// Documents appended to every analysis request.
    pub fn with_documents(mut self, documents: Vec<ExtractedDocument>) -> Self {
        self.documents = Arc::from(documents);
        self
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Replace the cancellation token (e.g. with one tied to Ctrl-C).
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.retry = self.retry.with_cancellation(token.clone());
        self.cancel = token;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn progress(&self) -> Option<&ProgressCallback> {
        self.progress.as_ref()
    }

    /// Drive `job` to a terminal state.
    pub async fn run(&self, job: &ChannelJob) -> PipelineRun {
        let start = Instant::now();
        let id = job.identifier();
        let mut run = match job {
            ChannelJob::Capture { .. } => PipelineRun::new(&id),
            ChannelJob::Screenshot { path } => PipelineRun::from_screenshot(&id, path.clone()),
        };

        while !run.stage.is_terminal() {
            let stage = run.stage;
            if self.cancel.is_cancelled() {
                run.fail(
                    0,
                    &PipelineError::Cancelled {
                        operation: stage.operation().to_string(),
                    },
                );
                break;
            }

            info!("{}: {}", id, stage);
            if let Some(cb) = &self.progress {
                cb.on_stage_start(&id, stage);
            }

            // A panicking collaborator fails the stage it panicked in; the
            // artifacts recorded so far stay on the run.
            let (outcome, attempts) = match AssertUnwindSafe(self.run_stage(job, &mut run))
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(panic) => {
                    let detail = panic_message(panic.as_ref());
                    // The retry state went down with the panicking future.
                    (
                        Err(PipelineError::Internal(format!(
                            "{} panicked: {detail}",
                            stage.operation()
                        ))),
                        1,
                    )
                }
            };

            match outcome {
                Ok(()) => run.advance(attempts),
                Err(e) => {
                    warn!("{}: {} failed after {} attempt(s): {}", id, stage, attempts, e);
                    run.fail(attempts, &e);
                }
            }
        }

        run.duration_ms = start.elapsed().as_millis() as u64;
        if run.is_done() {
            info!("{}: DONE in {}ms", id, run.duration_ms);
        }
        run
    }

    /// Run the current stage and record its artifacts on success.
    async fn run_stage(
        &self,
        job: &ChannelJob,
        run: &mut PipelineRun,
    ) -> (Result<(), PipelineError>, u32) {
        match run.stage {
            Stage::Capturing => {
                let (result, attempts) = self.capture(job).await;
                let recorded = result.map(|path| run.artifacts.screenshot_path = Some(path));
                (recorded, attempts)
            }
            Stage::Tiling => {
                let (result, attempts) = self.tile(run).await;
                let recorded = result.map(|out| {
                    run.artifacts.tile_dir = Some(out.output_dir);
                    run.artifacts.tiles = out.tiles.into_iter().map(|t| t.path).collect();
                });
                (recorded, attempts)
            }
            Stage::Analyzing => {
                let (result, attempts) = self.analyze(run).await;
                let recorded = result.map(|path| run.artifacts.analysis_path = Some(path));
                (recorded, attempts)
            }
            Stage::Done | Stage::Failed => (Ok(()), 0),
        }
    }

    // ── Stages ────────────────────────────────────────────────────────────
    //
    // Each returns the stage artifact and the number of attempts spent.

    async fn capture(&self, job: &ChannelJob) -> (Result<PathBuf, PipelineError>, u32) {
        let ChannelJob::Capture { url } = job else {
            return (Err(missing_artifact("a URL to capture")), 0);
        };
        let Some(capturer) = self.capturer.as_deref() else {
            return (
                Err(PipelineError::InvalidParameter(
                    "no capturer configured for URL inputs".into(),
                )),
                0,
            );
        };

        let dest = self.config.snapshot_dir();
        let (url, dest) = (url.as_str(), dest.as_path());
        let (result, state) = self
            .retry
            .execute_tracked("capture", move || capturer.capture(url, dest))
            .await;
        (result, state.attempt)
    }

    async fn tile(&self, run: &PipelineRun) -> (Result<TilingOutput, PipelineError>, u32) {
        let Some(screenshot) = run.artifacts.screenshot_path.clone() else {
            return (Err(missing_artifact("a screenshot")), 0);
        };

        let tiler = self.tiler.clone();
        let (result, state) = self
            .retry
            .execute_tracked("tile", move || {
                let tiler = tiler.clone();
                let screenshot = screenshot.clone();
                async move {
                    tokio::task::spawn_blocking(move || tiler.tile(&screenshot, None))
                        .await
                        .map_err(|e| PipelineError::Internal(format!("tiling task: {e}")))?
                }
            })
            .await;
        (result, state.attempt)
    }

    async fn analyze(&self, run: &PipelineRun) -> (Result<PathBuf, PipelineError>, u32) {
        let Some(tile_dir) = run.artifacts.tile_dir.clone() else {
            return (Err(missing_artifact("a tile directory")), 0);
        };

        let analysis_path = analysis_path_for(&tile_dir);
        let request = AnalysisRequest {
            tile_dir,
            images: run.artifacts.tiles.clone(),
            documents: self.documents.to_vec(),
        };
        let (request, analysis_path) = (&request, analysis_path.as_path());
        let analyzer = self.analyzer.as_ref();

        let (result, state) = self
            .retry
            .execute_tracked("analyze", move || async move {
                let markdown = analyzer.analyze(request).await?;
                write_analysis(analysis_path, &markdown).await?;
                info!("Wrote {}", analysis_path.display());
                Ok(analysis_path.to_path_buf())
            })
            .await;
        (result, state.attempt)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

fn missing_artifact(what: &str) -> PipelineError {
    PipelineError::Internal(format!("stage started without {what}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use image::{Rgb, RgbImage};
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    struct EchoAnalyzer {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Analyzer for EchoAnalyzer {
        async fn analyze(&self, request: &AnalysisRequest) -> Result<String, PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("# Persona\n\n{} tiles\n", request.images.len()))
        }
    }

    struct FlakyAnalyzer {
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl Analyzer for FlakyAnalyzer {
        async fn analyze(&self, _request: &AnalysisRequest) -> Result<String, PipelineError> {
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(PipelineError::transient("analyze", "HTTP 529"));
            }
            Ok("ok".into())
        }
    }

    /// Records the file names of the tiles it is given.
    #[derive(Default)]
    struct RecordingAnalyzer {
        seen: std::sync::Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl Analyzer for RecordingAnalyzer {
        async fn analyze(&self, request: &AnalysisRequest) -> Result<String, PipelineError> {
            let names = request
                .images
                .iter()
                .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
                .collect();
            self.seen.lock().unwrap().push(names);
            Ok("ok".into())
        }
    }

    struct PanickingAnalyzer;

    #[async_trait]
    impl Analyzer for PanickingAnalyzer {
        async fn analyze(&self, _request: &AnalysisRequest) -> Result<String, PipelineError> {
            panic!("boom");
        }
    }

    fn geometry(root: &Path, part_height: u32, overlap: u32) -> PipelineConfig {
        PipelineConfig::builder()
            .data_root(root)
            .part_height(part_height)
            .overlap(overlap)
            .build()
            .unwrap()
    }

    fn config(root: &Path) -> PipelineConfig {
        PipelineConfig::builder()
            .data_root(root)
            .part_height(100)
            .overlap(10)
            .backoff_unit(Duration::from_millis(1))
            .build()
            .unwrap()
    }

    fn screenshot(root: &Path, name: &str, height: u32) -> PathBuf {
        let path = root.join(name);
        RgbImage::from_pixel(20, height, Rgb([10, 20, 30]))
            .save(&path)
            .unwrap();
        path
    }

    #[tokio::test]
    async fn screenshot_job_skips_capture() {
        let dir = TempDir::new().unwrap();
        let shot = screenshot(dir.path(), "shot.png", 250);
        let analyzer = Arc::new(EchoAnalyzer {
            calls: AtomicU32::new(0),
        });
        let pipeline = ChannelPipeline::new(config(dir.path()), analyzer.clone()).unwrap();

        let run = pipeline.run(&ChannelJob::Screenshot { path: shot }).await;

        assert!(run.is_done(), "{:?}", run.failure);
        assert_eq!(run.attempts.capturing, 0);
        assert_eq!(run.attempts.tiling, 1);
        assert_eq!(run.attempts.analyzing, 1);
        let analysis = run.artifacts.analysis_path.unwrap();
        assert_eq!(analysis, dir.path().join("crop_shot_analysis.md"));
        // 250 px at 100/10 → 3 tiles
        assert_eq!(std::fs::read_to_string(analysis).unwrap(), "# Persona\n\n3 tiles\n");
    }

    #[tokio::test]
    async fn transient_analysis_failure_is_retried() {
        let dir = TempDir::new().unwrap();
        let shot = screenshot(dir.path(), "flaky.png", 50);
        let analyzer = Arc::new(FlakyAnalyzer {
            failures_left: AtomicU32::new(2),
        });
        let pipeline = ChannelPipeline::new(config(dir.path()), analyzer).unwrap();

        let run = pipeline.run(&ChannelJob::Screenshot { path: shot }).await;
        assert!(run.is_done());
        assert_eq!(run.attempts.analyzing, 3);
    }

    #[tokio::test]
    async fn url_job_without_capturer_fails_at_capture() {
        let dir = TempDir::new().unwrap();
        let analyzer = Arc::new(EchoAnalyzer {
            calls: AtomicU32::new(0),
        });
        let pipeline = ChannelPipeline::new(config(dir.path()), analyzer).unwrap();

        let run = pipeline
            .run(&ChannelJob::Capture {
                url: "https://www.youtube.com/@x".into(),
            })
            .await;
        assert!(run.is_failed());
        assert_eq!(run.failure.unwrap().stage, Stage::Capturing);
    }

    #[tokio::test]
    async fn cancelled_pipeline_fails_before_first_stage() {
        let dir = TempDir::new().unwrap();
        let shot = screenshot(dir.path(), "late.png", 50);
        let analyzer = Arc::new(EchoAnalyzer {
            calls: AtomicU32::new(0),
        });
        let pipeline = ChannelPipeline::new(config(dir.path()), analyzer.clone()).unwrap();
        pipeline.cancellation_token().cancel();

        let run = pipeline.run(&ChannelJob::Screenshot { path: shot }).await;

        let failure = run.failure.unwrap();
        assert_eq!(failure.stage, Stage::Tiling);
        assert!(failure.error.contains("cancelled"));
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 0);
        assert!(!dir.path().join("crop_late").exists());
    }

    #[tokio::test]
    async fn retiling_with_new_geometry_analyzes_only_the_new_tiles() {
        let dir = TempDir::new().unwrap();
        let shot = screenshot(dir.path(), "shot.png", 250);
        let job = ChannelJob::Screenshot { path: shot };

        let first = ChannelPipeline::new(
            geometry(dir.path(), 100, 0),
            Arc::new(RecordingAnalyzer::default()),
        )
        .unwrap();
        assert!(first.run(&job).await.is_done());

        let tile_dir = dir.path().join("crop_shot");
        RgbImage::from_pixel(4, 4, Rgb([0, 0, 0]))
            .save(tile_dir.join("cover.png"))
            .unwrap();

        let analyzer = Arc::new(RecordingAnalyzer::default());
        let second = ChannelPipeline::new(geometry(dir.path(), 200, 50), analyzer.clone()).unwrap();
        let run = second.run(&job).await;

        assert!(run.is_done(), "{:?}", run.failure);
        // 250 px at 200/50 → 0..200, 150..250
        assert_eq!(
            analyzer.seen.lock().unwrap()[0],
            vec!["shot_part_1_h200_overlap50.png", "shot_part_2_h200_overlap50.png"]
        );
        assert_eq!(run.artifacts.tiles.len(), 2);
        // Earlier tiles are left alone, just not sent.
        assert!(tile_dir.join("shot_part_3_h100_overlap0.png").exists());
    }

    #[tokio::test]
    async fn panic_fails_the_running_stage_and_keeps_artifacts() {
        let dir = TempDir::new().unwrap();
        let shot = screenshot(dir.path(), "shot.png", 250);
        let pipeline = ChannelPipeline::new(config(dir.path()), Arc::new(PanickingAnalyzer)).unwrap();

        let run = pipeline.run(&ChannelJob::Screenshot { path: shot.clone() }).await;

        assert!(run.is_failed());
        let failure = run.failure.as_ref().unwrap();
        assert_eq!(failure.stage, Stage::Analyzing);
        assert_eq!(failure.attempts, 1);
        assert!(failure.error.contains("analyze panicked: boom"), "got: {}", failure.error);
        assert_eq!(run.artifacts.screenshot_path, Some(shot));
        assert_eq!(run.artifacts.tile_dir, Some(dir.path().join("crop_shot")));
        assert_eq!(run.artifacts.tiles.len(), 3);
        assert_eq!(run.attempts.tiling, 1);
    }

    #[test]
    fn invalid_config_rejected() {
        let analyzer = Arc::new(EchoAnalyzer {
            calls: AtomicU32::new(0),
        });
        let config = PipelineConfig {
            overlap: 2000,
            ..PipelineConfig::default()
        };
        assert!(ChannelPipeline::new(config, analyzer).is_err());
    }
}
