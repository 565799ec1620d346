//! Integration tests for the capture → tile → analyse pipeline.
//!
//! Capture and analysis are replaced by in-process fakes, so everything here
//! runs offline against a temporary data root. The last test exercises the
//! real collaborators and is gated behind `E2E_ENABLED`.
//!
//! Run with:
//!   cargo test --test pipeline
//!
//! Live run (needs SCREENSHOT_API_TOKEN and an LLM key):
//!   E2E_ENABLED=1 cargo test --test pipeline live_ -- --nocapture

use async_trait::async_trait;
use channel_persona::pipeline::capture::snapshot_file_name;
use channel_persona::{
    run_channels, AnalysisRequest, Analyzer, BatchRunner, Capturer, ChannelJob, ChannelPipeline,
    PipelineConfig, PipelineError, Stage,
};
use chrono::Local;
use futures::StreamExt;
use image::{Rgb, RgbImage};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

// ── Fakes ────────────────────────────────────────────────────────────────────

/// Writes a 30×260 PNG for every URL, except URLs containing `fail_on`,
/// which always fail with a transient error.
struct FakeCapturer {
    fail_on: Option<&'static str>,
    calls: AtomicU32,
}

impl FakeCapturer {
    fn new(fail_on: Option<&'static str>) -> Arc<Self> {
        Arc::new(Self {
            fail_on,
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl Capturer for FakeCapturer {
    async fn capture(&self, target: &str, dest_dir: &Path) -> Result<PathBuf, PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_on.is_some_and(|needle| target.contains(needle)) {
            return Err(PipelineError::transient("capture", "HTTP 502 Bad Gateway"));
        }
        std::fs::create_dir_all(dest_dir).unwrap();
        let path = dest_dir.join(snapshot_file_name(target, "png", Local::now()));
        RgbImage::from_pixel(30, 260, Rgb([200, 40, 40]))
            .save(&path)
            .unwrap();
        Ok(path)
    }
}

/// "Captures" a file that is not an image at all.
struct CorruptCapturer;

#[async_trait]
impl Capturer for CorruptCapturer {
    async fn capture(&self, target: &str, dest_dir: &Path) -> Result<PathBuf, PipelineError> {
        std::fs::create_dir_all(dest_dir).unwrap();
        let path = dest_dir.join(snapshot_file_name(target, "png", Local::now()));
        std::fs::write(&path, b"<html>rate limited</html>").unwrap();
        Ok(path)
    }
}

/// Records the tile lists it receives and answers with a short persona.
#[derive(Default)]
struct RecordingAnalyzer {
    requests: Mutex<Vec<Vec<PathBuf>>>,
}

#[async_trait]
impl Analyzer for RecordingAnalyzer {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<String, PipelineError> {
        self.requests.lock().unwrap().push(request.images.clone());
        Ok(format!(
            "## Audience Persona\n\nBased on {} tiles.\n",
            request.images.len()
        ))
    }
}

/// Panics for any tile directory whose name contains "bad".
struct PanickyAnalyzer;

#[async_trait]
impl Analyzer for PanickyAnalyzer {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<String, PipelineError> {
        if request.tile_dir.to_string_lossy().contains("bad") {
            panic!("boom");
        }
        Ok("## Audience Persona\n".to_string())
    }
}

/// Records when each capture starts and refuses it with a non-retryable
/// error, so only dispatch timing is measured.
#[derive(Default)]
struct DispatchClock {
    starts: Mutex<Vec<tokio::time::Instant>>,
}

#[async_trait]
impl Capturer for DispatchClock {
    async fn capture(&self, _target: &str, _dest_dir: &Path) -> Result<PathBuf, PipelineError> {
        self.starts.lock().unwrap().push(tokio::time::Instant::now());
        Err(PipelineError::InvalidParameter("offline".into()))
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn config(root: &Path) -> PipelineConfig {
    PipelineConfig::builder()
        .data_root(root)
        .part_height(100)
        .overlap(20)
        .concurrency(3)
        .backoff_unit(Duration::from_millis(1))
        .build()
        .unwrap()
}

fn url_job(handle: &str) -> ChannelJob {
    ChannelJob::Capture {
        url: format!("https://www.youtube.com/@{handle}"),
    }
}

fn names_in(dir: &Path) -> BTreeSet<String> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect()
}

// ── Batch behaviour ──────────────────────────────────────────────────────────

#[tokio::test]
async fn failing_channel_does_not_stop_the_batch() {
    let dir = TempDir::new().unwrap();
    let analyzer = Arc::new(RecordingAnalyzer::default());
    let pipeline = ChannelPipeline::new(config(dir.path()), analyzer.clone())
        .unwrap()
        .with_capturer(FakeCapturer::new(Some("broken")));

    let jobs = vec![url_job("first"), url_job("broken"), url_job("third")];
    let report = BatchRunner::new(pipeline).run(jobs).await;

    assert_eq!((report.succeeded, report.failed, report.total()), (2, 1, 3));
    assert!(!report.all_failed());

    let ids: Vec<_> = report.runs.iter().map(|r| r.channel_identifier.as_str()).collect();
    assert_eq!(
        ids,
        vec![
            "https://www.youtube.com/@first",
            "https://www.youtube.com/@broken",
            "https://www.youtube.com/@third",
        ]
    );

    let failed = &report.runs[1];
    assert_eq!(failed.stage, Stage::Failed);
    let failure = failed.failure.as_ref().unwrap();
    assert_eq!(failure.stage, Stage::Capturing);
    assert_eq!(failure.attempts, 3);
    assert!(failure.error.contains("502"), "got: {}", failure.error);
    assert!(failed.artifacts.screenshot_path.is_none());

    assert_eq!(analyzer.requests.lock().unwrap().len(), 2);
    assert!(report.clone().into_result().is_err());
}

#[tokio::test]
async fn artifacts_follow_the_data_layout() {
    let dir = TempDir::new().unwrap();
    let analyzer = Arc::new(RecordingAnalyzer::default());
    let pipeline = ChannelPipeline::new(config(dir.path()), analyzer.clone())
        .unwrap()
        .with_capturer(FakeCapturer::new(None));

    let run = pipeline.run(&url_job("veritasium")).await;
    assert!(run.is_done(), "{:?}", run.failure);

    let shot = run.artifacts.screenshot_path.clone().unwrap();
    assert_eq!(shot.parent().unwrap(), dir.path().join("web_snapshots"));
    let stem = shot.file_stem().unwrap().to_string_lossy().into_owned();
    assert!(stem.starts_with("veritasium_"), "got: {stem}");

    let tile_dir = run.artifacts.tile_dir.clone().unwrap();
    assert_eq!(tile_dir, dir.path().join(format!("crop_{stem}")));

    // 260 px at 100/20 → 0..100, 80..180, 160..260
    let expected: BTreeSet<String> = (1..=3)
        .map(|i| format!("{stem}_part_{i}_h100_overlap20.png"))
        .chain(std::iter::once("metadata.txt".to_string()))
        .collect();
    assert_eq!(names_in(&tile_dir), expected);

    let metadata = std::fs::read_to_string(tile_dir.join("metadata.txt")).unwrap();
    assert!(metadata.contains("Number of Parts: 3"), "{metadata}");
    assert!(metadata.contains("Overlap: 20 px"), "{metadata}");

    let analysis = run.artifacts.analysis_path.clone().unwrap();
    assert_eq!(analysis, dir.path().join(format!("crop_{stem}_analysis.md")));
    let md = std::fs::read_to_string(&analysis).unwrap();
    assert_eq!(md, "## Audience Persona\n\nBased on 3 tiles.\n");
    assert!(!analysis.with_extension("md.tmp").exists());

    // Tiles are handed to the analyzer top to bottom.
    let requests = analyzer.requests.lock().unwrap();
    let order: Vec<String> = requests[0]
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(
        order,
        vec![
            format!("{stem}_part_1_h100_overlap20.png"),
            format!("{stem}_part_2_h100_overlap20.png"),
            format!("{stem}_part_3_h100_overlap20.png"),
        ]
    );
}

#[tokio::test]
async fn undecodable_screenshot_fails_once_and_is_kept() {
    let dir = TempDir::new().unwrap();
    let analyzer = Arc::new(RecordingAnalyzer::default());
    let pipeline = ChannelPipeline::new(config(dir.path()), analyzer.clone())
        .unwrap()
        .with_capturer(Arc::new(CorruptCapturer));

    let run = pipeline.run(&url_job("ratelimited")).await;

    assert!(run.is_failed());
    let failure = run.failure.as_ref().unwrap();
    assert_eq!(failure.stage, Stage::Tiling);
    assert_eq!(failure.attempts, 1);
    assert_eq!(run.attempts.capturing, 1);

    let shot = run.artifacts.screenshot_path.as_ref().unwrap();
    assert!(shot.exists(), "screenshot must survive a tiling failure");
    assert!(run.artifacts.analysis_path.is_none());
    assert!(analyzer.requests.lock().unwrap().is_empty());
}

#[tokio::test]
async fn stream_yields_every_run_once() {
    let dir = TempDir::new().unwrap();
    let pipeline = ChannelPipeline::new(config(dir.path()), Arc::new(RecordingAnalyzer::default()))
        .unwrap()
        .with_capturer(FakeCapturer::new(Some("nope")));
    let runner = BatchRunner::new(pipeline).with_concurrency(2);

    let jobs = vec![url_job("a"), url_job("nope"), url_job("c"), url_job("d")];
    let runs: Vec<_> = runner.stream(jobs).collect().await;

    let indices: BTreeSet<usize> = runs.iter().map(|(i, _)| *i).collect();
    assert_eq!(indices, (0..4).collect());
    assert!(runs.iter().all(|(_, r)| r.stage.is_terminal()));
    assert_eq!(runs.iter().filter(|(_, r)| r.is_failed()).count(), 1);
}

#[tokio::test]
async fn screenshot_inputs_need_no_capturer() {
    let dir = TempDir::new().unwrap();
    let shots = dir.path().join("shots");
    std::fs::create_dir_all(&shots).unwrap();
    for name in ["b.png", "a.png"] {
        RgbImage::from_pixel(10, 150, Rgb([0, 0, 0]))
            .save(shots.join(name))
            .unwrap();
    }

    let jobs = channel_persona::resolve_inputs(&[shots.to_string_lossy().into_owned()])
        .await
        .unwrap();
    assert_eq!(jobs.len(), 2);
    assert!(jobs.iter().all(|j| !j.needs_capture()));

    let pipeline = ChannelPipeline::new(config(dir.path()), Arc::new(RecordingAnalyzer::default()))
        .unwrap();
    let report = BatchRunner::new(pipeline).run(jobs).await;

    assert_eq!(report.succeeded, 2);
    assert!(report.runs[0].channel_identifier.ends_with("a.png"));
    assert!(dir.path().join("crop_a_analysis.md").exists());
    assert!(dir.path().join("crop_b_analysis.md").exists());
}

#[tokio::test]
async fn panicking_channel_is_reported_at_its_stage() {
    let dir = TempDir::new().unwrap();
    let shots = dir.path().join("shots");
    std::fs::create_dir_all(&shots).unwrap();
    let jobs: Vec<ChannelJob> = ["good1.png", "bad.png", "good2.png"]
        .iter()
        .map(|name| {
            let path = shots.join(name);
            RgbImage::from_pixel(10, 150, Rgb([0, 0, 0])).save(&path).unwrap();
            ChannelJob::Screenshot { path }
        })
        .collect();

    let pipeline = ChannelPipeline::new(config(dir.path()), Arc::new(PanickyAnalyzer)).unwrap();
    let report = BatchRunner::new(pipeline).run(jobs).await;

    assert_eq!((report.succeeded, report.failed), (2, 1));
    assert!(report.runs[0].is_done());
    assert!(report.runs[2].is_done());

    let failed = &report.runs[1];
    let failure = failed.failure.as_ref().unwrap();
    assert_eq!(failure.stage, Stage::Analyzing);
    assert!(failure.error.contains("boom"), "got: {}", failure.error);
    assert_eq!(failed.artifacts.screenshot_path, Some(shots.join("bad.png")));
    assert_eq!(failed.artifacts.tile_dir, Some(dir.path().join("crop_bad")));
}

// ── Retry timing ─────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn exhausted_capture_backs_off_exponentially() {
    let dir = TempDir::new().unwrap();
    let config = PipelineConfig::builder()
        .data_root(dir.path())
        .max_attempts(3)
        .backoff_unit(Duration::from_secs(1))
        .build()
        .unwrap();
    let capturer = FakeCapturer::new(Some("down"));
    let pipeline = ChannelPipeline::new(config, Arc::new(RecordingAnalyzer::default()))
        .unwrap()
        .with_capturer(capturer.clone());

    let start = tokio::time::Instant::now();
    let run = pipeline.run(&url_job("down")).await;
    let elapsed = start.elapsed();

    assert!(run.is_failed());
    assert_eq!(capturer.calls.load(Ordering::SeqCst), 3);
    // 1 s after the first failure, 2 s after the second, none after the last.
    assert!(elapsed >= Duration::from_secs(3), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(4), "{elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn cancellation_interrupts_backoff() {
    let dir = TempDir::new().unwrap();
    let config = PipelineConfig::builder()
        .data_root(dir.path())
        .max_attempts(5)
        .backoff_unit(Duration::from_secs(30))
        .build()
        .unwrap();
    let capturer = FakeCapturer::new(Some("down"));
    let pipeline = ChannelPipeline::new(config, Arc::new(RecordingAnalyzer::default()))
        .unwrap()
        .with_capturer(capturer.clone());

    let token = pipeline.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        token.cancel();
    });

    let run = pipeline.run(&url_job("down")).await;

    let failure = run.failure.unwrap();
    assert_eq!(failure.stage, Stage::Capturing);
    assert!(failure.error.contains("cancelled"), "got: {}", failure.error);
    assert_eq!(capturer.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn channel_delay_spaces_out_dispatches() {
    let dir = TempDir::new().unwrap();
    let config = PipelineConfig::builder()
        .data_root(dir.path())
        .concurrency(1)
        .channel_delay(Duration::from_secs(10))
        .build()
        .unwrap();
    let clock = Arc::new(DispatchClock::default());
    let pipeline = ChannelPipeline::new(config, Arc::new(RecordingAnalyzer::default()))
        .unwrap()
        .with_capturer(clock.clone());

    let start = tokio::time::Instant::now();
    let jobs = vec![url_job("one"), url_job("two"), url_job("three")];
    let report = BatchRunner::new(pipeline).run(jobs).await;
    let elapsed = start.elapsed();

    assert_eq!(report.failed, 3);
    let starts = clock.starts.lock().unwrap();
    assert_eq!(starts.len(), 3);
    for pair in starts.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(gap >= Duration::from_secs(10), "{gap:?}");
        assert!(gap < Duration::from_secs(11), "{gap:?}");
    }
    // (n - 1) delays, none before the first channel.
    assert!(starts[0] - start < Duration::from_secs(1));
    assert!(elapsed >= Duration::from_secs(20), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(21), "{elapsed:?}");
}

// ── Live end-to-end ──────────────────────────────────────────────────────────

#[tokio::test]
async fn live_single_channel() {
    if std::env::var("E2E_ENABLED").is_err() {
        println!("SKIP — set E2E_ENABLED=1 to run live tests");
        return;
    }
    let dir = TempDir::new().unwrap();
    let config = PipelineConfig::builder()
        .data_root(dir.path())
        .build()
        .unwrap();

    let inputs = vec!["https://www.youtube.com/@veritasium".to_string()];
    let report = run_channels(&inputs, config).await.unwrap();
    let run = &report.runs[0];
    println!("{run:#?}");
    assert!(run.is_done(), "{:?}", run.failure);

    let md = std::fs::read_to_string(run.artifacts.analysis_path.as_ref().unwrap()).unwrap();
    assert!(!md.trim().is_empty());
}
