//! # channel-persona
//!
//! Capture YouTube channel pages, cut the screenshots into overlapping tiles
//! and have a vision model describe each channel's audience persona.
//!
//! ## Why tiles?
//!
//! A full channel page is thousands of pixels tall. Vision APIs shrink images
//! that large until video titles are unreadable, so each screenshot is cut
//! into fixed-height bands that share a few rows with their neighbours. The
//! model receives the bands in reading order and sees the page at native
//! resolution.
//!
//! ## Pipeline Overview
//!
//! ```text
//! channel URL
//!  │
//!  ├─ CAPTURING  screenshot API → <data_root>/web_snapshots/<slug>_<ts>.png
//!  ├─ TILING     overlapping bands → <data_root>/crop_<stem>/ (spawn_blocking)
//!  ├─ ANALYZING  ordered tiles → VLM → <data_root>/crop_<stem>_analysis.md
//!  └─ DONE       (or FAILED, recording the stage and last error)
//! ```
//!
//! Every stage is retried with exponential backoff. A channel that fails does
//! not stop the batch, and nothing it produced is deleted.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use channel_persona::{run_channels, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // SCREENSHOT_API_TOKEN plus ANTHROPIC_API_KEY (or another provider key)
//!     let config = PipelineConfig::builder()
//!         .data_root("data")
//!         .concurrency(2)
//!         .build()?;
//!     let inputs = vec![
//!         "https://www.youtube.com/@veritasium".to_string(),
//!         "channels.txt".to_string(),
//!     ];
//!     let report = run_channels(&inputs, config).await?;
//!     eprintln!("{}/{} channels analysed", report.succeeded, report.total());
//!     Ok(())
//! }
//! ```
//!
//! Tiling works on its own, without any credentials:
//!
//! ```rust
//! use channel_persona::tile_specs;
//!
//! let tiles = tile_specs(2500, 1000, 200).unwrap();
//! let ranges: Vec<_> = tiles.iter().map(|t| (t.top, t.bottom)).collect();
//! assert_eq!(ranges, vec![(0, 1000), (800, 1800), (1600, 2500)]);
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `channel-persona` binary (clap, anyhow, tracing-subscriber, indicatif) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod batch;
pub mod channel;
pub mod config;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod retry;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use batch::{run_channels, BatchRunner, RunStream};
pub use channel::ChannelPipeline;
pub use config::{
    AnalysisOptions, CaptureFormat, CaptureOptions, PipelineConfig, PipelineConfigBuilder,
};
pub use error::PipelineError;
pub use output::{Artifacts, BatchReport, PipelineRun, Stage, StageAttempts, StageFailure};
pub use pipeline::analyze::{AnalysisRequest, Analyzer, VisionAnalyzer};
pub use pipeline::capture::{Capturer, ScreenshotApiCapturer};
pub use pipeline::input::{resolve_inputs, ChannelJob};
pub use pipeline::tile::{tile_specs, ImageTiler, RawImage, TilePlan, TileSpec};
pub use progress::{NoopProgressCallback, PipelineProgressCallback, ProgressCallback};
pub use retry::{RetryExecutor, RetryState};
