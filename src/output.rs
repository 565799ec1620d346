//! Result types: per-channel [`PipelineRun`] and per-batch [`BatchReport`].
//!
//! Everything here is `Serialize` so the CLI can emit a run report as JSON
//! and callers can persist it next to the artefacts.

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// State of a channel pipeline.
///
/// `Capturing → Tiling → Analyzing → Done`, with `Failed` reachable from any
/// non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Capturing,
    Tiling,
    Analyzing,
    Done,
    Failed,
}

impl Stage {
    /// Successor on the happy path; terminal states map to themselves.
    pub fn next(self) -> Stage {
        match self {
            Stage::Capturing => Stage::Tiling,
            Stage::Tiling => Stage::Analyzing,
            Stage::Analyzing => Stage::Done,
            Stage::Done => Stage::Done,
            Stage::Failed => Stage::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Done | Stage::Failed)
    }

    /// Operation name used in logs and retry errors.
    pub fn operation(self) -> &'static str {
        match self {
            Stage::Capturing => "capture",
            Stage::Tiling => "tile",
            Stage::Analyzing => "analyze",
            Stage::Done => "done",
            Stage::Failed => "failed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Capturing => "CAPTURING",
            Stage::Tiling => "TILING",
            Stage::Analyzing => "ANALYZING",
            Stage::Done => "DONE",
            Stage::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Attempts spent in each working stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageAttempts {
    pub capturing: u32,
    pub tiling: u32,
    pub analyzing: u32,
}

impl StageAttempts {
    pub fn get(&self, stage: Stage) -> u32 {
        match stage {
            Stage::Capturing => self.capturing,
            Stage::Tiling => self.tiling,
            Stage::Analyzing => self.analyzing,
            Stage::Done | Stage::Failed => 0,
        }
    }

    fn set(&mut self, stage: Stage, attempts: u32) {
        match stage {
            Stage::Capturing => self.capturing = attempts,
            Stage::Tiling => self.tiling = attempts,
            Stage::Analyzing => self.analyzing = attempts,
            Stage::Done | Stage::Failed => {}
        }
    }
}

/// Paths produced so far. The files themselves are never removed by the
/// pipeline, not even when a later stage fails.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifacts {
    pub screenshot_path: Option<PathBuf>,
    pub tile_dir: Option<PathBuf>,
    /// Tiles written by this run, top to bottom. Other files in `tile_dir`
    /// (earlier geometries, unrelated images) are not part of the run.
    #[serde(default)]
    pub tiles: Vec<PathBuf>,
    pub analysis_path: Option<PathBuf>,
}

/// Why a run ended in [`Stage::Failed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFailure {
    /// Stage that was running when the failure happened.
    pub stage: Stage,
    pub attempts: u32,
    pub error: String,
}

/// One channel's end-to-end attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub channel_identifier: String,
    pub stage: Stage,
    pub attempts: StageAttempts,
    pub artifacts: Artifacts,
    pub failure: Option<StageFailure>,
    pub duration_ms: u64,
}

impl PipelineRun {
    /// A run that starts by capturing `channel_identifier`.
    pub fn new(channel_identifier: impl Into<String>) -> Self {
        Self {
            channel_identifier: channel_identifier.into(),
            stage: Stage::Capturing,
            attempts: StageAttempts::default(),
            artifacts: Artifacts::default(),
            failure: None,
            duration_ms: 0,
        }
    }

    /// A run whose screenshot already exists; it starts at [`Stage::Tiling`].
    pub fn from_screenshot(channel_identifier: impl Into<String>, screenshot: PathBuf) -> Self {
        let mut run = Self::new(channel_identifier);
        run.artifacts.screenshot_path = Some(screenshot);
        run.stage = Stage::Tiling;
        run
    }

    pub fn is_done(&self) -> bool {
        self.stage == Stage::Done
    }

    pub fn is_failed(&self) -> bool {
        self.stage == Stage::Failed
    }

    /// Record the attempts spent in the current stage and move to the next.
    pub(crate) fn advance(&mut self, attempts: u32) {
        debug_assert!(!self.stage.is_terminal());
        self.attempts.set(self.stage, attempts);
        self.stage = self.stage.next();
    }

    /// Record the failure of the current stage and move to [`Stage::Failed`].
    pub(crate) fn fail(&mut self, attempts: u32, error: &PipelineError) {
        let stage = self.stage;
        self.attempts.set(stage, attempts);
        self.failure = Some(StageFailure {
            stage,
            attempts,
            error: error.to_string(),
        });
        self.stage = Stage::Failed;
    }
}

/// Outcome of a whole batch, runs listed in input order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub runs: Vec<PipelineRun>,
    pub succeeded: usize,
    pub failed: usize,
    pub duration_ms: u64,
}

impl BatchReport {
    pub fn new(runs: Vec<PipelineRun>, duration_ms: u64) -> Self {
        let succeeded = runs.iter().filter(|r| r.is_done()).count();
        let failed = runs.len() - succeeded;
        Self {
            runs,
            succeeded,
            failed,
            duration_ms,
        }
    }

    pub fn total(&self) -> usize {
        self.runs.len()
    }

    /// True when there was work and none of it succeeded.
    pub fn all_failed(&self) -> bool {
        !self.runs.is_empty() && self.succeeded == 0
    }

    /// Treat any failed channel as an error.
    pub fn into_result(self) -> Result<BatchReport, PipelineError> {
        if self.failed > 0 {
            return Err(PipelineError::BatchPartialFailure {
                succeeded: self.succeeded,
                failed: self.failed,
                total: self.total(),
            });
        }
        Ok(self)
    }
}
