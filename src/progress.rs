//! Progress-callback trait for batch, channel and stage events.
//!
//! Hand an [`Arc<dyn PipelineProgressCallback>`] to
//! [`crate::channel::ChannelPipeline::with_progress`] to observe a batch as it
//! runs. The library never renders anything itself; the CLI turns these events
//! into an `indicatif` progress bar, and a service could forward them to a
//! channel or a database instead.
//!
//! # Example
//!
//! ```rust
//! use channel_persona::{PipelineProgressCallback, PipelineRun};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! struct FailureCounter(AtomicUsize);
//!
//! impl PipelineProgressCallback for FailureCounter {
//!     fn on_channel_complete(&self, run: &PipelineRun) {
//!         if run.is_failed() {
//!             self.0.fetch_add(1, Ordering::SeqCst);
//!         }
//!     }
//! }
//! ```

use crate::output::{PipelineRun, Stage};
use std::sync::Arc;

/// Called by the batch runner and the channel pipeline as work progresses.
///
/// All methods default to no-ops. With `concurrency > 1` the channel-level
/// methods are called from several tasks at once, so shared state needs
/// `Mutex`/atomics.
pub trait PipelineProgressCallback: Send + Sync {
    /// Called once before any channel starts.
    fn on_batch_start(&self, total_channels: usize) {
        let _ = total_channels;
    }

    /// Called when a channel run is dispatched.
    fn on_channel_start(&self, channel: &str) {
        let _ = channel;
    }

    /// Called before the first attempt of each working stage.
    fn on_stage_start(&self, channel: &str, stage: Stage) {
        let _ = (channel, stage);
    }

    /// Called once per channel with its terminal run (DONE or FAILED).
    fn on_channel_complete(&self, run: &PipelineRun) {
        let _ = run;
    }

    /// Called once after every channel reached a terminal state.
    fn on_batch_complete(&self, total_channels: usize, succeeded: usize) {
        let _ = (total_channels, succeeded);
    }
}

/// A callback that ignores every event.
pub struct NoopProgressCallback;

impl PipelineProgressCallback for NoopProgressCallback {}

/// Shared handle stored by the pipeline.
pub type ProgressCallback = Arc<dyn PipelineProgressCallback>;
