//! Batch execution: many channels, bounded concurrency, isolated failures.
//!
//! ## Isolation
//!
//! Every channel runs in its own `tokio::spawn`ed task. A channel that fails,
//! or even panics, becomes a `FAILED` [`PipelineRun`] naming the stage it was
//! in; the other channels are unaffected and the batch itself never returns
//! an error.
//!
//! ## Concurrency
//!
//! At most `concurrency` channels are in flight (`buffer_unordered`). Stages
//! within one channel stay strictly sequential. With `concurrency = 1` the
//! batch behaves like a plain loop over the inputs. An optional
//! `channel_delay` spaces out dispatches to stay under the remote APIs' rate
//! limits.

use crate::channel::ChannelPipeline;
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::output::{BatchReport, PipelineRun};
use crate::pipeline::input::{resolve_inputs, ChannelJob};
use futures::stream::{self, Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Terminal runs in completion order, tagged with their input position.
pub type RunStream = Pin<Box<dyn Stream<Item = (usize, PipelineRun)> + Send>>;

/// Runs a list of channel jobs through a shared [`ChannelPipeline`].
#[derive(Debug, Clone)]
pub struct BatchRunner {
    pipeline: Arc<ChannelPipeline>,
    concurrency: usize,
    channel_delay: Duration,
}

impl BatchRunner {
    /// Runner using the pipeline config's `concurrency` and `channel_delay`.
    pub fn new(pipeline: ChannelPipeline) -> Self {
        let concurrency = pipeline.config().concurrency.max(1);
        let channel_delay = pipeline.config().channel_delay;
        Self {
            pipeline: Arc::new(pipeline),
            concurrency,
            channel_delay,
        }
    }

    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency = n.max(1);
        self
    }

    pub fn pipeline(&self) -> &ChannelPipeline {
        &self.pipeline
    }

    /// Token that cancels every channel of this runner.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.pipeline.cancellation_token()
    }

    /// Start the batch and yield each run as soon as it is terminal.
    pub fn stream(&self, jobs: Vec<ChannelJob>) -> RunStream {
        let pipeline = Arc::clone(&self.pipeline);
        let delay = self.channel_delay;

        let dispatched =
            stream::iter(jobs.into_iter().enumerate()).then(move |(index, job)| async move {
                if index > 0 && !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                (index, job)
            });

        let runs = dispatched
            .map(move |(index, job)| run_isolated(Arc::clone(&pipeline), index, job))
            .buffer_unordered(self.concurrency);

        Box::pin(runs)
    }

    /// Run every job and return the report, runs in input order.
    ///
    /// Never fails: per-channel failures are recorded in the report. Use
    /// [`BatchReport::into_result`] to treat them as an error.
    pub async fn run(&self, jobs: Vec<ChannelJob>) -> BatchReport {
        let start = Instant::now();
        let total = jobs.len();
        let progress = self.pipeline.progress().cloned();

        info!(
            "Processing {} channel(s), concurrency {}",
            total, self.concurrency
        );
        if let Some(ref cb) = progress {
            cb.on_batch_start(total);
        }

        let mut indexed: Vec<(usize, PipelineRun)> = self.stream(jobs).collect().await;
        indexed.sort_by_key(|(index, _)| *index);
        let runs = indexed.into_iter().map(|(_, run)| run).collect();

        let report = BatchReport::new(runs, start.elapsed().as_millis() as u64);
        if report.failed > 0 {
            warn!(
                "{}/{} channels failed ({} succeeded)",
                report.failed,
                report.total(),
                report.succeeded
            );
        } else {
            info!("All {} channel(s) done", report.total());
        }
        if let Some(ref cb) = progress {
            cb.on_batch_complete(total, report.succeeded);
        }
        report
    }
}

/// Run one job in its own task so nothing it does can take the batch down.
///
/// Collaborator panics are already caught per stage by
/// [`ChannelPipeline::run`]; a task that still ends abnormally (aborted, or a
/// panic outside any stage) is reported as FAILED with no stage progress.
async fn run_isolated(
    pipeline: Arc<ChannelPipeline>,
    index: usize,
    job: ChannelJob,
) -> (usize, PipelineRun) {
    let id = job.identifier();
    if let Some(cb) = pipeline.progress() {
        cb.on_channel_start(&id);
    }

    let task = {
        let pipeline = Arc::clone(&pipeline);
        tokio::spawn(async move { pipeline.run(&job).await })
    };

    let run = match task.await {
        Ok(run) => run,
        Err(e) => {
            let mut run = PipelineRun::new(&id);
            run.fail(0, &PipelineError::Internal(format!("channel task aborted: {e}")));
            run
        }
    };

    if let Some(failure) = &run.failure {
        error!(
            "{}: FAILED at {} after {} attempt(s): {}",
            id, failure.stage, failure.attempts, failure.error
        );
    }
    if let Some(cb) = pipeline.progress() {
        cb.on_channel_complete(&run);
    }
    (index, run)
}

/// Resolve `inputs`, build the production collaborators from the
/// environment and run the whole batch.
///
/// Fails only on startup problems: unreadable inputs, a missing credential,
/// an unconfigured LLM provider or an invalid config.
///
/// ```rust,no_run
/// use channel_persona::{run_channels, PipelineConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let inputs = vec!["https://www.youtube.com/@veritasium".to_string()];
///     let report = run_channels(&inputs, PipelineConfig::default()).await?;
///     for run in &report.runs {
///         println!("{} → {}", run.channel_identifier, run.stage);
///     }
///     Ok(())
/// }
/// ```
pub async fn run_channels(
    inputs: &[String],
    config: PipelineConfig,
) -> Result<BatchReport, PipelineError> {
    let jobs = resolve_inputs(inputs).await?;
    let pipeline = ChannelPipeline::from_env(config, &jobs).await?;
    Ok(BatchRunner::new(pipeline).run(jobs).await)
}
