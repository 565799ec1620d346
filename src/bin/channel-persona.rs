//! CLI binary for channel-persona.
//!
//! A thin shim over the library crate: flags → `PipelineConfig`, inputs →
//! jobs, a progress bar while the batch runs, a summary at the end.

use anyhow::{bail, Context, Result};
use channel_persona::pipeline::input::read_url_file;
use channel_persona::{
    resolve_inputs, tile_specs, AnalysisOptions, BatchReport, BatchRunner, CaptureFormat,
    CaptureOptions, ChannelJob, ChannelPipeline, PipelineConfig, PipelineProgressCallback,
    PipelineRun, Stage, TileSpec,
};
use chrono::Local;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// ── ANSI colour helpers ──────────────────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

const SPINNER: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────

/// One bar for the batch, one log line per finished channel. Channels may
/// finish out of order when `--concurrency` > 1.
struct CliProgressCallback {
    bar: ProgressBar,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  [{bar:36.green/238}] {pos:>3}/{len} channels  \
             ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(SPINNER);
        bar.set_style(style);
        bar.set_prefix("Analysing");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self { bar })
    }
}

impl PipelineProgressCallback for CliProgressCallback {
    fn on_batch_start(&self, total_channels: usize) {
        self.bar.set_length(total_channels as u64);
        self.bar.reset_eta();
    }

    fn on_stage_start(&self, channel: &str, stage: Stage) {
        self.bar.set_message(format!("{stage} {}", dim(channel)));
    }

    fn on_channel_complete(&self, run: &PipelineRun) {
        let secs = run.duration_ms as f64 / 1000.0;
        let line = match (&run.failure, &run.artifacts.analysis_path) {
            (None, Some(path)) => format!(
                "  {} {}  →  {}  {}",
                green("✓"),
                run.channel_identifier,
                path.display(),
                dim(&format!("{secs:.1}s"))
            ),
            (Some(failure), _) => {
                let msg = if failure.error.chars().count() > 100 {
                    let cut: String = failure.error.chars().take(99).collect();
                    format!("{cut}\u{2026}")
                } else {
                    failure.error.clone()
                };
                format!(
                    "  {} {}  {} at {}: {}",
                    red("✗"),
                    run.channel_identifier,
                    red("FAILED"),
                    failure.stage,
                    msg
                )
            }
            (None, None) => format!("  ? {}  {}", run.channel_identifier, run.stage),
        };
        self.bar.println(line);
        self.bar.inc(1);
    }

    fn on_batch_complete(&self, _total_channels: usize, _succeeded: usize) {
        self.bar.finish_and_clear();
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Analyse one channel (writes under ./data)
  channel-persona https://www.youtube.com/@veritasium

  # A list of channels, two at a time, 5 s between dispatches
  channel-persona --urls-file channels.txt --concurrency 2 --channel-delay-ms 5000

  # Re-analyse screenshots you already have
  channel-persona data/web_snapshots/

  # Show how a screenshot would be tiled (no API keys needed)
  channel-persona --plan-only --part-height 1000 --overlap 200 shot.png

  # Add a brief to every analysis and keep a log file
  channel-persona --context brief.md --log-dir logs https://www.youtube.com/@mkbhd

OUTPUT LAYOUT:
  <data_root>/web_snapshots/<slug>_<YYYYmmdd_HHMMSS>.png
  <data_root>/crop_<stem>/metadata.txt
  <data_root>/crop_<stem>/<stem>_part_<n>_h<height>_overlap<overlap>.<ext>
  <data_root>/crop_<stem>_analysis.md

ENVIRONMENT VARIABLES:
  SCREENSHOT_API_TOKEN    screenshotapi.net token (required for URL inputs)
  ANTHROPIC_API_KEY       Anthropic API key (default provider)
  OPENAI_API_KEY          OpenAI API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (with EDGEQUAKE_MODEL)
  RUST_LOG                Log filter, overrides -v / -q

  Variables may also be set in a .env file in the working directory.

EXIT STATUS:
  0 when at least one channel was analysed, 1 when all failed or on a
  startup error (missing token, bad input, invalid settings).
"#;

/// Capture YouTube channel pages, tile them and describe their audience.
#[derive(Parser, Debug)]
#[command(
    name = "channel-persona",
    version,
    about = "Capture YouTube channel pages, tile them and describe their audience with a vision LLM",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Channel URLs, screenshot files, directories of screenshots or URL list files.
    inputs: Vec<String>,

    /// File with one channel URL per line (# comments allowed).
    #[arg(long, env = "CHANNEL_PERSONA_URLS_FILE")]
    urls_file: Option<PathBuf>,

    /// Root directory for screenshots, tiles and analyses.
    #[arg(short = 'o', long, env = "CHANNEL_PERSONA_DATA_ROOT", default_value = "data")]
    data_root: PathBuf,

    // ── Tiling and retry ─────────────────────────────────────────────────
    /// Tile height in pixels.
    #[arg(long, env = "CHANNEL_PERSONA_PART_HEIGHT", default_value_t = 1024,
          value_parser = clap::value_parser!(u32).range(1..))]
    part_height: u32,

    /// Rows shared by consecutive tiles (must be smaller than --part-height).
    #[arg(long, env = "CHANNEL_PERSONA_OVERLAP", default_value_t = 100)]
    overlap: u32,

    /// Attempts per stage before a channel is marked FAILED.
    #[arg(long, env = "CHANNEL_PERSONA_MAX_ATTEMPTS", default_value_t = 3,
          value_parser = clap::value_parser!(u32).range(1..))]
    max_attempts: u32,

    /// Channels processed at the same time.
    #[arg(short, long, env = "CHANNEL_PERSONA_CONCURRENCY", default_value_t = 1,
          value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..))]
    concurrency: usize,

    /// Backoff unit in milliseconds; waits are unit × 2^n.
    #[arg(long, env = "CHANNEL_PERSONA_BACKOFF_MS", default_value_t = 1000)]
    backoff_ms: u64,

    /// Longest single backoff wait in seconds.
    #[arg(long, env = "CHANNEL_PERSONA_MAX_BACKOFF_SECS", default_value_t = 60)]
    max_backoff_secs: u64,

    /// Pause before dispatching each channel after the first, in milliseconds.
    #[arg(long, env = "CHANNEL_PERSONA_CHANNEL_DELAY_MS", default_value_t = 0)]
    channel_delay_ms: u64,

    // ── Analysis ─────────────────────────────────────────────────────────
    /// LLM provider: anthropic, openai, gemini, ollama, azure.
    #[arg(long, env = "CHANNEL_PERSONA_PROVIDER")]
    provider: Option<String>,

    /// LLM model ID (e.g. claude-sonnet-4-20250514, gpt-4.1).
    #[arg(long, env = "CHANNEL_PERSONA_MODEL")]
    model: Option<String>,

    /// Max tokens generated per analysis.
    #[arg(long, env = "CHANNEL_PERSONA_MAX_TOKENS", default_value_t = 1000)]
    max_tokens: usize,

    /// LLM temperature.
    #[arg(long, env = "CHANNEL_PERSONA_TEMPERATURE", default_value_t = 0.0)]
    temperature: f32,

    /// Text file with a custom analysis prompt.
    #[arg(long, env = "CHANNEL_PERSONA_PROMPT_FILE")]
    prompt_file: Option<PathBuf>,

    /// Document whose text is added to every analysis (repeatable).
    #[arg(long = "context", env = "CHANNEL_PERSONA_CONTEXT", value_delimiter = ',')]
    context: Vec<PathBuf>,

    /// Per-call LLM timeout in seconds.
    #[arg(long, env = "CHANNEL_PERSONA_API_TIMEOUT", default_value_t = 120)]
    api_timeout: u64,

    // ── Capture ──────────────────────────────────────────────────────────
    /// Browser viewport width in pixels.
    #[arg(long, env = "CHANNEL_PERSONA_WIDTH", default_value_t = 1920)]
    width: u32,

    /// Browser viewport height in pixels.
    #[arg(long, env = "CHANNEL_PERSONA_HEIGHT", default_value_t = 3240)]
    height: u32,

    /// Wait before capturing, in milliseconds.
    #[arg(long, env = "CHANNEL_PERSONA_DELAY_MS", default_value_t = 12_000)]
    delay_ms: u64,

    /// Capture the whole scrollable page.
    #[arg(long, env = "CHANNEL_PERSONA_FULL_PAGE")]
    full_page: bool,

    /// Screenshot format.
    #[arg(long, env = "CHANNEL_PERSONA_FORMAT", value_enum, default_value = "png")]
    format: FormatArg,

    // ── Output ───────────────────────────────────────────────────────────
    /// Print the tile plan for each screenshot input and exit.
    #[arg(long, env = "CHANNEL_PERSONA_PLAN_ONLY")]
    plan_only: bool,

    /// Print the batch report as JSON on stdout.
    #[arg(long, env = "CHANNEL_PERSONA_JSON")]
    json: bool,

    /// Disable the progress bar.
    #[arg(long, env = "CHANNEL_PERSONA_NO_PROGRESS")]
    no_progress: bool,

    /// Also write logs to <LOG_DIR>/pipeline_<timestamp>.log.
    #[arg(long, env = "CHANNEL_PERSONA_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Enable DEBUG-level logs.
    #[arg(short, long, env = "CHANNEL_PERSONA_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "CHANNEL_PERSONA_QUIET")]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum FormatArg {
    Png,
    Jpeg,
}

impl From<FormatArg> for CaptureFormat {
    fn from(v: FormatArg) -> Self {
        match v {
            FormatArg::Png => CaptureFormat::Png,
            FormatArg::Jpeg => CaptureFormat::Jpeg,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Before parsing, so .env values feed the env fallbacks of every flag.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let show_progress = !cli.quiet && !cli.no_progress && !cli.json && !cli.plan_only;
    let _log_guard = init_logging(&cli, show_progress)?;

    let inputs = collect_inputs(&cli).await?;
    let jobs = resolve_inputs(&inputs)
        .await
        .context("Failed to resolve inputs")?;
    if jobs.is_empty() {
        bail!("No channels to process");
    }

    if cli.plan_only {
        return print_plans(&cli, &jobs);
    }

    let config = build_config(&cli).await?;
    let mut pipeline = ChannelPipeline::from_env(config, &jobs)
        .await
        .context("Startup failed")?;
    if show_progress {
        pipeline = pipeline.with_progress(CliProgressCallback::new());
    }

    let runner = BatchRunner::new(pipeline);
    let token = runner.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; cancelling remaining work");
            token.cancel();
        }
    });

    let report = runner.run(jobs).await;

    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialise report")?
        );
    } else if !cli.quiet {
        print_summary(&report);
    }

    if report.all_failed() {
        bail!("All {} channel(s) failed", report.total());
    }
    Ok(())
}

/// Console logs, plus a plain-text file log when `--log-dir` is set.
///
/// The returned guard flushes the file writer on drop; keep it alive for the
/// whole of `main`.
fn init_logging(cli: &Cli, show_progress: bool) -> Result<Option<WorkerGuard>> {
    // The progress bar covers INFO-level progress; keep the console to warnings.
    let level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else if show_progress {
        "warn"
    } else {
        "info"
    };
    let console = fmt::layer().with_writer(io::stderr).with_filter(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
    );

    let (file_layer, guard) = match &cli.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let name = format!("pipeline_{}.log", Local::now().format("%Y%m%d_%H%M%S"));
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            let layer = fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(EnvFilter::new(if cli.verbose { "debug" } else { "info" }));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .init();
    Ok(guard)
}

/// Positional inputs plus the URLs of `--urls-file`.
async fn collect_inputs(cli: &Cli) -> Result<Vec<String>> {
    let mut inputs = cli.inputs.clone();
    if let Some(ref path) = cli.urls_file {
        let urls = read_url_file(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        inputs.extend(urls);
    }
    if inputs.is_empty() {
        bail!("No inputs given; pass URLs, screenshots, directories or --urls-file");
    }
    Ok(inputs)
}

/// Map CLI args to `PipelineConfig`.
async fn build_config(cli: &Cli) -> Result<PipelineConfig> {
    let prompt = match cli.prompt_file {
        Some(ref path) => Some(
            tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read prompt from {}", path.display()))?,
        ),
        None => None,
    };

    let capture = CaptureOptions {
        width: cli.width,
        height: cli.height,
        delay_ms: cli.delay_ms,
        full_page: cli.full_page,
        format: cli.format.into(),
        ..CaptureOptions::default()
    };
    let analysis = AnalysisOptions {
        model: cli.model.clone(),
        provider_name: cli.provider.clone(),
        temperature: cli.temperature,
        max_tokens: cli.max_tokens,
        prompt,
        api_timeout_secs: cli.api_timeout,
        ..AnalysisOptions::default()
    };

    let mut builder = PipelineConfig::builder()
        .data_root(&cli.data_root)
        .part_height(cli.part_height)
        .overlap(cli.overlap)
        .max_attempts(cli.max_attempts)
        .concurrency(cli.concurrency)
        .backoff_unit(Duration::from_millis(cli.backoff_ms))
        .max_backoff(Duration::from_secs(cli.max_backoff_secs))
        .channel_delay(Duration::from_millis(cli.channel_delay_ms))
        .capture(capture)
        .analysis(analysis);
    for doc in &cli.context {
        builder = builder.context_document(doc);
    }

    builder.build().context("Invalid configuration")
}

#[derive(Serialize)]
struct TilePlanReport {
    input: String,
    width: Option<u32>,
    height: Option<u32>,
    tiles: Vec<TileSpec>,
    note: Option<String>,
}

/// `--plan-only`: tile geometry per screenshot, no credentials, no writes.
fn print_plans(cli: &Cli, jobs: &[ChannelJob]) -> Result<()> {
    let mut plans = Vec::with_capacity(jobs.len());
    for job in jobs {
        let plan = match job {
            ChannelJob::Screenshot { path } => {
                let (width, height) = image::image_dimensions(path)
                    .with_context(|| format!("Cannot read image size of {}", path.display()))?;
                TilePlanReport {
                    input: job.identifier(),
                    width: Some(width),
                    height: Some(height),
                    tiles: tile_specs(height, cli.part_height, cli.overlap)
                        .context("Invalid tiling parameters")?,
                    note: None,
                }
            }
            ChannelJob::Capture { .. } => TilePlanReport {
                input: job.identifier(),
                width: None,
                height: None,
                tiles: Vec::new(),
                note: Some("needs capture; size unknown until captured".into()),
            },
        };
        plans.push(plan);
    }

    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&plans).context("Failed to serialise plan")?
        );
        return Ok(());
    }

    for plan in &plans {
        match (plan.width, plan.height) {
            (Some(w), Some(h)) => {
                println!("{}  ({w}x{h}, {} tiles)", bold(&plan.input), plan.tiles.len());
                for t in &plan.tiles {
                    println!(
                        "  part {:>3}  rows {:>6}..{:<6}  {}",
                        t.index + 1,
                        t.top,
                        t.bottom,
                        dim(&format!("{} px", t.height()))
                    );
                }
            }
            _ => println!(
                "{}  {}",
                bold(&plan.input),
                dim(plan.note.as_deref().unwrap_or_default())
            ),
        }
    }
    Ok(())
}

fn print_summary(report: &BatchReport) {
    let mark = if report.failed == 0 {
        green("✔")
    } else if report.succeeded == 0 {
        red("✘")
    } else {
        red("⚠")
    };
    eprintln!(
        "{} {}/{} channels analysed  {}",
        mark,
        bold(&report.succeeded.to_string()),
        report.total(),
        dim(&format!("{:.1}s", report.duration_ms as f64 / 1000.0)),
    );
    for run in report.runs.iter().filter(|r| r.is_failed()) {
        if let Some(ref failure) = run.failure {
            eprintln!(
                "   {} {} at {} ({} attempts): {}",
                red("✗"),
                run.channel_identifier,
                failure.stage,
                failure.attempts,
                failure.error
            );
        }
        if let Some(ref shot) = run.artifacts.screenshot_path {
            eprintln!("     {} {}", dim("screenshot kept:"), shot.display());
        }
    }
}
