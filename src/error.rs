//! Error types for the channel-persona library.
//!
//! A single [`PipelineError`] enum covers every failure the pipeline can
//! produce, but the variants fall into three groups that the rest of the crate
//! treats differently:
//!
//! * **Unrecoverable input** — [`PipelineError::InvalidParameter`] and
//!   [`PipelineError::ImageDecode`]. Retrying cannot fix a bad tile height or
//!   a corrupt PNG, so the [`crate::retry::RetryExecutor`] lets them escape on
//!   the first attempt instead of burning the attempt budget.
//!
//! * **Transient** — network, remote API and filesystem failures
//!   ([`PipelineError::TransientIo`], [`PipelineError::ImageRead`],
//!   [`PipelineError::ImageWrite`], [`PipelineError::OutputWriteFailed`]).
//!   These are retried with exponential backoff.
//!
//! * **Terminal / reporting** — [`PipelineError::RetryExhausted`] drives a
//!   channel into the FAILED state; [`PipelineError::BatchPartialFailure`] is
//!   only ever built by [`crate::output::BatchReport::into_result`] for callers
//!   that want to treat any failed channel as an error.
//!
//! [`PipelineError::is_retryable`] is the one place where that classification
//! lives.

use std::path::PathBuf;
use thiserror::Error;

/// All errors returned by the channel-persona library.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Parameter / input errors ──────────────────────────────────────────
    /// Caller supplied parameters outside their valid range.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// A CLI/library input is neither a URL, an image, a directory nor a URL list.
    #[error("Invalid input '{input}': {reason}")]
    InvalidInput { input: String, reason: String },

    // ── Image errors ──────────────────────────────────────────────────────
    /// Source bytes are not a valid or supported image.
    #[error("Cannot decode image '{path}': {detail}")]
    ImageDecode { path: PathBuf, detail: String },

    /// The source image could not be read from disk.
    #[error("Cannot read image '{path}': {source}")]
    ImageRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A tile, its directory or the metadata report could not be written.
    #[error("Failed to write '{path}': {detail}")]
    ImageWrite { path: PathBuf, detail: String },

    // ── Collaborator errors ───────────────────────────────────────────────
    /// Network / remote API / filesystem failure that is worth retrying
    /// (timeouts, HTTP 5xx, empty or malformed responses).
    #[error("{operation} failed: {detail}")]
    TransientIo { operation: String, detail: String },

    /// A required credential was not present in the environment at startup.
    #[error("Credential '{var}' is not set.\nExport it or add it to a .env file.")]
    CredentialMissing { var: String },

    /// The configured LLM provider could not be initialised.
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── Retry / pipeline errors ───────────────────────────────────────────
    /// An operation failed on every one of its attempts.
    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    RetryExhausted {
        operation: String,
        attempts: u32,
        #[source]
        last_error: Box<PipelineError>,
    },

    /// The run was cancelled before `operation` could complete.
    #[error("{operation} cancelled")]
    Cancelled { operation: String },

    /// Some channels of a batch failed.
    ///
    /// Returned by [`crate::output::BatchReport::into_result`] only; the
    /// batch runner itself always returns a report.
    #[error("{failed}/{total} channels failed")]
    BatchPartialFailure {
        succeeded: usize,
        failed: usize,
        total: usize,
    },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write the analysis Markdown file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Shorthand for a [`PipelineError::TransientIo`].
    pub fn transient(operation: impl Into<String>, detail: impl ToString) -> Self {
        PipelineError::TransientIo {
            operation: operation.into(),
            detail: detail.to_string(),
        }
    }

    /// Whether a failed attempt with this error may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::TransientIo { .. }
                | PipelineError::ImageRead { .. }
                | PipelineError::ImageWrite { .. }
                | PipelineError::OutputWriteFailed { .. }
        )
    }

    /// Number of attempts recorded in a [`PipelineError::RetryExhausted`].
    pub fn attempts(&self) -> Option<u32> {
        match self {
            PipelineError::RetryExhausted { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }
}
