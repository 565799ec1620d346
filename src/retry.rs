//! Bounded retry with exponential backoff around any fallible async operation.
//!
//! ## Backoff
//!
//! The wait after failed attempt `n` (0-indexed) is `unit * 2^n`, capped at
//! `max_delay`: with the default 1 s unit the sequence is 1 s → 2 s → 4 s … and
//! never exceeds 60 s. No wait follows the final attempt.
//!
//! The wait is a `tokio::time::sleep`, so a channel that is backing off does
//! not hold a worker thread, and it races a [`CancellationToken`] so Ctrl-C
//! does not have to wait out a long backoff.
//!
//! ## Classification
//!
//! Only errors for which [`PipelineError::is_retryable`] is true are retried.
//! Anything else (bad parameters, undecodable images, cancellation) is returned
//! as-is on the attempt that produced it.
//!
//! The wrapped operation must tolerate being invoked more than once; the
//! executor does no deduplication.

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Book-keeping for one [`RetryExecutor`] invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryState {
    pub operation: String,
    /// Attempts made so far (1-indexed once the first attempt has started).
    pub attempt: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
}

impl RetryState {
    fn new(operation: &str, max_attempts: u32) -> Self {
        Self {
            operation: operation.to_string(),
            attempt: 0,
            max_attempts,
            last_error: None,
        }
    }
}

/// Runs an operation up to `max_attempts` times with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    max_attempts: u32,
    unit: Duration,
    max_delay: Duration,
    cancel: Option<CancellationToken>,
}

impl RetryExecutor {
    /// Executor with a 1 s backoff unit and a 60 s cap.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            unit: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            cancel: None,
        }
    }

    /// Executor using the attempt budget and backoff settings of `config`.
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.max_attempts)
            .with_backoff_unit(config.backoff_unit)
            .with_max_delay(config.max_backoff)
    }

    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.unit = unit;
        self
    }

    pub fn with_max_delay(mut self, cap: Duration) -> Self {
        self.max_delay = cap;
        self
    }

    /// Abort pending and future attempts once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Wait applied after the 0-indexed failed attempt `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.unit.checked_mul(factor))
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent (→ [`PipelineError::RetryExhausted`]).
    pub async fn execute<T, F, Fut>(&self, operation: &str, op: F) -> Result<T, PipelineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        self.execute_tracked(operation, op).await.0
    }

    /// Like [`RetryExecutor::execute`], also returning the final [`RetryState`].
    pub async fn execute_tracked<T, F, Fut>(
        &self,
        operation: &str,
        mut op: F,
    ) -> (Result<T, PipelineError>, RetryState)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        let mut state = RetryState::new(operation, self.max_attempts);

        loop {
            if self.is_cancelled() {
                return (Err(cancelled(operation)), state);
            }

            state.attempt += 1;
            let err = match op().await {
                Ok(value) => {
                    if state.attempt > 1 {
                        info!(
                            "{}: succeeded on attempt {}/{}",
                            operation, state.attempt, self.max_attempts
                        );
                    }
                    return (Ok(value), state);
                }
                Err(e) => e,
            };

            state.last_error = Some(err.to_string());

            if !err.is_retryable() {
                warn!(
                    "{}: attempt {} failed with a non-retryable error — {}",
                    operation, state.attempt, err
                );
                return (Err(err), state);
            }

            warn!(
                "{}: attempt {}/{} failed — {}",
                operation, state.attempt, self.max_attempts, err
            );

            if state.attempt >= self.max_attempts {
                error!(
                    "{}: giving up after {} attempts",
                    operation, self.max_attempts
                );
                let exhausted = PipelineError::RetryExhausted {
                    operation: operation.to_string(),
                    attempts: state.attempt,
                    last_error: Box::new(err),
                };
                return (Err(exhausted), state);
            }

            let delay = self.delay_for(state.attempt - 1);
            info!("{}: retrying in {:?}", operation, delay);

            match &self.cancel {
                Some(token) => {
                    tokio::select! {
                        _ = token.cancelled() => return (Err(cancelled(operation)), state),
                        _ = sleep(delay) => {}
                    }
                }
                None => sleep(delay).await,
            }
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|t| t.is_cancelled())
    }
}

fn cancelled(operation: &str) -> PipelineError {
    PipelineError::Cancelled {
        operation: operation.to_string(),
    }
}
