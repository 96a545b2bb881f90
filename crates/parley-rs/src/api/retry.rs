//! Classified retry with exponential backoff.
//!
//! Every failed attempt is classified into an [`ErrorKind`]. Transient
//! failures (timeouts, connection errors, 429, 5xx) are retried after
//! `base_delay * 2^k` for the k-th retry; permanent and decode failures
//! return immediately. Jitter is not applied, so a schedule is reproducible.

use crate::error::{ErrorKind, RequestError};
use reqwest::StatusCode;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts including the first (1 = never retry).
    pub max_attempts: u32,
    /// Delay before the first retry; doubles for each later retry.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryConfig {
    /// Create a config with the given attempt budget. Uses default delays.
    pub fn with_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Default::default()
        }
    }

    /// A config that makes a single attempt.
    pub fn none() -> Self {
        Self::with_attempts(1)
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Delay before retry number `retry` (0-indexed): `base_delay * 2^retry`,
    /// capped at `max_delay`.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Worst-case total time spent sleeping between attempts.
    pub fn max_total_backoff(&self) -> Duration {
        (0..self.max_attempts.saturating_sub(1))
            .map(|k| self.delay_for_retry(k))
            .sum()
    }
}

/// Classify an HTTP status. Returns `None` for success statuses.
pub fn classify_status(status: StatusCode) -> Option<ErrorKind> {
    if status.is_success() {
        None
    } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Some(ErrorKind::Transient)
    } else {
        Some(ErrorKind::Permanent)
    }
}

/// Classify a transport-level failure (no usable response).
///
/// Timeouts and connection failures are transient. Errors raised while
/// building the request are permanent: resending cannot fix them.
pub fn classify_transport(err: &reqwest::Error) -> ErrorKind {
    if err.is_builder() {
        ErrorKind::Permanent
    } else if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        ErrorKind::Transient
    } else {
        ErrorKind::Permanent
    }
}

/// Run `call` until it succeeds, fails with a non-retryable error, or the
/// attempt budget is exhausted. The returned error records how many
/// attempts were made.
pub async fn retry_classified<T, F, Fut>(config: &RetryConfig, mut call: F) -> Result<T, RequestError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, RequestError>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match call(attempt).await {
            Ok(v) => return Ok(v),
            Err(mut e) => {
                let attempts_made = attempt + 1;
                if e.is_retryable() && attempts_made < max_attempts {
                    let delay = config.delay_for_retry(attempt);
                    warn!(
                        "Transient API error (attempt {attempts_made}/{max_attempts}): {}. Retrying in {delay:?}...",
                        e.detail,
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                } else {
                    if e.is_retryable() {
                        warn!("Giving up after {attempts_made} attempt(s): {}", e.detail);
                    }
                    e.attempts = attempts_made;
                    return Err(e);
                }
            }
        }
    }
}
