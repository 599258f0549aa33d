//! Retry logic for transient store failures.
//!
//! [`with_retry`] wraps one logical request. Transient errors (connection
//! failures, timeouts, 5xx responses) are retried when the request's
//! [`RetryMode`] allows it; everything else is returned immediately.
//!
//! # Ambiguous Writes
//!
//! A transient failure does not tell whether the store applied the request.
//! Repeating a revision-guarded write whose first attempt landed gets a
//! conflict, because the revision has already moved on. Under
//! [`RetryMode::Conditional`] such a conflict is reported as a connection
//! error so the caller knows the outcome is unknown and can re-read.
//!
//! # Backoff Strategy
//!
//! Retries use exponential backoff with jitter:
//! - Base delay doubles with each attempt: `initial_backoff * 2^attempt`
//! - Delay is capped at `max_backoff`
//! - Random jitter of 0–50% of the computed delay is added so that many clients do not retry in
//!   lockstep

use std::{future::Future, time::Duration};

use fail::fail_point;
use rand::Rng;

use crate::{
    config::RetryConfig,
    error::{CouchError, Result},
    metrics::Metrics,
};

/// Whether a request may be sent more than once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RetryMode {
    /// Repeating the request cannot change the outcome: reads, deletes,
    /// database lifecycle calls.
    Idempotent,
    /// Writes against a known revision. Retried, but a conflict that follows
    /// a failed attempt becomes a connection error.
    Conditional,
    /// A repeat after an ambiguous failure could duplicate or spuriously
    /// conflict (creates without a revision, bulk writes). Sent exactly once.
    Once,
}

/// Executes `operation`, retrying transient failures according to `config`
/// when `mode` allows it.
///
/// Returns the first success, the first non-transient error, or the last
/// transient error once retries are exhausted.
///
/// When `metrics` is provided, each retry increments `retry_count` and a
/// request that still fails after retrying increments
/// `retry_exhausted_count`.
#[tracing::instrument(skip(config, metrics, operation), fields(max_retries = config.max_retries))]
pub(crate) async fn with_retry<F, Fut, T>(
    config: &RetryConfig,
    metrics: Option<&Metrics>,
    operation_name: &str,
    mode: RetryMode,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_retries = match mode {
        RetryMode::Idempotent | RetryMode::Conditional => config.max_retries,
        RetryMode::Once => 0,
    };

    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::debug!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        "operation succeeded after retry",
                    );
                }
                return Ok(value);
            },
            Err(err) if err.is_transient() && attempt < max_retries => {
                if let Some(m) = metrics {
                    m.record_retry();
                }
                let delay = compute_backoff(config, attempt);
                tracing::debug!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    max_attempts = max_retries + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient error, retrying after backoff",
                );
                fail_point!("retry-before-sleep");
                tokio::time::sleep(delay).await;
                attempt += 1;
            },
            Err(CouchError::Conflict { reason })
                if mode == RetryMode::Conditional && attempt > 0 =>
            {
                // The revision may have moved because an earlier attempt landed.
                tracing::warn!(
                    operation = operation_name,
                    attempts = attempt + 1,
                    %reason,
                    "conflict after a failed attempt, outcome unknown",
                );
                if let Some(m) = metrics {
                    m.record_retry_exhausted();
                }
                return Err(CouchError::connection(format!(
                    "outcome of {operation_name} is unknown: an earlier attempt failed and the \
                     retry conflicted ({reason})"
                )));
            },
            Err(err) => {
                if attempt > 0 && err.is_transient() {
                    if let Some(m) = metrics {
                        m.record_retry_exhausted();
                    }
                    tracing::warn!(
                        operation = operation_name,
                        attempts = attempt + 1,
                        error = %err,
                        "retries exhausted",
                    );
                }
                return Err(err);
            },
        }
    }
}

/// Computes the backoff duration for the given attempt number.
///
/// `min(initial_backoff * 2^attempt, max_backoff) + random(0..50% of delay)`
fn compute_backoff(config: &RetryConfig, attempt: u32) -> Duration {
    let base = config.initial_backoff.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
    let capped = base.min(config.max_backoff);

    let jitter_range = capped.as_millis() as u64 / 2;
    if jitter_range > 0 {
        let jitter = rand::rng().random_range(0..=jitter_range);
        capped + Duration::from_millis(jitter)
    } else {
        capped
    }
}
