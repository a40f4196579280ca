//! Retry with exponential backoff, shared by discovery and extraction.
//!
//! Every retrying call in the crate goes through [`RetryPolicy::run`], which is
//! parameterized by the attempt budget, the backoff schedule and a predicate
//! deciding which errors are worth another attempt.
//!
//! # Backoff Strategy
//!
//! The delay before attempt `n + 1` follows:
//! ```text
//! delay = min(base_delay * 2^(n-1), max_delay) + random_jitter(0..=jitter)
//! ```
//! A policy built with [`RetryPolicy::fixed`] has `max_delay == base_delay`,
//! which flattens the schedule to a constant pause.
//!
//! Backoff sleeps go through [`StopSignal::sleep`]; a stop request ends the
//! loop with the last error instead of waiting out the delay.

use rand::{Rng, rng};
use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use crate::stop::StopSignal;

/// Attempt budget and backoff schedule for a retrying operation.
#[derive(Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Never less than 1.
    pub max_attempts: usize,
    /// Delay after the first failure; doubles after each further failure.
    pub base_delay: Duration,
    /// Cap applied before jitter.
    pub max_delay: Duration,
    /// Upper bound of the random jitter added to each delay.
    pub jitter: Duration,
}

impl RetryPolicy {
    /// Exponential policy capped at 30 seconds with up to 250ms of jitter.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let policy = RetryPolicy::new(5, Duration::from_secs(1));
    /// // waits roughly 1s, 2s, 4s, 8s between the five attempts
    /// ```
    pub fn new(max_attempts: usize, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: Duration::from_secs(30),
            jitter: Duration::from_millis(250),
        }
    }

    /// Constant pause between attempts, no jitter.
    pub fn fixed(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: delay,
            max_delay: delay,
            jitter: Duration::ZERO,
        }
    }

    /// Delay to wait after the `attempt`-th failure (1-based), before jitter.
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let shift = attempt.saturating_sub(1).min(31) as u32;
        let delay = self.base_delay.saturating_mul(1u32 << shift);
        delay.min(self.max_delay)
    }

    fn jittered(&self, attempt: usize) -> Duration {
        let delay = self.delay_for(attempt);
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return delay;
        }
        delay + Duration::from_millis(rng().random_range(0..=jitter_ms))
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, runs out
    /// of attempts, or `stop` fires during a backoff.
    ///
    /// `op` receives the 1-based attempt number.
    ///
    /// # Returns
    ///
    /// The first successful value, or the last error seen.
    pub async fn run<T, E, F, Fut, P>(
        &self,
        label: &str,
        stop: &StopSignal,
        mut op: F,
        retryable: P,
    ) -> Result<T, E>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: fmt::Display,
    {
        let total_t0 = Instant::now();
        let mut attempt = 0usize;

        loop {
            attempt += 1;
            let attempt_t0 = Instant::now();
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(label, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => {
                    let elapsed_ms_attempt = attempt_t0.elapsed().as_millis() as u64;
                    let elapsed_ms_total = total_t0.elapsed().as_millis() as u64;

                    if !retryable(&e) {
                        debug!(label, attempt, error = %e, "error is not retryable");
                        return Err(e);
                    }
                    if attempt >= self.max_attempts {
                        error!(
                            label,
                            attempt,
                            max = self.max_attempts,
                            elapsed_ms_attempt,
                            elapsed_ms_total,
                            error = %e,
                            "exhausted retries"
                        );
                        return Err(e);
                    }

                    let delay = self.jittered(attempt);
                    warn!(
                        label,
                        attempt,
                        max = self.max_attempts,
                        elapsed_ms_attempt,
                        elapsed_ms_total,
                        ?delay,
                        error = %e,
                        "attempt failed; backing off"
                    );
                    if !stop.sleep(delay).await {
                        debug!(label, attempt, "stop requested during backoff");
                        return Err(e);
                    }
                }
            }
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .finish()
    }
}
