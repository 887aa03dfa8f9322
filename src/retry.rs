//! Retry with exponential backoff for remote operations.
//!
//! The probe reports whether the operation is done: `Ok(true)` stops with
//! success, `Ok(false)` schedules another attempt and `Err` aborts at once.
//! Wait durations grow by `factor` and fall back to the initial duration once
//! they would reach `max_duration`, so long-running waits keep polling at a
//! bounded rate instead of settling on the maximum.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tracing::debug;

use crate::error::LsiError;

/// Backoff settings for [`retry_with_backoff`].
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Wait before the first retry.
    pub initial_duration: Duration,
    /// Multiplier applied after every failed attempt. Values `<= 0` and
    /// non-finite values keep the initial duration.
    pub factor: f64,
    /// Overall time budget for all attempts.
    pub timeout: Duration,
    /// Upper bound for a single wait; reaching it resets to the initial duration.
    pub max_duration: Option<Duration>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_duration: Duration::from_secs(10),
            factor: 1.2,
            timeout: Duration::from_secs(5 * 60),
            max_duration: Some(Duration::from_secs(2 * 60)),
        }
    }
}

impl BackoffConfig {
    /// Duration to wait after `last`.
    pub fn next_duration(&self, last: Duration) -> Duration {
        if !self.factor.is_finite() || self.factor <= 0.0 {
            return self.initial_duration;
        }
        let Ok(next) = Duration::try_from_secs_f64(last.as_secs_f64() * self.factor) else {
            return self.initial_duration;
        };
        match self.max_duration {
            Some(max) if next >= max => self.initial_duration,
            _ => next,
        }
    }
}

/// Drive `probe` until it reports success, fails, or `config.timeout` elapses.
///
/// A timeout fails with [`LsiError::TimeoutExceeded`], even while a probe is
/// still in flight.
pub async fn retry_with_backoff<F, Fut>(
    config: &BackoffConfig,
    operation: &str,
    mut probe: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let attempts = async {
        let mut wait = config.initial_duration;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if probe().await? {
                return Ok(());
            }
            debug!(
                operation = %operation,
                attempt = attempt,
                delay_ms = wait.as_millis(),
                "Operation not done, retrying"
            );
            tokio::time::sleep(wait).await;
            wait = config.next_duration(wait);
        }
    };

    match tokio::time::timeout(config.timeout, attempts).await {
        Ok(result) => result,
        Err(_) => Err(LsiError::TimeoutExceeded {
            operation: operation.to_string(),
            timeout: config.timeout,
        }
        .into()),
    }
}
