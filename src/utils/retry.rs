use crate::error::{BackupError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Exponential backoff with jitter.
///
/// Delay for attempt `k` (0-indexed) is
/// `clamp(initial_delay * backoff_factor^k * (1 + uniform(-jitter, jitter)), 0, max_delay)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    #[serde(with = "super::config::humantime_duration")]
    pub initial_delay: Duration,

    #[serde(with = "super::config::humantime_duration")]
    pub max_delay: Duration,

    /// Total attempts, the first one included
    pub max_attempts: u32,

    pub backoff_factor: f64,

    /// Fraction of the computed delay used as the jitter range
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            max_attempts: 5,
            backoff_factor: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Backoff to wait after the failed attempt `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(attempt as i32);
        let jitter = self.jitter.abs();
        let factor = if jitter > 0.0 {
            1.0 + rand::thread_rng().gen_range(-jitter..=jitter)
        } else {
            1.0
        };

        let secs = (base * factor).clamp(0.0, self.max_delay.as_secs_f64());
        if secs.is_finite() {
            Duration::from_secs_f64(secs)
        } else {
            self.max_delay
        }
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or `max_attempts` is reached.
    ///
    /// The operation receives the 0-indexed attempt number. The backoff wait
    /// observes `cancel`; an attempt already running is never interrupted.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut operation: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 0..max_attempts {
            if cancel.is_cancelled() {
                return Err(BackupError::Cancelled(format!(
                    "cancelled before attempt {}",
                    attempt + 1
                )));
            }

            let err = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_retryable() {
                debug!(attempt = attempt + 1, error = %err, "Non-retryable failure, giving up");
                return Err(err);
            }

            if attempt + 1 == max_attempts {
                last_error = Some(err);
                break;
            }

            let delay = self.delay_for_attempt(attempt);
            warn!(
                attempt = attempt + 1,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Attempt failed, retrying"
            );
            last_error = Some(err);

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(BackupError::Cancelled("cancelled during backoff".to_string()));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        Err(BackupError::RetriesExhausted {
            attempts: max_attempts,
            last: Box::new(last_error.unwrap_or_else(|| {
                BackupError::Provider("no attempt was made".to_string())
            })),
        })
    }
}
