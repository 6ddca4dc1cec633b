//! Bounded exponential backoff shared by the registry and search clients.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// How a failed attempt should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryHint {
    /// Permanent failure; give up immediately.
    Never,
    /// Transient failure; wait the backoff delay and try again.
    Backoff,
    /// Server asked us to wait (rate limit). `None` means no usable delay was given.
    After(Option<Duration>),
}

/// Errors that know whether they are worth retrying.
pub trait Retryable {
    fn retry_hint(&self) -> RetryHint;
}

/// Retry budget for one operation (one page fetch, one bulk request).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    /// Attempts including the first one.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Rate-limit pauses allowed on top of `max_attempts`.
    pub max_rate_limit_waits: u32,
    /// Randomize each delay between 50% and 100% of the computed value.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            max_rate_limit_waits: 10,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that never sleeps. Used by tests and one-shot probes.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            jitter: false,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1 = first retry), capped at `max_delay_ms`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31) as i32;
        let raw = self.initial_delay_ms as f64 * self.multiplier.powi(exp);
        let capped = raw.min(self.max_delay_ms as f64).max(0.0) as u64;
        let ms = if self.jitter && capped > 1 {
            rand::thread_rng().gen_range(capped / 2..=capped)
        } else {
            capped
        };
        Duration::from_millis(ms)
    }

    /// Run `op` until it succeeds, fails permanently, or the budget runs out.
    /// The last error is returned when giving up.
    pub async fn run<T, E, F, Fut>(&self, what: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        let mut attempts = 0u32;
        let mut rate_waits = 0u32;

        loop {
            attempts += 1;
            let err = match op().await {
                Ok(v) => return Ok(v),
                Err(e) => e,
            };

            let delay = match err.retry_hint() {
                RetryHint::Never => return Err(err),
                RetryHint::After(hint) if rate_waits < self.max_rate_limit_waits => {
                    rate_waits += 1;
                    // Rate-limit pauses retry the same request without spending an attempt.
                    attempts -= 1;
                    hint.unwrap_or_else(|| self.delay_for(rate_waits))
                }
                RetryHint::After(_) | RetryHint::Backoff => {
                    if attempts >= self.max_attempts {
                        warn!(%what, attempts, error = %err, "giving up after retries");
                        return Err(err);
                    }
                    self.delay_for(attempts)
                }
            };

            warn!(%what, attempts, delay_ms = delay.as_millis() as u64, error = %err, "retrying");
            tokio::time::sleep(delay).await;
        }
    }
}
