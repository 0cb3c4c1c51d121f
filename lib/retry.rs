//! Bounded retry with fixed or exponential backoff

use std::{future::Future, time::Duration};

use rand::Rng as _;
use serde::{Deserialize, Serialize};

use crate::upstream::Error;

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Backoff {
    Fixed {
        delay: Duration,
    },
    /// `initial * multiplier^n`, capped at `max`. With `jitter`, each delay
    /// is drawn uniformly from `[0, delay]`.
    Exponential {
        initial: Duration,
        max: Duration,
        multiplier: f64,
        jitter: bool,
    },
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct RetryPolicy {
    /// Total attempts including the first. Zero behaves like one.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    /// 18 attempts, 10s apart
    fn default() -> Self {
        Self {
            max_attempts: 18,
            backoff: Backoff::Fixed {
                delay: Duration::from_secs(10),
            },
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::Fixed {
                delay: Duration::ZERO,
            },
        }
    }

    pub fn exponential(max_attempts: u32, initial: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Exponential {
                initial,
                max: initial.saturating_mul(64),
                multiplier: 2.0,
                jitter: true,
            },
        }
    }

    /// Upper bound of the delay after failed attempt `attempt` (1-based)
    pub fn max_delay_after(&self, attempt: u32) -> Duration {
        match &self.backoff {
            Backoff::Fixed { delay } => *delay,
            Backoff::Exponential {
                initial,
                max,
                multiplier,
                ..
            } => {
                let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
                let secs = initial.as_secs_f64() * multiplier.powi(exp);
                if !secs.is_finite() || secs >= max.as_secs_f64() {
                    *max
                } else {
                    Duration::from_secs_f64(secs.max(0.0))
                }
            }
        }
    }

    fn delay_after(&self, attempt: u32) -> Duration {
        let bound = self.max_delay_after(attempt);
        match &self.backoff {
            Backoff::Exponential { jitter: true, .. } if !bound.is_zero() => {
                let millis = bound.as_millis().min(u64::MAX as u128) as u64;
                Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
            }
            _ => bound,
        }
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// attempt ceiling is reached. The last error is returned.
    pub async fn retry<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    let delay = self.delay_after(attempt);
                    tracing::debug!(
                        label,
                        attempt,
                        max_attempts,
                        ?delay,
                        error = %err,
                        "retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    tracing::warn!(
                        label,
                        attempt,
                        error = %err,
                        "giving up"
                    );
                    return Err(err);
                }
            }
        }
    }
}
