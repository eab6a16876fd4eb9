use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::error::{display_error, is_transient};
use crate::time::{Sleeper, TokioSleeper};

/// Retries a single flaky operation inside a job handler, sleeping an
/// exponentially growing, jittered delay between attempts.
///
/// This is independent of queue-level retries: the whole job is only
/// re-queued once the operation has failed `max_retries + 1` times here.
pub struct Backoff {
    config: BackoffConfig,
    sleeper: Arc<dyn Sleeper>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self::with_sleeper(config, Arc::new(TokioSleeper::default()))
    }

    pub fn with_sleeper(config: BackoffConfig, sleeper: Arc<dyn Sleeper>) -> Self {
        Self { config, sleeper }
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Retries on any error.
    pub async fn retry<T, E, F, Fut>(&self, name: &str, op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display + 'static,
    {
        self.retry_when(name, op, |_| true).await
    }

    /// Retries only errors that carry a [`crate::error::TransientIoError`];
    /// anything else is returned on the first occurrence.
    pub async fn retry_transient<T, F, Fut>(&self, name: &str, op: F) -> anyhow::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.retry_when(name, op, is_transient).await
    }

    /// Retries errors for which `should_retry` returns true, up to
    /// `max_retries` times. The last error is returned once retries are
    /// exhausted.
    pub async fn retry_when<T, E, F, Fut, P>(
        &self,
        name: &str,
        mut op: F,
        should_retry: P,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display + 'static,
        P: Fn(&E) -> bool,
    {
        let mut failures = 0;
        loop {
            let error = match op().await {
                Ok(value) => {
                    if failures > 0 {
                        tracing::debug!("'{name}' succeeded after {failures} retries");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };
            failures += 1;
            if failures > self.config.max_retries || !should_retry(&error) {
                return Err(error);
            }
            let delay = self.config.jittered(self.config.raw_delay(failures), unit_jitter());
            tracing::warn!(
                "'{name}' failed (attempt {failures} of {}), retrying in {delay:?}: {}",
                self.config.max_retries + 1,
                display_error(&error)
            );
            self.sleeper.sleep(delay).await;
        }
    }
}

/// Uniform sample from [-1, 1]. The thread-local rng is not held across
/// await points.
fn unit_jitter() -> f64 {
    rand::rng().random_range(-1.0..=1.0)
}

#[derive(Clone, Debug, PartialEq)]
pub struct BackoffConfig {
    /// How many times to retry after the first failure.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound of the un-jittered delay.
    pub max_delay: Duration,
    /// Fraction of the delay by which it may randomly grow or shrink.
    pub jitter_factor: f64,
}

impl BackoffConfig {
    /// Un-jittered delay after the `failure`th failure (1-based):
    /// `min(base_delay * 2^(failure-1), max_delay)`.
    pub fn raw_delay(&self, failure: u32) -> Duration {
        let exponent = failure.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1 << exponent)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Applies `delay * jitter_factor * unit` to `delay`, where `unit` is in
    /// [-1, 1] and `jitter_factor` in [0, 1], never going below zero.
    /// Out-of-range inputs are clamped and NaN counts as zero.
    pub fn jittered(&self, delay: Duration, unit: f64) -> Duration {
        let factor = clamp_or_zero(self.jitter_factor, 0.0, 1.0);
        let unit = clamp_or_zero(unit, -1.0, 1.0);
        let jitter = delay.as_secs_f64() * factor * unit;
        Duration::try_from_secs_f64((delay.as_secs_f64() + jitter).max(0.0))
            .unwrap_or(Duration::MAX)
    }
}

fn clamp_or_zero(value: f64, min: f64, max: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(min, max)
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(8000),
            jitter_factor: 0.1,
        }
    }
}
