//! Exponential backoff curves
//!
//! One [`RetryConfig`] describes a delay curve. The consumer indexes it by
//! delivery count for naks and by consecutive failures for fetch pauses; the
//! NATS client uses it as its reconnect delay; one-shot operations such as
//! the CLI publish go through [`retry_with_backoff`].

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Exponential delay curve with an attempt budget
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Attempts [`retry_with_backoff`] makes, the first one included
    pub max_attempts: u32,
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Ceiling before jitter
    pub max_delay: Duration,
    /// Growth factor per failure
    pub backoff_multiplier: f64,
    /// Add up to 25% random jitter
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Default curve
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the attempt budget
    #[must_use]
    pub fn with_max_attempts(self, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..self
        }
    }

    /// Set the first delay
    #[must_use]
    pub fn with_initial_delay(self, initial_delay: Duration) -> Self {
        Self {
            initial_delay,
            ..self
        }
    }

    /// Set the ceiling
    #[must_use]
    pub fn with_max_delay(self, max_delay: Duration) -> Self {
        Self { max_delay, ..self }
    }

    /// Set the growth factor
    #[must_use]
    pub fn with_backoff_multiplier(self, backoff_multiplier: f64) -> Self {
        Self {
            backoff_multiplier,
            ..self
        }
    }

    /// Toggle jitter
    #[must_use]
    pub fn with_jitter(self, jitter: bool) -> Self {
        Self { jitter, ..self }
    }

    /// Delay after the `failures`-th failure (1-based; 0 is treated as 1).
    ///
    /// With jitter the result may exceed `max_delay` by up to a quarter.
    #[must_use]
    pub fn delay_for_attempt(&self, failures: u32) -> Duration {
        if self.initial_delay.is_zero() {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(failures.saturating_sub(1)).unwrap_or(i32::MAX);
        let ceiling = self.max_delay.as_secs_f64();
        let secs = (self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent))
            .min(ceiling);
        let base = Duration::from_secs_f64(if secs.is_finite() { secs } else { ceiling });

        let quarter = base / 4;
        if self.jitter && !quarter.is_zero() {
            base + rand::thread_rng().gen_range(Duration::ZERO..quarter)
        } else {
            base
        }
    }
}

/// Run `operation` until it succeeds, returns an error `is_retryable`
/// rejects, or `max_attempts` is used up. The last error is returned.
pub async fn retry_with_backoff<T, E, F, Fut, R>(
    config: &RetryConfig,
    mut operation: F,
    is_retryable: R,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let budget = config.max_attempts.max(1);
    let mut failures = 0;

    loop {
        let error = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        failures += 1;
        if failures >= budget || !is_retryable(&error) {
            return Err(error);
        }

        let delay = config.delay_for_attempt(failures);
        warn!(
            attempt = failures,
            budget = budget,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %error,
            "Attempt failed, backing off"
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests;
