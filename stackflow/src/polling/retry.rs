//! Retry utilities with configurable backoff and jitter strategies.
//!
//! Only errors that report themselves as transient (throttling, timeouts,
//! unavailable endpoints) are retried. Everything else is returned on the
//! first attempt so that a job's own failure is never mistaken for noise.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Errors that can tell whether a retry may succeed.
pub trait Transient {
    /// Returns true if the failed call may succeed when retried.
    fn is_transient(&self) -> bool;
}

impl Transient for crate::errors::StackflowError {
    fn is_transient(&self) -> bool {
        Self::is_transient(self)
    }
}

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = base * 2^attempt
    #[default]
    Exponential,
    /// delay = base * (attempt + 1)
    Linear,
    /// delay = base (constant)
    Constant,
}

/// How much of the computed delay is randomized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// Sleep exactly the computed delay.
    None,
    /// Sleep anywhere in `0..=delay`.
    #[default]
    Full,
    /// Sleep `delay / 2` plus up to another `delay / 2`.
    Equal,
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum retries after the initial attempt.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    /// Base delay between retries in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Backoff strategy.
    #[serde(default)]
    pub backoff_strategy: BackoffStrategy,
    /// Jitter strategy.
    #[serde(default)]
    pub jitter_strategy: JitterStrategy,
}

fn default_max_attempts() -> usize {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_strategy: BackoffStrategy::Exponential,
            jitter_strategy: JitterStrategy::Full,
        }
    }
}

impl RetryConfig {
    /// Creates a new retry config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A config that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self::default().with_max_attempts(0)
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff_strategy = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter_strategy = strategy;
        self
    }
}

impl RetryConfig {
    /// Delay before retry number `retry` (0-based), capped and jittered.
    #[must_use]
    pub fn delay_for(&self, retry: usize) -> Duration {
        let exponent = u32::try_from(retry).unwrap_or(u32::MAX);
        let base = self.base_delay_ms;
        let capped = match self.backoff_strategy {
            BackoffStrategy::Exponential => base.saturating_mul(2u64.saturating_pow(exponent)),
            BackoffStrategy::Linear => base.saturating_mul(u64::from(exponent).saturating_add(1)),
            BackoffStrategy::Constant => base,
        }
        .min(self.max_delay_ms);

        let millis = match self.jitter_strategy {
            JitterStrategy::None => capped,
            JitterStrategy::Full => rand::thread_rng().gen_range(0..=capped),
            JitterStrategy::Equal => {
                let half = capped / 2;
                capped - half + rand::thread_rng().gen_range(0..=half)
            }
        };
        Duration::from_millis(millis)
    }
}

/// Executes an operation, retrying transient errors with backoff.
pub async fn with_retry<T, E, F, Fut>(config: &RetryConfig, key: &str, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display + Transient,
{
    let mut retries = 0;
    loop {
        let error = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) => e,
        };
        if retries >= config.max_attempts {
            tracing::warn!(operation = key, attempts = retries + 1, error = %error, "Retries exhausted");
            return Err(error);
        }

        let delay = config.delay_for(retries);
        retries += 1;
        tracing::debug!(
            operation = key,
            attempt = retries,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %error,
            "Retrying after transient error"
        );
        tokio::time::sleep(delay).await;
    }
}
