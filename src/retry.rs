//! Bounded retry with configurable backoff
//!
//! Shared by the Lister (per page) and the Enricher (per item). Only errors
//! that report themselves as retryable are retried; everything else, notably
//! authentication failures, is returned on the first attempt.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Errors that know whether another attempt could succeed
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Retry configuration with backoff strategies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts, including the first one
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    #[serde(default)]
    pub backoff: BackoffStrategy,

    #[serde(default = "default_initial_delay", with = "humantime_serde")]
    pub initial_delay: Duration,

    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,

    #[serde(default = "default_true")]
    pub jitter: bool,

    /// Jitter factor (0.0 to 1.0)
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

fn default_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_true() -> bool {
    true
}

fn default_jitter_factor() -> f64 {
    0.25
}

fn default_exponential_base() -> f64 {
    2.0
}

impl RetryConfig {
    /// Reject settings that cannot produce a sensible delay
    pub fn validate(&self) -> Result<(), String> {
        if self.attempts == 0 {
            return Err("attempts must be at least 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(format!(
                "jitter_factor must be between 0.0 and 1.0, got {}",
                self.jitter_factor
            ));
        }
        if let BackoffStrategy::Exponential { base } = self.backoff {
            if !base.is_finite() || base < 1.0 {
                return Err(format!("exponential base must be at least 1.0, got {}", base));
            }
        }
        if self.initial_delay > self.max_delay {
            return Err("initial_delay must not exceed max_delay".to_string());
        }
        Ok(())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            backoff: BackoffStrategy::default(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            jitter: true,
            jitter_factor: default_jitter_factor(),
        }
    }
}

/// Backoff strategies for retry delays
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    Linear {
        #[serde(with = "humantime_serde")]
        increment: Duration,
    },
    Exponential {
        #[serde(default = "default_exponential_base")]
        base: f64,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential {
            base: default_exponential_base(),
        }
    }
}

/// The last error of an operation together with how often it was tried
#[derive(Debug)]
pub struct RetryFailure<E> {
    pub error: E,
    pub attempts: u32,
}

impl<E: fmt::Display> fmt::Display for RetryFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (after {} attempts)", self.error, self.attempts)
    }
}

pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Execute an operation with retry logic
    ///
    /// The closure receives the 1-based attempt number.
    pub async fn execute_with_retry<F, Fut, T, E>(
        &self,
        mut operation: F,
        context: &str,
    ) -> Result<T, RetryFailure<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + fmt::Display,
    {
        let max_attempts = self.config.attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match operation(attempt).await {
                Ok(result) => {
                    if attempt > 1 {
                        debug!("{} succeeded on attempt {}", context, attempt);
                    }
                    return Ok(result);
                }
                Err(error) if !error.is_retryable() || attempt >= max_attempts => {
                    return Err(RetryFailure {
                        error,
                        attempts: attempt,
                    });
                }
                Err(error) => {
                    let delay = self.apply_jitter(self.calculate_delay(attempt));
                    warn!(
                        "Retrying {} (attempt {}/{}) after {:?}: {}",
                        context, attempt, max_attempts, delay, error
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Calculate delay for the given attempt
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_delay = match &self.config.backoff {
            BackoffStrategy::Fixed => self.config.initial_delay,
            BackoffStrategy::Linear { increment } => increment
                .checked_mul(attempt.saturating_sub(1))
                .and_then(|step| self.config.initial_delay.checked_add(step))
                .unwrap_or(self.config.max_delay),
            BackoffStrategy::Exponential { base } => {
                let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
                let seconds = self.config.initial_delay.as_secs_f64() * base.powi(exponent);
                Duration::try_from_secs_f64(seconds).unwrap_or(self.config.max_delay)
            }
        };

        base_delay.min(self.config.max_delay)
    }

    /// Apply jitter to delay
    pub fn apply_jitter(&self, delay: Duration) -> Duration {
        if !self.config.jitter || delay.is_zero() {
            return delay;
        }

        let mut rng = rand::rng();
        let jitter_range = delay.as_secs_f64() * self.config.jitter_factor.clamp(0.0, 1.0);
        let jitter = rng.random_range(-jitter_range / 2.0..=jitter_range / 2.0);
        Duration::try_from_secs_f64((delay.as_secs_f64() + jitter).max(0.0)).unwrap_or(delay)
    }
}
