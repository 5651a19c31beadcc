//! Bounded retry for model invocations.
//!
//! Each attempt runs under its own timeout. Only transient failures are
//! retried (see [`InvocationError::is_transient`]); everything else returns
//! immediately.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::config::ConfigError;
use crate::error::InvocationError;

/// Exponential backoff with a cap and a fixed attempt budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    /// Per-attempt timeout.
    pub attempt_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 10_000,
            multiplier: 2.0,
            attempt_timeout_ms: 300_000,
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_backoff(mut self, initial_ms: u64, max_ms: u64) -> Self {
        self.initial_backoff_ms = initial_ms;
        self.max_backoff_ms = max_ms;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "retry.max_attempts must be greater than 0".to_string(),
            ));
        }
        if self.attempt_timeout_ms == 0 {
            return Err(ConfigError::ValidationFailed(
                "retry.attempt_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.multiplier < 1.0 {
            return Err(ConfigError::ValidationFailed(
                "retry.multiplier must be at least 1.0".to_string(),
            ));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(ConfigError::ValidationFailed(
                "retry.initial_backoff_ms cannot exceed retry.max_backoff_ms".to_string(),
            ));
        }
        Ok(())
    }

    /// Delay before the attempt following failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let delay = self.initial_backoff_ms as f64 * self.multiplier.powi(exponent);
        let capped = delay.min(self.max_backoff_ms as f64);
        Duration::from_millis(capped as u64)
    }

    /// Runs `op` until it succeeds, fails permanently, or attempts run out.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, InvocationError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, InvocationError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let timeout = Duration::from_millis(self.attempt_timeout_ms);

        let mut attempt = 1;
        loop {
            let err = match tokio::time::timeout(timeout, op()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) => err,
                Err(_) => InvocationError::Timeout {
                    millis: self.attempt_timeout_ms,
                },
            };

            if !err.is_transient() || attempt >= max_attempts {
                if attempt > 1 {
                    tracing::warn!(
                        operation = label,
                        attempts = attempt,
                        error = %err,
                        "Giving up after retries"
                    );
                }
                return Err(err);
            }

            let delay = self.delay_for(attempt);
            tracing::warn!(
                operation = label,
                attempt = attempt,
                max_attempts = max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient error, will retry"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
