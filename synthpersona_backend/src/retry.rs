//! Bounded retry with exponential backoff, shared by every model caller.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;
use crate::llm_client::LlmError;

/// Terminal failure of a retried call
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{error} (after {attempts} attempt(s))")]
pub struct RetryFailure {
    pub attempts: u32,
    pub error: LlmError,
}

impl RetryFailure {
    pub fn is_cancelled(&self) -> bool {
        matches!(self.error, LlmError::Cancelled)
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    multiplier: f64,
    call_timeout: Duration,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        initial_backoff: Duration,
        max_backoff: Duration,
        multiplier: f64,
        call_timeout: Duration,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            max_backoff: max_backoff.max(initial_backoff),
            multiplier: multiplier.max(1.0),
            call_timeout,
        }
    }

    pub fn from_config(config: &RetryConfig, call_timeout: Duration) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.initial_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
            config.multiplier,
            call_timeout,
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.initial_backoff,
            initial_interval: self.initial_backoff,
            randomization_factor: 0.0,
            multiplier: self.multiplier,
            max_interval: self.max_backoff,
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    /// Delays slept between consecutive attempts
    pub fn backoff_schedule(&self) -> Vec<Duration> {
        let mut backoff = self.backoff();
        (1..self.max_attempts)
            .map(|_| backoff.next_backoff().unwrap_or(self.max_backoff))
            .collect()
    }

    /// Run `op` until it succeeds, fails permanently, or runs out of attempts.
    ///
    /// Each attempt is bounded by the call timeout. Cancellation is checked before
    /// every attempt and interrupts a pending backoff sleep; an attempt already in
    /// flight is never interrupted.
    pub async fn call<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        label: &str,
        mut op: F,
    ) -> Result<T, RetryFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LlmError>>,
    {
        let mut backoff = self.backoff();
        let mut attempts = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(RetryFailure {
                    attempts,
                    error: LlmError::Cancelled,
                });
            }

            attempts += 1;
            let outcome = match tokio::time::timeout(self.call_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(LlmError::Timeout(self.call_timeout)),
            };

            let error = match outcome {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !error.is_retryable() || attempts >= self.max_attempts {
                return Err(RetryFailure { attempts, error });
            }

            let delay = backoff.next_backoff().unwrap_or(self.max_backoff);
            tracing::warn!(
                "[retry {}/{}] {}: {}. Retrying in {:.1}s",
                attempts,
                self.max_attempts - 1,
                label,
                error,
                delay.as_secs_f64()
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(RetryFailure {
                        attempts,
                        error: LlmError::Cancelled,
                    });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
