use std::future::Future;
use std::time::{Duration, Instant};

use opencode_client_error::ClientError;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay before retry number `retry` (0 based):
    /// `min(initial * 2^retry, max) * (0.8 + random(0, 0.4))`.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        backoff_delay(
            self.config.initial_delay,
            self.config.max_delay,
            retry,
        )
    }

    /// Runs `op` until it succeeds, fails with a non-retryable kind, or the
    /// attempt/time budget is spent. Non-idempotent operations run once.
    pub async fn execute<T, F, Fut>(
        &self,
        operation: &str,
        idempotent: bool,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, ClientError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let started = Instant::now();
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt: u32 = 1;

        loop {
            if cancel.is_cancelled() {
                return Err(ClientError::Cancelled);
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                result = op() => result,
            };

            let err = match result {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::debug!(operation = operation, attempts = attempt, "retry: succeeded");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !idempotent || !err.is_retryable() {
                return Err(err);
            }
            if attempt >= max_attempts {
                tracing::warn!(
                    operation = operation,
                    attempts = attempt,
                    error = %err,
                    "retry: attempts exhausted"
                );
                return Err(err);
            }

            let delay = self.delay_for_retry(attempt - 1);
            if started.elapsed() + delay > self.config.max_elapsed {
                tracing::warn!(
                    operation = operation,
                    attempts = attempt,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    error = %err,
                    "retry: time budget exhausted"
                );
                return Err(err);
            }

            tracing::debug!(
                operation = operation,
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retry: backing off"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                _ = sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

pub(crate) fn backoff_delay(initial: Duration, max: Duration, retry: u32) -> Duration {
    let initial_ms = initial.as_millis() as u64;
    let base = initial_ms.saturating_mul(1u64 << retry.min(10));
    let capped = base.min(max.as_millis() as u64);
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((capped as f64 * jitter) as u64)
}
