//! Timeout and bounded exponential backoff around single gateway calls.

use std::future::Future;
use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use tracing::{error, warn};

use crate::error::GatewayError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Deadline for one attempt
    pub call_timeout: Duration,
    /// Attempts including the first
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(10),
            max_attempts: 4,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_backoff)
            .with_multiplier(2.0)
            .with_randomization_factor(0.1)
            .with_max_interval(self.max_backoff)
            .with_max_elapsed_time(None)
            .build()
    }

    /// Run `op` until it succeeds, fails fatally, or uses up its attempts.
    /// Each attempt is cut off at `call_timeout`.
    pub async fn run<T, F, Fut>(&self, op_name: &str, mut op: F) -> Result<T, GatewayError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let call_timeout = self.call_timeout;
        let mut attempt = 0u32;

        backoff::future::retry(self.backoff(), || {
            attempt += 1;
            let n = attempt;
            let call = op();
            async move {
                let result = match tokio::time::timeout(call_timeout, call).await {
                    Ok(result) => result,
                    Err(_) => Err(GatewayError::Timeout(call_timeout)),
                };

                match result {
                    Ok(value) => Ok(value),
                    Err(e) if e.is_fatal() => {
                        error!(op = op_name, error = %e, "gateway call failed fatally");
                        Err(backoff::Error::permanent(e))
                    }
                    Err(e) if !e.is_retryable() => {
                        warn!(op = op_name, error = %e, "gateway call refused, not retrying");
                        Err(backoff::Error::permanent(e))
                    }
                    Err(e) if n >= max_attempts => {
                        warn!(op = op_name, attempts = n, error = %e, "gateway retries exhausted");
                        Err(backoff::Error::permanent(e))
                    }
                    Err(e) => {
                        warn!(op = op_name, attempt = n, error = %e, "gateway call failed, retrying");
                        Err(backoff::Error::transient(e))
                    }
                }
            }
        })
        .await
    }
}
