use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Errors that know whether another attempt could succeed.
pub trait Retryable {
    fn is_transient(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: usize,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, 1000, 10000)
    }
}

impl RetryPolicy {
    pub fn new(max_retries: usize, initial_backoff_ms: u64, max_backoff_ms: u64) -> Self {
        Self {
            max_retries,
            initial_backoff: Duration::from_millis(initial_backoff_ms),
            max_backoff: Duration::from_millis(max_backoff_ms),
        }
    }

    /// No retries and no waiting.
    pub fn none() -> Self {
        Self::new(0, 0, 0)
    }

    pub fn max_retries(&self) -> usize {
        self.max_retries
    }

    /// Retry a future with exponential backoff. Non-transient errors are
    /// returned immediately.
    pub async fn retry<F, Fut, T, E>(&self, operation_name: &str, mut f: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display + Retryable,
    {
        let mut attempt = 0;
        let mut backoff = self.initial_backoff;

        loop {
            match f().await {
                Ok(result) => {
                    if attempt > 0 {
                        info!(
                            operation = operation_name,
                            attempts = attempt + 1,
                            "Operation succeeded after retries"
                        );
                    }
                    return Ok(result);
                }
                Err(e) => {
                    attempt += 1;
                    if !e.is_transient() {
                        warn!(
                            operation = operation_name,
                            attempts = attempt,
                            error = %e,
                            "Operation failed permanently"
                        );
                        return Err(e);
                    }
                    if attempt > self.max_retries {
                        warn!(
                            operation = operation_name,
                            attempts = attempt,
                            error = %e,
                            "Operation failed after max retries"
                        );
                        return Err(e);
                    }

                    let wait = self.with_jitter(backoff);
                    warn!(
                        operation = operation_name,
                        attempt = attempt,
                        max_retries = self.max_retries,
                        backoff_ms = wait.as_millis() as u64,
                        error = %e,
                        "Operation failed, retrying"
                    );

                    sleep(wait).await;

                    backoff = std::cmp::min(backoff * 2, self.max_backoff);
                }
            }
        }
    }

    /// Up to 25% extra so concurrent workers do not retry in lockstep.
    fn with_jitter(&self, backoff: Duration) -> Duration {
        let spread = backoff.as_millis() as u64 / 4;
        if spread == 0 {
            return backoff;
        }
        backoff + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
    }
}
