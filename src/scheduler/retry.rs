//! Fixed-sequence backoff for failed runs.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::Error;

/// Backoff sequence applied to failed runs.
///
/// With delays `[30s, 120s, 300s]` a run gets four attempts: the initial one
/// plus one retry after each delay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    delays: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(vec![
            Duration::from_secs(30),
            Duration::from_secs(120),
            Duration::from_secs(300),
        ])
    }
}

impl RetryPolicy {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    /// Policy that never retries.
    pub fn none() -> Self {
        Self::new(Vec::new())
    }

    /// Total attempts including the first.
    pub fn max_attempts(&self) -> u32 {
        u32::try_from(self.delays.len()).unwrap_or(u32::MAX - 1) + 1
    }

    /// Delay to wait after `failed_attempts` failures, or `None` when the
    /// policy is exhausted.
    pub fn delay_after(&self, failed_attempts: u32) -> Option<Duration> {
        let idx = usize::try_from(failed_attempts.checked_sub(1)?).ok()?;
        self.delays.get(idx).copied()
    }

    /// Decide what to do after a failure. Non-retryable errors are final.
    pub fn next_delay(&self, failed_attempts: u32, err: &Error) -> Option<Duration> {
        if !err.is_retryable() {
            return None;
        }
        self.delay_after(failed_attempts)
    }

    /// Run `op` in-process until it succeeds, fails permanently, or the
    /// policy is exhausted. Returns the last error with the attempt count.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, (Error, u32)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => match self.next_delay(attempts, &err) {
                    Some(delay) => {
                        warn!(
                            run = label,
                            attempt = attempts,
                            max_attempts = self.max_attempts(),
                            delay_secs = delay.as_secs(),
                            error = %err,
                            "Retrying after transient failure"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err((err, attempts)),
                },
            }
        }
    }
}
