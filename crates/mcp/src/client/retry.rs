//! Fixed-interval retry policy.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// The first attempt plus up to `retries` more, `interval` apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    retries: u32,
    interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(5))
    }
}

impl RetryPolicy {
    pub fn new(retries: u32, interval: Duration) -> Self {
        Self { retries, interval }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Total number of attempts, the first one included.
    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// Run `operation` until it succeeds, fails with an error `should_retry` rejects, or the
    /// attempts are exhausted. Returns the last outcome and the number of attempts made.
    pub async fn run<T, E, F, Fut>(&self, mut operation: F, should_retry: impl Fn(&E) -> bool) -> (Result<T, E>, u32)
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.max_attempts();
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => return (Ok(value), attempt),
                Err(error) if attempt < max_attempts && should_retry(&error) => {
                    debug!("attempt {attempt}/{max_attempts} failed, retrying in {:?}", self.interval);
                    tokio::time::sleep(self.interval).await;
                    attempt += 1;
                }
                Err(error) => return (Err(error), attempt),
            }
        }
    }
}
