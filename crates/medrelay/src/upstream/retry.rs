//! Bounded retry around stream acquisition
//!
//! Only the establishment of the upstream stream goes through here. Once
//! an event has been produced the request is past the point of retrying,
//! and later failures surface as terminal error events instead.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{RelayError, Result};

/// Default delay between attempts
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first; never below one
    pub max_attempts: u32,
    /// Fixed pause between attempts
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Run `operation` until it succeeds, fails permanently, or the
    /// attempt budget is spent
    ///
    /// The closure receives the 1-based attempt number. Only
    /// [`RelayError::is_transient`] failures are retried; anything else is
    /// returned immediately.
    pub async fn run<T, F, Fut>(&self, what: &str, mut operation: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) if attempt >= max_attempts => {
                    let detail = match e {
                        RelayError::TransientUpstream(msg) => msg,
                        other => other.to_string(),
                    };
                    return Err(RelayError::TransientUpstream(format!(
                        "{what} failed after {max_attempts} attempts: {detail}"
                    )));
                }
                Err(e) => {
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = self.delay.as_millis() as u64,
                        error = %e,
                        "{what} failed, retrying"
                    );
                    tokio::time::sleep(self.delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
