//! Bounded retry with exponential backoff for recoverable operations.

use std::future::Future;
use std::time::Duration;

/// Backoff schedule for retried operations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay to sleep after a failed attempt (`attempt` counts from 1).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        Duration::from_millis(millis as u64).min(self.max_delay)
    }
}

/// Runs `op` until it succeeds or the policy is exhausted, sleeping the
/// scheduled delay between attempts. Returns the last error on exhaustion.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    "{} failed (attempt {}/{}): {}, retrying in {:?}",
                    label,
                    attempt,
                    policy.max_attempts,
                    err,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                tracing::error!(
                    "{} failed after {} attempts: {}",
                    label,
                    policy.max_attempts,
                    err
                );
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delays_grow_and_cap() {
        let policy = RetryPolicy {
            max_attempts: 6,
            initial_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(500),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy::default();
        let result: Result<u32, &str> = retry(&policy, "op", || {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            async move { if n < 3 { Err("not yet") } else { Ok(n) } }
        })
        .await;
        assert_eq!(result, Ok(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 3,
            ..RetryPolicy::default()
        };
        let result: Result<(), &str> = retry(&policy, "op", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err("still broken") }
        })
        .await;
        assert_eq!(result, Err("still broken"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
