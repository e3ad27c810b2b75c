use serde::{Deserialize, Serialize};
use skilldeck_config::EngineConfig;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::definition::RetrySettings;

/// Attempt limit and inter-attempt delay for retryable step failures.
///
/// Only `rate_limit` and `transient` errors are retried. The wait before
/// attempt `n + 1` is `delay * backoff_factor^(n - 1)`, capped at
/// `max_delay`, and never shorter than a server-supplied retry-after.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    pub delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            delay: Duration::from_millis(config.retry_delay_ms),
            backoff_factor: config.backoff_factor,
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            delay: Duration::ZERO,
            backoff_factor: 1.0,
            max_delay: Duration::ZERO,
        }
    }

    /// Apply a partial override on top of this policy.
    pub fn overlay(&self, settings: Option<&RetrySettings>) -> Self {
        let Some(s) = settings else {
            return self.clone();
        };
        Self {
            max_attempts: s.max_attempts.unwrap_or(self.max_attempts).max(1),
            delay: s.delay_ms.map(Duration::from_millis).unwrap_or(self.delay),
            backoff_factor: s.backoff_factor.unwrap_or(self.backoff_factor),
            max_delay: s.max_delay_ms.map(Duration::from_millis).unwrap_or(self.max_delay),
        }
    }

    /// Wait after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let factor = self.backoff_factor.max(0.0).powi(exponent);
        let delay = self.delay.mul_f64(factor.min(1e9));
        if self.max_delay > Duration::ZERO {
            delay.min(self.max_delay)
        } else {
            delay
        }
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// Returns the final result and the number of attempts made. A cancelled
    /// token stops the loop during the wait and returns the last error.
    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> (skilldeck_core::Result<T>, u32)
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = skilldeck_core::Result<T>>,
    {
        let mut attempt = 1;
        loop {
            let err = match op(attempt).await {
                Ok(value) => return (Ok(value), attempt),
                Err(e) => e,
            };

            if !err.is_retryable() || attempt >= self.max_attempts {
                return (Err(err), attempt);
            }

            let wait = match err.retry_after() {
                Some(after) => after.max(self.delay_for(attempt)),
                None => self.delay_for(attempt),
            };
            warn!(
                attempt,
                max_attempts = self.max_attempts,
                kind = %err.kind(),
                wait_ms = wait.as_millis() as u64,
                error = %err,
                "retryable failure, backing off"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(attempt, "retry wait cancelled");
                    return (Err(err), attempt);
                }
                _ = tokio::time::sleep(wait) => {}
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skilldeck_core::SkillError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            delay: Duration::from_millis(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_millis(5),
        }
    }

    #[test]
    fn delay_grows_and_caps() {
        let p = RetryPolicy {
            max_attempts: 5,
            delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            max_delay: Duration::from_millis(300),
        };
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(300));
        assert_eq!(p.delay_for(30), Duration::from_millis(300));
    }

    #[test]
    fn overlay_merges_fields() {
        let base = RetryPolicy::default();
        let p = base.overlay(Some(&RetrySettings {
            max_attempts: Some(0),
            delay_ms: Some(10),
            ..Default::default()
        }));
        assert_eq!(p.max_attempts, 1);
        assert_eq!(p.delay, Duration::from_millis(10));
        assert_eq!(p.backoff_factor, base.backoff_factor);
        assert_eq!(base.overlay(None), base);
    }

    #[tokio::test]
    async fn transient_retried_until_success() {
        let calls = AtomicU32::new(0);
        let (result, attempts) = fast(3)
            .run(&CancellationToken::new(), |_| async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(SkillError::Transient("503".into()))
                } else {
                    Ok("ok")
                }
            })
            .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn fatal_not_retried() {
        let calls = AtomicU32::new(0);
        let (result, attempts) = fast(5)
            .run(&CancellationToken::new(), |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(SkillError::Fatal("not found".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn attempts_exhausted() {
        let (result, attempts) = fast(2)
            .run(&CancellationToken::new(), |_| async {
                Err::<(), _>(SkillError::RateLimited {
                    message: "429".into(),
                    retry_after_secs: 0,
                })
            })
            .await;
        assert_eq!(result.unwrap_err().kind(), skilldeck_core::ErrorKind::RateLimit);
        assert_eq!(attempts, 2);
    }

    #[tokio::test]
    async fn cancel_stops_waiting() {
        let policy = RetryPolicy {
            max_attempts: 3,
            delay: Duration::from_secs(60),
            backoff_factor: 1.0,
            max_delay: Duration::ZERO,
        };
        let token = CancellationToken::new();
        token.cancel();
        let (result, attempts) = policy
            .run(&token, |_| async { Err::<(), _>(SkillError::Transient("x".into())) })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts, 1);
    }
}
