//! Backoff between attempts of a conflicting check-mutate-commit sequence

use backon::{ExponentialBuilder, Retryable};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::warn;

use super::context::OperationContext;
use crate::config::QuotaConfig;
use crate::error::{QuotaError, Result};

/// Default bound of the check-mutate-commit retry loop
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// How often, and how patiently, a conflicting sequence is run again.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Upper bound of any single delay
    pub max_backoff: Duration,
    pub multiplier: f32,
    /// Randomize delays so racing writers spread out
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RETRIES,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(500),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Policy from the `[quota]` section; jitter is always on
    pub fn from_config(config: &QuotaConfig) -> Self {
        Self {
            max_attempts: config.max_retries.max(1),
            initial_backoff: Duration::from_millis(config.retry_initial_backoff_ms),
            max_backoff: Duration::from_millis(config.retry_max_backoff_ms),
            multiplier: config.retry_multiplier,
            jitter: true,
        }
    }

    /// Retry immediately; for tests that race on purpose.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1.0,
            jitter: false,
        }
    }

    fn backoff(&self) -> ExponentialBuilder {
        // backon counts retries, not attempts
        let builder = ExponentialBuilder::default()
            .with_min_delay(self.initial_backoff)
            .with_max_delay(self.max_backoff)
            .with_factor(self.multiplier)
            .with_max_times(self.max_attempts.saturating_sub(1) as usize);

        if self.jitter {
            builder.with_jitter()
        } else {
            builder
        }
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// uses up `policy.max_attempts`. Cancelling `ctx` interrupts both an attempt
/// in flight and the delay between attempts.
///
/// Exhausted conflicts surface as [`QuotaError::RetriesExhausted`].
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    ctx: &OperationContext,
    what: &str,
    operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let retries = AtomicU32::new(0);

    let attempts = operation
        .retry(policy.backoff())
        .sleep(tokio::time::sleep)
        .when(QuotaError::is_retryable)
        .notify(|err: &QuotaError, delay: Duration| {
            let retry = retries.fetch_add(1, Ordering::SeqCst) + 1;
            warn!(
                "{} for {} conflicted (attempt {}/{}), retrying in {}ms: {}",
                what,
                ctx.user_id(),
                retry,
                policy.max_attempts,
                delay.as_millis(),
                err
            );
        });

    match ctx.guard(attempts).await {
        Err(err) if err.is_retryable() => {
            let attempts = retries.load(Ordering::SeqCst) + 1;
            warn!(
                "Giving up on {} for {} after {} attempts",
                what,
                ctx.user_id(),
                attempts
            );
            Err(QuotaError::RetriesExhausted {
                user_id: ctx.user_id().to_string(),
                attempts,
            })
        }
        result => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conflict() -> QuotaError {
        QuotaError::ConcurrencyConflict {
            user_id: "u1".to_string(),
            expected_version: 1,
        }
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let ctx = OperationContext::new("u1");
        let calls = AtomicU32::new(0);

        let result = with_retry(&RetryPolicy::immediate(3), &ctx, "write", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                return Err(conflict());
            }
            Ok(7)
        })
        .await
        .unwrap();

        assert_eq!(result, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_conflicts_report_attempts() {
        let ctx = OperationContext::new("u1");
        let calls = AtomicU32::new(0);

        let err = with_retry(&RetryPolicy::immediate(4), &ctx, "write", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(conflict())
        })
        .await
        .unwrap_err();

        assert!(matches!(err, QuotaError::RetriesExhausted { attempts: 4, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let ctx = OperationContext::new("u1");
        let calls = AtomicU32::new(0);

        let err = with_retry(&RetryPolicy::immediate(3), &ctx, "write", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(QuotaError::InvalidSize(-1))
        })
        .await
        .unwrap_err();

        assert!(matches!(err, QuotaError::InvalidSize(-1)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_backoff() {
        let ctx = OperationContext::new("u1");
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(60),
            max_backoff: Duration::from_secs(60),
            multiplier: 1.0,
            jitter: false,
        };

        let cancel = ctx.cancellation().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let err = with_retry(&policy, &ctx, "write", || async { Err::<(), _>(conflict()) })
            .await
            .unwrap_err();
        assert!(matches!(err, QuotaError::Cancelled));
    }

    #[test]
    fn test_policy_from_config() {
        let config = QuotaConfig {
            max_retries: 5,
            retry_initial_backoff_ms: 20,
            retry_max_backoff_ms: 800,
            ..Default::default()
        };

        let policy = RetryPolicy::from_config(&config);
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_backoff, Duration::from_millis(20));
        assert_eq!(policy.max_backoff, Duration::from_millis(800));
        assert!(policy.jitter);
    }
}
