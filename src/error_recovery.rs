//! Retry policies for transient device faults.
//
// Acquisition workers and one-shot calibration reads share the same policy so
// that a flaky spectrometer is treated identically no matter who drives it.

use crate::error::DaqError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tracing::warn;

/// Defines a policy for retrying an operation after a transient fault.
///
/// Specifies how many times to retry a failed operation and how long to wait
/// between attempts. The delay grows by `backoff_multiplier` after every attempt
/// and never exceeds `max_backoff`.
///
/// # Example
///
/// ```rust
/// use spectro_daq::error_recovery::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy {
///     max_attempts: 5,
///     backoff_delay: Duration::from_millis(200),
///     backoff_multiplier: 2.0,
///     max_backoff: Duration::from_secs(2),
/// };
/// assert_eq!(policy.delay_for(2), Duration::from_millis(400));
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// The maximum number of retry attempts.
    ///
    /// Total attempts will be max_attempts (not including the initial try).
    /// Set to 0 to disable retries.
    pub max_attempts: u32,

    /// Delay before the first retry.
    pub backoff_delay: Duration,

    /// Growth factor applied to the delay after each failed retry.
    pub backoff_multiplier: f64,

    /// Upper bound on any single delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    /// Default policy attempts 3 retries starting at 100ms, doubling up to 1s.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    /// Constant-delay policy, mostly useful in tests.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff_delay: delay,
            backoff_multiplier: 1.0,
            max_backoff: delay,
        }
    }

    /// Delay to wait before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let cap = self.max_backoff.max(self.backoff_delay);
        let factor = self.backoff_multiplier.max(1.0).powi(exponent);
        // powi overflows to inf long before u32::MAX attempts
        Duration::try_from_secs_f64(self.backoff_delay.as_secs_f64() * factor)
            .map_or(cap, |delay| delay.min(cap))
    }

    /// Whether another retry is allowed after `failures` consecutive faults.
    pub fn allows_retry(&self, failures: u32) -> bool {
        failures <= self.max_attempts
    }
}

/// Sleep for `duration` unless `cancel` flips to `true` first.
///
/// Returns `Err(DaqError::Cancelled)` when interrupted.
pub async fn cancellable_sleep(
    duration: Duration,
    cancel: &mut watch::Receiver<bool>,
) -> Result<(), DaqError> {
    if *cancel.borrow() {
        return Err(DaqError::Cancelled);
    }
    let sleep = tokio::time::sleep(duration);
    tokio::pin!(sleep);
    let cancelled = tokio::select! {
        _ = &mut sleep => return Ok(()),
        changed = cancel.wait_for(|stop| *stop) => changed.is_ok(),
    };
    if cancelled {
        return Err(DaqError::Cancelled);
    }
    // Sender dropped: nobody can cancel any more, finish the sleep.
    sleep.await;
    Ok(())
}

/// Run `op` and retry it on transient errors according to `policy`.
///
/// Non-transient errors are returned immediately. Cancellation during a backoff
/// returns `DaqError::Cancelled`.
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &mut watch::Receiver<bool>,
    label: &str,
    mut op: F,
) -> Result<T, DaqError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DaqError>>,
{
    let mut failures = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() => {
                failures += 1;
                if !policy.allows_retry(failures) {
                    return Err(err);
                }
                let delay = policy.delay_for(failures);
                warn!(operation = %label, attempt = failures, ?delay, error = %err, "Transient fault, retrying");
                cancellable_sleep(delay, cancel).await?;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_grows_and_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            backoff_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
        assert_eq!(policy.delay_for(8), Duration::from_millis(350));
    }

    #[test]
    fn retry_bound_counts_initial_failure() {
        let policy = RetryPolicy::fixed(2, Duration::from_millis(1));
        assert!(policy.allows_retry(1));
        assert!(policy.allows_retry(2));
        assert!(!policy.allows_retry(3));
        assert!(!RetryPolicy::no_retry().allows_retry(1));
    }

    #[test]
    fn delay_saturates_at_max_backoff_for_huge_attempts() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(80), policy.max_backoff);
        assert_eq!(policy.delay_for(u32::MAX), policy.max_backoff);

        let runaway = RetryPolicy {
            backoff_multiplier: f64::INFINITY,
            ..RetryPolicy::default()
        };
        assert_eq!(runaway.delay_for(3), runaway.max_backoff);
    }

    #[tokio::test]
    async fn retry_succeeds_after_transient_faults() {
        let calls = AtomicU32::new(0);
        let (_tx, mut rx) = watch::channel(false);
        let policy = RetryPolicy::fixed(3, Duration::from_millis(1));

        let result = retry_transient(&policy, &mut rx, "read", || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(DaqError::device_fault("spectro1", "timeout"))
            } else {
                Ok(n)
            }
        })
        .await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_gives_up_after_bound() {
        let calls = AtomicU32::new(0);
        let (_tx, mut rx) = watch::channel(false);
        let policy = RetryPolicy::fixed(2, Duration::from_millis(1));

        let result: Result<(), _> = retry_transient(&policy, &mut rx, "read", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(DaqError::device_fault("spectro1", "timeout"))
        })
        .await;

        assert!(matches!(result, Err(DaqError::DeviceFault { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let (_tx, mut rx) = watch::channel(false);
        let policy = RetryPolicy::fixed(5, Duration::from_millis(1));

        let result: Result<(), _> = retry_transient(&policy, &mut rx, "read", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(DaqError::NotConnected("spectro1".into()))
        })
        .await;

        assert!(matches!(result, Err(DaqError::NotConnected(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sleep_is_interrupted_by_cancel() {
        let (tx, mut rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            cancellable_sleep(Duration::from_secs(30), &mut rx).await
        });
        tx.send(true).ok();
        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sleep was not interrupted")
            .expect("task panicked");
        assert_eq!(result, Err(DaqError::Cancelled));
    }
}
