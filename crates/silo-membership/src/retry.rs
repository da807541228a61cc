//! Time-bounded retries for table writes.
//!
//! A membership write either wins its compare-and-swap (`Ok(true)`), loses
//! it to a concurrent writer (`Ok(false)`), or fails (`Err`). Lost races and
//! transient failures are retried with separate backoffs until the time
//! budget runs out. Fatal errors end the loop at once.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{MembershipConfig, MembershipError, Result};

const CONTENTION_MIN_BACKOFF: Duration = Duration::from_millis(100);
const BACKOFF_STEP: Duration = Duration::from_millis(1000);

/// Randomized exponential backoff.
///
/// Attempt `n` sleeps a random duration in
/// `[min, min(max, min + step * 2^n)]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    pub min: Duration,
    pub max: Duration,
    pub step: Duration,
}

impl ExponentialBackoff {
    pub fn new(min: Duration, max: Duration, step: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            step,
        }
    }

    /// Backoff after losing a write race.
    pub fn contention(config: &MembershipConfig) -> Self {
        Self::new(CONTENTION_MIN_BACKOFF, Self::ceiling(config), BACKOFF_STEP)
    }

    /// Backoff after a failed table call.
    pub fn error(config: &MembershipConfig) -> Self {
        Self::new(config.connection_retry_delay, Self::ceiling(config), BACKOFF_STEP)
    }

    fn ceiling(config: &MembershipConfig) -> Duration {
        let scaled = BACKOFF_STEP.saturating_mul(config.expected_cluster_size as u32);
        scaled.max(config.connection_retry_delay.saturating_mul(2))
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn next(&self, attempt: u32) -> Duration {
        let growth = self.step.saturating_mul(1u32 << attempt.min(16));
        let upper = self.min.saturating_add(growth).min(self.max);
        if upper <= self.min {
            return self.min;
        }
        let spread = (upper - self.min).as_millis() as u64;
        self.min + Duration::from_millis(rand::rng().random_range(0..=spread))
    }
}

/// Runs `attempt` until it reports success, a fatal error occurs, or
/// `max_time` has elapsed.
///
/// The closure gets the attempt number, starting at 0. Exhausting the
/// budget on lost races yields [`MembershipError::Contention`]; on errors,
/// [`MembershipError::RetriesExhausted`] wrapping the last one.
pub async fn execute_with_retries<F, Fut>(
    op: &'static str,
    max_time: Duration,
    contention_backoff: ExponentialBackoff,
    error_backoff: ExponentialBackoff,
    mut attempt: F,
) -> Result<()>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let started = Instant::now();
    let mut counter = 0u32;
    loop {
        let outcome = attempt(counter).await;
        counter += 1;
        let delay = match outcome {
            Ok(true) => return Ok(()),
            Ok(false) => {
                if started.elapsed() >= max_time {
                    return Err(MembershipError::Contention {
                        op,
                        attempts: counter,
                        elapsed: started.elapsed(),
                    });
                }
                debug!("{op}: lost write race on attempt {counter}, retrying");
                contention_backoff.next(counter - 1)
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                if started.elapsed() >= max_time {
                    return Err(MembershipError::RetriesExhausted {
                        op,
                        attempts: counter,
                        source: Box::new(e),
                    });
                }
                warn!("{op}: attempt {counter} failed: {e}");
                error_backoff.next(counter - 1)
            }
        };
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn quick() -> ExponentialBackoff {
        ExponentialBackoff::new(
            Duration::from_millis(10),
            Duration::from_millis(50),
            Duration::from_millis(10),
        )
    }

    #[test]
    fn backoff_stays_in_bounds() {
        let b = quick();
        for attempt in 0..40 {
            let d = b.next(attempt);
            assert!(d >= b.min && d <= b.max, "attempt {attempt}: {d:?}");
        }
    }

    #[test]
    fn ceiling_scales_with_cluster_size() {
        let cfg = MembershipConfig {
            expected_cluster_size: 5,
            connection_retry_delay: Duration::from_secs(1),
            ..Default::default()
        };
        assert_eq!(ExponentialBackoff::error(&cfg).max, Duration::from_secs(5));
        assert_eq!(ExponentialBackoff::contention(&cfg).min, CONTENTION_MIN_BACKOFF);

        let slow = MembershipConfig {
            expected_cluster_size: 1,
            connection_retry_delay: Duration::from_secs(3),
            ..Default::default()
        };
        assert_eq!(ExponentialBackoff::error(&slow).max, Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_lost_races_until_success() {
        let calls = AtomicU32::new(0);
        execute_with_retries("test", Duration::from_secs(60), quick(), quick(), |n| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(n == 3) }
        })
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried() {
        execute_with_retries("test", Duration::from_secs(60), quick(), quick(), |n| async move {
            if n < 2 {
                Err(MembershipError::table("unavailable"))
            } else {
                Ok(true)
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn contention_budget_exhausted() {
        let err = execute_with_retries("write", Duration::from_secs(1), quick(), quick(), |_| async {
            Ok(false)
        })
        .await
        .unwrap_err();
        match err {
            MembershipError::Contention { op, attempts, elapsed } => {
                assert_eq!(op, "write");
                assert!(attempts > 1);
                assert!(elapsed >= Duration::from_secs(1));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn error_budget_exhausted_keeps_last_error() {
        let err = execute_with_retries("write", Duration::from_secs(1), quick(), quick(), |_| async {
            Err(MembershipError::table("down"))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, MembershipError::RetriesExhausted { .. }));
        assert!(err.to_string().contains("down"));
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_stops_immediately() {
        let calls = AtomicU32::new(0);
        let err = execute_with_retries("write", Duration::from_secs(60), quick(), quick(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(MembershipError::Protocol("bug".into())) }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, MembershipError::Protocol(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
