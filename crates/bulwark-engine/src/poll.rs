//! Cancellable polling with exponential backoff
//!
//! Every wait in the engine (pod readiness, workload scaling, conditions)
//! goes through [`poll_until`], so all of them stop promptly on
//! cancellation and report a deadline distinctly from a cancel.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Delay schedule between polls
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Backoff {
    /// Delay before the second check
    pub initial: Duration,
    /// Upper bound on the delay
    pub max: Duration,
    /// Growth factor applied after every unsuccessful check
    pub factor: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            factor: 1.5,
        }
    }
}

impl Backoff {
    /// Poll at a fixed interval
    pub fn fixed(interval: Duration) -> Self {
        Self {
            initial: interval,
            max: interval,
            factor: 1.0,
        }
    }

    fn next(&self, current: Duration) -> Duration {
        current.mul_f64(self.factor.max(1.0)).min(self.max)
    }
}

/// Outcome of one check
#[derive(Debug)]
pub enum Poll<T> {
    /// Done with this value
    Ready(T),
    /// Not yet; the message, if any, replaces the last error
    Pending(Option<String>),
}

/// Run `check` until it is ready, the deadline passes, or `cancel` fires
///
/// `check` errors end the poll immediately. Soft failures are reported as
/// `Poll::Pending(Some(msg))`; the one from the final check surfaces in the
/// timeout error.
pub async fn poll_until<T, F, Fut>(
    cancel: &CancellationToken,
    timeout: Duration,
    backoff: Backoff,
    what: &str,
    mut check: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Poll<T>>>,
{
    let deadline = Instant::now() + timeout;
    let mut delay = backoff.initial;
    let mut last_error = None;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::cancelled(format!("waiting for {what}")));
        }

        let checked = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::cancelled(format!("waiting for {what}"))),
            _ = tokio::time::sleep_until(deadline) => {
                return Err(Error::timeout(what, timeout, last_error));
            }
            result = check() => result?,
        };
        match checked {
            Poll::Ready(value) => return Ok(value),
            Poll::Pending(msg) => last_error = msg,
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(Error::timeout(what, timeout, last_error));
        }
        let sleep = jitter(delay).min(deadline - now);
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::cancelled(format!("waiting for {what}"))),
            _ = tokio::time::sleep(sleep) => {}
        }
        delay = backoff.next(delay);
    }
}

/// Add up to 10% random jitter
fn jitter(delay: Duration) -> Duration {
    let max_jitter = delay.as_millis() as u64 / 10;
    if max_jitter == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=max_jitter))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn ready_value_is_returned() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let value = poll_until(
            &CancellationToken::new(),
            Duration::from_secs(60),
            Backoff::fixed(Duration::from_secs(1)),
            "counter",
            || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    Ok(if n >= 3 { Poll::Ready(n) } else { Poll::Pending(None) })
                }
            },
        )
        .await
        .expect("poll should complete");
        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    /// Story: A condition never holds; the timeout error keeps the last
    /// reason it was not satisfied.
    #[tokio::test(start_paused = true)]
    async fn story_timeout_reports_last_soft_error() {
        let err = poll_until::<(), _, _>(
            &CancellationToken::new(),
            Duration::from_secs(5),
            Backoff::fixed(Duration::from_secs(1)),
            "pod ready",
            || async { Ok(Poll::Pending(Some("pod is Pending".to_string()))) },
        )
        .await
        .expect_err("poll should time out");
        match err {
            Error::Timeout { last_error, timeout, .. } => {
                assert_eq!(last_error.as_deref(), Some("pod is Pending"));
                assert_eq!(timeout, Duration::from_secs(5));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_is_distinct_from_timeout() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            trigger.cancel();
        });
        let err = poll_until::<(), _, _>(
            &cancel,
            Duration::from_secs(600),
            Backoff::fixed(Duration::from_secs(1)),
            "forever",
            || async { Ok(Poll::Pending(None)) },
        )
        .await
        .expect_err("poll should be cancelled");
        assert!(matches!(err, Error::Cancelled { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn hard_errors_stop_polling() {
        let err = poll_until::<(), _, _>(
            &CancellationToken::new(),
            Duration::from_secs(60),
            Backoff::default(),
            "object",
            || async { Err(Error::execution("get pod", "forbidden")) },
        )
        .await
        .expect_err("hard error should propagate");
        assert!(matches!(err, Error::Execution { .. }));
    }

    #[test]
    fn backoff_grows_to_max() {
        let backoff = Backoff {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(4),
            factor: 2.0,
        };
        let second = backoff.next(backoff.initial);
        assert_eq!(second, Duration::from_secs(2));
        assert_eq!(backoff.next(backoff.next(second)), Duration::from_secs(4));
    }
}
