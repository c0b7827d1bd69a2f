use std::time::{Duration, Instant};

use tracing::debug;

/// Exponential backoff bounded by a total wait.
///
/// Used by producers connecting to a consumer socket that may not be bound
/// yet, and by collaborators attaching to a shared region that may not be
/// created yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Upper bound for a single delay.
    pub max_delay: Duration,
    /// Total time budget across all attempts.
    pub max_wait: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(25),
            max_delay: Duration::from_millis(500),
            max_wait: Duration::from_secs(10),
        }
    }
}

impl Backoff {
    /// Default delays with an explicit total budget.
    pub fn with_max_wait(max_wait: Duration) -> Self {
        Self {
            max_wait,
            ..Self::default()
        }
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// budget is spent. The last error is returned on exhaustion.
    pub fn retry<T, E, F, R>(&self, mut op: F, mut retryable: R) -> std::result::Result<T, E>
    where
        F: FnMut() -> std::result::Result<T, E>,
        R: FnMut(&E) -> bool,
    {
        let start = Instant::now();
        let mut delay = self.initial;
        let mut attempt = 1u32;

        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let elapsed = start.elapsed();
                    if !retryable(&err) || elapsed >= self.max_wait {
                        return Err(err);
                    }
                    let remaining = self.max_wait - elapsed;
                    let sleep_for = delay.min(remaining);
                    debug!(attempt, ?sleep_for, "retrying after backoff");
                    std::thread::sleep(sleep_for);
                    delay = (delay * 2).min(self.max_delay);
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast(max_wait: Duration) -> Backoff {
        Backoff {
            initial: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            max_wait,
        }
    }

    #[test]
    fn succeeds_after_transient_failures() {
        let mut calls = 0;
        let result: Result<u32, &str> = fast(Duration::from_secs(2)).retry(
            || {
                calls += 1;
                if calls < 4 {
                    Err("not yet")
                } else {
                    Ok(calls)
                }
            },
            |_| true,
        );
        assert_eq!(result, Ok(4));
    }

    #[test]
    fn gives_up_after_budget() {
        let start = Instant::now();
        let result: Result<(), &str> =
            fast(Duration::from_millis(30)).retry(|| Err("never"), |_| true);
        assert_eq!(result, Err("never"));
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn non_retryable_error_returns_immediately() {
        let mut calls = 0;
        let result: Result<(), &str> = fast(Duration::from_secs(5)).retry(
            || {
                calls += 1;
                Err("fatal")
            },
            |_| false,
        );
        assert_eq!(result, Err("fatal"));
        assert_eq!(calls, 1);
    }

    #[test]
    fn delay_is_capped() {
        let backoff = Backoff::with_max_wait(Duration::from_secs(1));
        assert_eq!(backoff.initial, Duration::from_millis(25));
        assert!(backoff.max_delay <= Duration::from_secs(1));
    }
}
