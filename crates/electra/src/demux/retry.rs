// Blocking retry with exponential backoff, used for init-segment fetches.

use std::thread;
use std::time::{Duration, Instant};

use rand::RngExt;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::DemuxError;

/// Longest uninterrupted sleep while waiting out a backoff delay.
const CANCEL_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry; doubles per attempt
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Adds up to `base_delay / 2` of random delay, never past `max_delay`
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt + 1`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let capped = self
            .base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);
        if !self.jitter {
            return capped;
        }

        let jitter_range_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX) / 2;
        let headroom_ms =
            u64::try_from(self.max_delay.saturating_sub(capped).as_millis()).unwrap_or(0);
        let limit_ms = jitter_range_ms.min(headroom_ms);
        if limit_ms == 0 {
            return capped;
        }
        let jitter_ms = rand::rng().random_range(0..limit_ms);
        (capped + Duration::from_millis(jitter_ms)).min(self.max_delay)
    }
}

/// Outcome of one attempt.
pub enum RetryAction<T> {
    Success(T),
    Retry(DemuxError),
    Fail(DemuxError),
}

/// Runs `operation` until it succeeds, fails permanently or the retries
/// run out. Backoff sleeps wake early on cancellation.
pub fn retry_with_backoff<T>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    mut operation: impl FnMut(u32) -> RetryAction<T>,
) -> Result<T, DemuxError> {
    let mut attempt = 0;
    loop {
        if token.is_cancelled() {
            return Err(DemuxError::Cancelled);
        }
        match operation(attempt) {
            RetryAction::Success(value) => return Ok(value),
            RetryAction::Fail(err) => return Err(err),
            RetryAction::Retry(err) if attempt >= policy.max_retries => return Err(err),
            RetryAction::Retry(err) => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    attempt = attempt + 1,
                    max = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying after transient error"
                );
                if !sleep_unless_cancelled(token, delay) {
                    return Err(DemuxError::Cancelled);
                }
                attempt += 1;
            }
        }
    }
}

/// `false` if the token was cancelled before `delay` elapsed.
fn sleep_unless_cancelled(token: &CancellationToken, delay: Duration) -> bool {
    let deadline = Instant::now() + delay;
    loop {
        if token.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(CANCEL_POLL));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;

    fn policy(max_retries: u32, base_ms: u64, jitter: bool) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_secs(1),
            jitter,
        }
    }

    fn server_error() -> DemuxError {
        DemuxError::transport("init.mp4", TransportError::status(503, "unavailable"))
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = policy(3, 100, false);
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = policy(3, 100, true);
        for _ in 0..32 {
            let delay = policy.delay_for_attempt(0);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay < Duration::from_millis(150));
            assert!(policy.delay_for_attempt(10) <= Duration::from_secs(1));
        }
    }

    #[test]
    fn test_retries_until_success() {
        let token = CancellationToken::new();
        let mut attempts = 0;
        let result = retry_with_backoff(&policy(3, 1, false), &token, |attempt| {
            attempts += 1;
            if attempt < 2 {
                RetryAction::Retry(server_error())
            } else {
                RetryAction::Success(attempt)
            }
        });
        assert_eq!(result.unwrap(), 2);
        assert_eq!(attempts, 3);
    }

    #[test]
    fn test_permanent_failure_is_not_retried() {
        let token = CancellationToken::new();
        let mut attempts = 0;
        let result: Result<(), _> = retry_with_backoff(&policy(3, 1, false), &token, |_| {
            attempts += 1;
            RetryAction::Fail(DemuxError::malformed_header("bad moov"))
        });
        assert!(matches!(result, Err(DemuxError::Format { .. })));
        assert_eq!(attempts, 1);
    }

    #[test]
    fn test_exhausted_retries_return_last_error() {
        let token = CancellationToken::new();
        let mut attempts = 0;
        let result: Result<(), _> = retry_with_backoff(&policy(2, 1, false), &token, |_| {
            attempts += 1;
            RetryAction::Retry(server_error())
        });
        assert_eq!(result.unwrap_err().code(), 1503);
        assert_eq!(attempts, 3);
    }

    #[test]
    fn test_cancelled_token_stops_immediately() {
        let token = CancellationToken::new();
        token.cancel();
        let result = retry_with_backoff(&policy(5, 1_000, false), &token, |_| RetryAction::Success(1));
        assert!(matches!(result, Err(DemuxError::Cancelled)));
    }
}
