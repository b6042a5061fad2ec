//! Retry schedule for failed submissions.

use chrono::{DateTime, Duration, Utc};

/// Base unit of the exponential backoff.
pub const BASE_DELAY_SECS: u64 = 60;

/// Delay before the next attempt once `retry_count` failures have been
/// recorded: `2^retry_count * 60` seconds.
pub fn retry_delay_seconds(retry_count: u32) -> u64 {
    2u64.saturating_pow(retry_count)
        .saturating_mul(BASE_DELAY_SECS)
}

/// What happens after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAt {
        delay_seconds: u64,
        at: DateTime<Utc>,
    },
    GiveUp,
}

/// Decide on a retry given the already-incremented `retry_count`.
pub fn decide(retry_count: u32, max_retries: u32, now: DateTime<Utc>) -> RetryDecision {
    if retry_count >= max_retries {
        return RetryDecision::GiveUp;
    }
    let delay_seconds = retry_delay_seconds(retry_count);
    let delay = Duration::try_seconds(delay_seconds.min(i64::MAX as u64) as i64)
        .unwrap_or(Duration::MAX);
    RetryDecision::RetryAt {
        delay_seconds,
        at: now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_two_minutes() {
        assert_eq!(retry_delay_seconds(1), 120);
        assert_eq!(retry_delay_seconds(2), 240);
        assert_eq!(retry_delay_seconds(3), 480);
    }

    #[test]
    fn backoff_saturates() {
        assert_eq!(retry_delay_seconds(200), u64::MAX);
    }

    #[test]
    fn gives_up_at_max_retries() {
        let now = Utc::now();
        assert_eq!(
            decide(1, 3, now),
            RetryDecision::RetryAt {
                delay_seconds: 120,
                at: now + Duration::seconds(120)
            }
        );
        assert!(matches!(decide(2, 3, now), RetryDecision::RetryAt { delay_seconds: 240, .. }));
        assert_eq!(decide(3, 3, now), RetryDecision::GiveUp);
    }
}
