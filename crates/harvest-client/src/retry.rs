use rand::Rng;
use std::time::Duration;

/// Backoff configuration for transient request failures.
///
/// The constants live in one injectable value so tests can run with
/// millisecond delays instead of the production ones.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per request, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles each attempt.
    pub base_delay: Duration,
    /// Ceiling on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff with full jitter for the given retry number
    /// (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponential = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let capped = exponential.min(self.max_delay);
        let millis = capped.as_millis().max(1) as u64;
        let jittered = rand::thread_rng().gen_range(millis / 2..=millis);
        Duration::from_millis(jittered)
    }
}

/// Parse a `Retry-After` header value in delay-seconds form.
///
/// HTTP-date values are rare from EHR servers; we let callers fall back to
/// their own default rather than dragging in date parsing for them.
pub fn parse_retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(60));
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
        };

        for _ in 0..20 {
            // attempt 1: 50..=100ms
            let d1 = policy.delay_for(1);
            assert!(d1 >= Duration::from_millis(50) && d1 <= Duration::from_millis(100));

            // attempt 4 would be 800ms uncapped; capped to 400ms
            let d4 = policy.delay_for(4);
            assert!(d4 <= Duration::from_millis(400));
        }
    }

    #[test]
    fn test_delay_never_zero_range() {
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(0),
            max_delay: Duration::from_millis(0),
        };
        // Must not panic on an empty jitter range.
        let _ = policy.delay_for(1);
    }
}
