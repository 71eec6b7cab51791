//! Retry delays.
//!
//! The ceiling doubles from `min` on every attempt and is capped at `max`. The
//! actual delay is drawn from the upper half of the ceiling so concurrent
//! retries spread out, and never drops below `min`.

use std::time::Duration;

use rand::Rng;

/// Delay before retry number `attempt` (1-based). Attempt 0 does not wait.
pub fn retry_delay(attempt: u32, min: Duration, max: Duration) -> Duration {
    if attempt == 0 || max.is_zero() {
        return Duration::ZERO;
    }

    let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
    let ceiling = min.saturating_mul(factor).min(max);

    let half = ceiling / 2;
    let spread = ceiling - half;
    let jitter = if spread.is_zero() {
        Duration::ZERO
    } else {
        spread.mul_f64(rand::thread_rng().gen_range(0.0..=1.0))
    };

    (half + jitter).max(min.min(max))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: Duration = Duration::from_millis(100);
    const MAX: Duration = Duration::from_millis(1000);

    #[test]
    fn grows_then_caps() {
        for _ in 0..50 {
            assert_eq!(retry_delay(1, MIN, MAX), MIN);

            let third = retry_delay(3, MIN, MAX);
            assert!(third >= Duration::from_millis(200) && third <= Duration::from_millis(400));

            let late = retry_delay(30, MIN, MAX);
            assert!(late >= Duration::from_millis(500) && late <= MAX);
        }
    }

    #[test]
    fn zero_attempt_or_zero_max_does_not_wait() {
        assert_eq!(retry_delay(0, MIN, MAX), Duration::ZERO);
        assert_eq!(retry_delay(4, MIN, Duration::ZERO), Duration::ZERO);
    }
}
