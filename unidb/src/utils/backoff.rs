//! Exponential backoff
//!
//! Pure delay arithmetic; nothing in here sleeps.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Exponential backoff: `initial * multiplier^attempt`, capped at `max_interval`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub initial_interval: Duration,
    pub multiplier: f64,
    pub max_interval: Duration,
    pub max_elapsed_time: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(100),
            multiplier: 2.0,
            max_interval: Duration::from_secs(30),
            max_elapsed_time: Duration::from_secs(5 * 60),
        }
    }
}

impl BackoffPolicy {
    pub fn new(initial_interval: Duration, multiplier: f64, max_interval: Duration) -> Self {
        Self {
            initial_interval,
            multiplier,
            max_interval,
            ..Self::default()
        }
    }

    pub fn with_max_elapsed_time(mut self, max_elapsed_time: Duration) -> Self {
        self.max_elapsed_time = max_elapsed_time;
        self
    }

    /// Delay before retry number `attempt` (zero-based).
    pub fn next_interval(&self, attempt: u32) -> Duration {
        let cap = self.max_interval;
        if attempt == 0 {
            return self.initial_interval.min(cap);
        }

        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let scaled = self.initial_interval.as_nanos() as f64 * self.multiplier.powi(exponent);
        if !scaled.is_finite() || scaled < 0.0 || scaled >= cap.as_nanos() as f64 {
            return cap;
        }

        Duration::from_nanos(scaled.round() as u64).min(cap)
    }

    /// True once `max_elapsed_time` has passed since `start`.
    pub fn is_elapsed(&self, start: Instant) -> bool {
        start.elapsed() >= self.max_elapsed_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_first_interval_is_initial() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.next_interval(0), Duration::from_millis(100));
    }

    #[test]
    fn test_first_interval_clamped_when_initial_exceeds_cap() {
        let policy = BackoffPolicy::new(Duration::from_secs(10), 2.0, Duration::from_secs(1));
        assert_eq!(policy.next_interval(0), Duration::from_secs(1));
    }

    #[test]
    fn test_growth_and_cap() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), 2.0, Duration::from_secs(1));

        assert_eq!(policy.next_interval(1), Duration::from_millis(200));
        assert_eq!(policy.next_interval(2), Duration::from_millis(400));
        assert_eq!(policy.next_interval(3), Duration::from_millis(800));
        assert_eq!(policy.next_interval(4), Duration::from_secs(1));
        assert_eq!(policy.next_interval(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_non_decreasing_and_never_above_cap() {
        let policy = BackoffPolicy::new(Duration::from_millis(7), 1.7, Duration::from_secs(3));

        let mut previous = Duration::ZERO;
        for attempt in 0..200 {
            let interval = policy.next_interval(attempt);
            assert!(interval >= previous, "attempt {attempt} went down");
            assert!(interval <= policy.max_interval);
            previous = interval;
        }
    }

    #[test]
    fn test_is_elapsed() {
        let policy = BackoffPolicy::default().with_max_elapsed_time(Duration::ZERO);
        assert!(policy.is_elapsed(Instant::now()));

        let policy = BackoffPolicy::default().with_max_elapsed_time(Duration::from_secs(3600));
        assert!(!policy.is_elapsed(Instant::now()));
    }
}
