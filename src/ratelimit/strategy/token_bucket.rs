use std::time::Instant;

use super::{secs, whole, Admission, Decision, StrategyStatus};

/// A continuously refilled token bucket.
///
/// Starts full. Tokens accrue at `refill_rate` per second up to `capacity`
/// and each admission removes `cost` tokens, so bursts of up to `capacity`
/// pass immediately and the long-run rate is `refill_rate`.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenBucket {
    capacity: u64,
    refill_rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u64, refill_rate: f64, now: Instant) -> Self {
        Self {
            capacity,
            refill_rate,
            tokens: capacity as f64,
            last_refill: now,
        }
    }

    /// Tokens that would be in the bucket at `now`.
    pub fn available(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        (self.tokens + elapsed * self.refill_rate).min(self.capacity as f64)
    }
}

impl Admission for TokenBucket {
    fn try_acquire(&mut self, cost: u64, now: Instant) -> Decision {
        let tokens = self.available(now);
        let cost = cost as f64;

        if tokens >= cost {
            self.tokens = tokens - cost;
            self.last_refill = self.last_refill.max(now);
            Decision::admitted(whole(self.tokens))
        } else {
            Decision::over_limit(whole(tokens), secs((cost - tokens) / self.refill_rate))
        }
    }

    fn status(&self, now: Instant) -> StrategyStatus {
        let tokens = self.available(now);
        let missing = self.capacity as f64 - tokens;

        StrategyStatus {
            usage: missing,
            remaining: whole(tokens),
            replenished_after: secs(missing / self.refill_rate),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_bursts_up_to_capacity() {
        let now = Instant::now();
        let mut tb = TokenBucket::new(2, 10.0, now);

        assert!(tb.try_acquire(1, now).is_admitted());
        assert!(tb.try_acquire(1, now).is_admitted());
        assert!(!tb.try_acquire(1, now).is_admitted());
    }

    #[test]
    fn test_drain_and_refill() {
        let start = Instant::now();
        let mut tb = TokenBucket::new(10, 1.0, start);

        let drained = tb.try_acquire(10, start);
        assert!(drained.is_admitted());
        assert_eq!(drained.remaining, 0);

        let rejected = tb.try_acquire(1, start);
        assert!(!rejected.is_admitted());
        assert_eq!(rejected.retry_after, Duration::from_secs(1));

        assert!(tb.try_acquire(1, start + Duration::from_secs(1)).is_admitted());
    }

    #[test]
    fn test_idle_refill_is_exact_and_capped() {
        let start = Instant::now();
        let mut tb = TokenBucket::new(10, 2.0, start);
        tb.try_acquire(10, start);

        assert_eq!(tb.available(start + Duration::from_secs(3)), 6.0);
        assert_eq!(tb.available(start + Duration::from_millis(2_500)), 5.0);
        assert_eq!(tb.available(start + Duration::from_secs(60)), 10.0);
    }

    #[test]
    fn test_partial_tokens_are_kept() {
        let start = Instant::now();
        let mut tb = TokenBucket::new(5, 4.0, start);
        tb.try_acquire(5, start);

        // 0.5 tokens after 125ms: not enough for a whole request
        let rejected = tb.try_acquire(1, start + Duration::from_millis(125));
        assert_eq!(rejected.retry_after, Duration::from_millis(125));

        assert!(tb.try_acquire(1, start + Duration::from_millis(250)).is_admitted());
    }

    #[test]
    fn test_clock_regression_adds_no_tokens() {
        let start = Instant::now() + Duration::from_secs(10);
        let mut tb = TokenBucket::new(3, 1.0, start);
        tb.try_acquire(3, start);

        let earlier = start - Duration::from_secs(5);
        assert_eq!(tb.available(earlier), 0.0);
        assert!(!tb.try_acquire(1, earlier).is_admitted());
    }

    #[test]
    fn test_admit_during_clock_regression_keeps_refill_anchor() {
        let start = Instant::now();
        let t100 = start + Duration::from_secs(100);
        let mut tb = TokenBucket::new(10, 1.0, t100);

        assert!(tb.try_acquire(9, t100).is_admitted());
        assert!(tb.try_acquire(1, t100 - Duration::from_secs(5)).is_admitted());
        assert_eq!(tb.last_refill, t100);

        // The regressed interval must not be credited again
        assert_eq!(tb.available(t100), 0.0);
        assert!(!tb.try_acquire(1, t100).is_admitted());
    }

    #[test]
    fn test_status() {
        let start = Instant::now();
        let mut tb = TokenBucket::new(10, 1.0, start);
        tb.try_acquire(4, start);

        let status = tb.status(start + Duration::from_secs(1));
        assert_eq!(status.usage, 3.0);
        assert_eq!(status.remaining, 7);
        assert_eq!(status.replenished_after, Duration::from_secs(3));
    }
}
