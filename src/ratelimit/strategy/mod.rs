//! Admission algorithms.
//!
//! Every algorithm implements [`Admission`] over its own private state and
//! is wrapped in the closed [`Strategy`] enum, which the registry builds
//! from a [`LimiterConfig`]. Strategies are plain data: they do no locking
//! and never read the clock, so the caller must serialize access and supply
//! a non-decreasing `now`. An instant earlier than one already seen counts
//! as zero elapsed time.
//!
//! All strategies compute the advanced state (refill, window roll, log
//! pruning) into locals and only write it back when a request is admitted.
//! A rejected request therefore leaves the state exactly as it was.

use serde::Serialize;
use std::time::{Duration, Instant};

use super::limits::{Algorithm, LimiterConfig};

mod fixed_window;
mod leaky_bucket;
mod sliding_counter;
mod sliding_log;
mod token_bucket;

pub use fixed_window::FixedWindow;
pub use leaky_bucket::LeakyBucket;
pub use sliding_counter::SlidingCounter;
pub use sliding_log::SlidingLog;
pub use token_bucket::TokenBucket;

/// Result category of an admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The request fit in the budget and was charged
    Admitted,
    /// The budget is exhausted for now; retrying later may succeed
    OverLimit,
    /// The cost is zero or larger than capacity and can never be admitted
    InvalidCost,
}

/// The answer to one admission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub outcome: Outcome,
    /// Whole permits still available after this decision
    pub remaining: u64,
    /// How long to wait before the same request could be admitted (zero when admitted)
    pub retry_after: Duration,
}

impl Decision {
    pub fn admitted(remaining: u64) -> Self {
        Self {
            outcome: Outcome::Admitted,
            remaining,
            retry_after: Duration::ZERO,
        }
    }

    pub fn over_limit(remaining: u64, retry_after: Duration) -> Self {
        Self {
            outcome: Outcome::OverLimit,
            remaining,
            retry_after,
        }
    }

    /// A permanent rejection. Waiting does not help, so `retry_after` is zero.
    pub fn invalid_cost() -> Self {
        Self {
            outcome: Outcome::InvalidCost,
            remaining: 0,
            retry_after: Duration::ZERO,
        }
    }

    pub fn is_admitted(&self) -> bool {
        self.outcome == Outcome::Admitted
    }
}

/// Read-only view of a strategy at some instant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StrategyStatus {
    /// Budget currently consumed, in permits (may be fractional for buckets
    /// and the interpolated counter)
    pub usage: f64,
    /// Whole permits available right now
    pub remaining: u64,
    /// Time until the full capacity is available again
    pub replenished_after: Duration,
}

/// The capability every admission algorithm provides.
pub trait Admission {
    /// Try to charge `cost` permits at `now`.
    ///
    /// `cost` must already be validated against the configuration
    /// (`1..=capacity`).
    fn try_acquire(&mut self, cost: u64, now: Instant) -> Decision;

    /// Describe the state as it would be at `now` without changing it.
    fn status(&self, now: Instant) -> StrategyStatus;
}

/// One of the supported admission algorithms with its state.
#[derive(Debug, Clone, PartialEq)]
pub enum Strategy {
    FixedWindow(FixedWindow),
    SlidingLog(SlidingLog),
    SlidingCounter(SlidingCounter),
    TokenBucket(TokenBucket),
    LeakyBucket(LeakyBucket),
}

impl Strategy {
    /// Build fresh state for `config`, anchored at `now`.
    pub fn new(config: &LimiterConfig, now: Instant) -> Self {
        let capacity = config.capacity();
        match config.algorithm() {
            Algorithm::FixedWindow => {
                Strategy::FixedWindow(FixedWindow::new(capacity, config.window(), now))
            }
            Algorithm::SlidingLog => {
                Strategy::SlidingLog(SlidingLog::new(capacity, config.window()))
            }
            Algorithm::SlidingCounter => {
                Strategy::SlidingCounter(SlidingCounter::new(capacity, config.window(), now))
            }
            Algorithm::TokenBucket => {
                Strategy::TokenBucket(TokenBucket::new(capacity, config.refill_rate(), now))
            }
            Algorithm::LeakyBucket => {
                Strategy::LeakyBucket(LeakyBucket::new(capacity, config.refill_rate(), now))
            }
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        match self {
            Strategy::FixedWindow(_) => Algorithm::FixedWindow,
            Strategy::SlidingLog(_) => Algorithm::SlidingLog,
            Strategy::SlidingCounter(_) => Algorithm::SlidingCounter,
            Strategy::TokenBucket(_) => Algorithm::TokenBucket,
            Strategy::LeakyBucket(_) => Algorithm::LeakyBucket,
        }
    }
}

impl Admission for Strategy {
    fn try_acquire(&mut self, cost: u64, now: Instant) -> Decision {
        match self {
            Strategy::FixedWindow(s) => s.try_acquire(cost, now),
            Strategy::SlidingLog(s) => s.try_acquire(cost, now),
            Strategy::SlidingCounter(s) => s.try_acquire(cost, now),
            Strategy::TokenBucket(s) => s.try_acquire(cost, now),
            Strategy::LeakyBucket(s) => s.try_acquire(cost, now),
        }
    }

    fn status(&self, now: Instant) -> StrategyStatus {
        match self {
            Strategy::FixedWindow(s) => s.status(now),
            Strategy::SlidingLog(s) => s.status(now),
            Strategy::SlidingCounter(s) => s.status(now),
            Strategy::TokenBucket(s) => s.status(now),
            Strategy::LeakyBucket(s) => s.status(now),
        }
    }
}

/// Align `start` forward to the latest window boundary at or before `now`.
///
/// Returns the new window start and how many whole windows were skipped.
fn roll_window(start: Instant, now: Instant, window: Duration) -> (Instant, u128) {
    let elapsed = now.saturating_duration_since(start).as_nanos();
    let window_ns = window.as_nanos();
    let windows = elapsed / window_ns;
    if windows == 0 {
        return (start, 0);
    }

    // offset <= elapsed, which already fit in a Duration
    let offset = windows * window_ns;
    let offset = Duration::new(
        (offset / 1_000_000_000) as u64,
        (offset % 1_000_000_000) as u32,
    );
    (start + offset, windows)
}

/// Convert a non-negative number of seconds into a `Duration`, saturating.
fn secs(seconds: f64) -> Duration {
    Duration::try_from_secs_f64(seconds.max(0.0)).unwrap_or(Duration::MAX)
}

/// Whole permits in a fractional budget.
fn whole(permits: f64) -> u64 {
    permits.max(0.0).floor() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roll_window_within_window() {
        let start = Instant::now();
        let now = start + Duration::from_millis(999);
        assert_eq!(roll_window(start, now, Duration::from_secs(1)), (start, 0));
    }

    #[test]
    fn test_roll_window_skips_whole_windows() {
        let start = Instant::now();
        let now = start + Duration::from_millis(3_250);
        let (new_start, windows) = roll_window(start, now, Duration::from_secs(1));
        assert_eq!(windows, 3);
        assert_eq!(new_start, start + Duration::from_secs(3));
    }

    #[test]
    fn test_roll_window_ignores_regression() {
        let now = Instant::now();
        let start = now + Duration::from_secs(5);
        assert_eq!(roll_window(start, now, Duration::from_secs(1)), (start, 0));
    }

    #[test]
    fn test_strategy_matches_config_algorithm() {
        let now = Instant::now();
        let configs = [
            LimiterConfig::fixed_window(1, Duration::from_secs(1)).unwrap(),
            LimiterConfig::sliding_log(1, Duration::from_secs(1)).unwrap(),
            LimiterConfig::sliding_counter(1, Duration::from_secs(1)).unwrap(),
            LimiterConfig::token_bucket(1, 1.0).unwrap(),
            LimiterConfig::leaky_bucket(1, 1.0).unwrap(),
        ];
        for config in &configs {
            assert_eq!(Strategy::new(config, now).algorithm(), config.algorithm());
        }
    }

    #[test]
    fn test_every_strategy_starts_with_full_capacity() {
        let now = Instant::now();
        let configs = [
            LimiterConfig::fixed_window(3, Duration::from_secs(1)).unwrap(),
            LimiterConfig::sliding_log(3, Duration::from_secs(1)).unwrap(),
            LimiterConfig::sliding_counter(3, Duration::from_secs(1)).unwrap(),
            LimiterConfig::token_bucket(3, 1.0).unwrap(),
            LimiterConfig::leaky_bucket(3, 1.0).unwrap(),
        ];
        for config in &configs {
            let mut strategy = Strategy::new(config, now);
            assert_eq!(strategy.status(now).remaining, 3, "{}", config.algorithm());
            assert!(strategy.try_acquire(3, now).is_admitted());
            let rejected = strategy.try_acquire(1, now);
            assert_eq!(rejected.outcome, Outcome::OverLimit, "{}", config.algorithm());
            assert!(rejected.retry_after > Duration::ZERO);
        }
    }

    #[test]
    fn test_rejection_leaves_state_untouched() {
        let start = Instant::now();
        let configs = [
            LimiterConfig::fixed_window(2, Duration::from_secs(1)).unwrap(),
            LimiterConfig::sliding_log(2, Duration::from_secs(1)).unwrap(),
            LimiterConfig::sliding_counter(2, Duration::from_secs(1)).unwrap(),
            LimiterConfig::token_bucket(2, 0.5).unwrap(),
            LimiterConfig::leaky_bucket(2, 0.5).unwrap(),
        ];
        for config in &configs {
            let mut strategy = Strategy::new(config, start);
            assert!(strategy.try_acquire(2, start).is_admitted());

            let later = start + Duration::from_millis(100);
            let before = strategy.clone();
            let decision = strategy.try_acquire(2, later);
            assert!(!decision.is_admitted(), "{}", config.algorithm());
            assert_eq!(strategy, before, "{} mutated on rejection", config.algorithm());
        }
    }
}
