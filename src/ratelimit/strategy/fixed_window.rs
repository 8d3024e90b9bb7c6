use std::time::{Duration, Instant};

use super::{roll_window, Admission, Decision, StrategyStatus};

/// A simple window-based limiter.
///
/// Divides time into back-to-back windows of fixed length, aligned to the
/// instant the state was created, and counts the cost admitted in the
/// current one. It is the cheapest strategy but allows boundary bursts: up
/// to twice the capacity can pass in a short interval straddling two
/// windows.
#[derive(Debug, Clone, PartialEq)]
pub struct FixedWindow {
    capacity: u64,
    window: Duration,
    window_start: Instant,
    count: u64,
}

impl FixedWindow {
    pub fn new(capacity: u64, window: Duration, now: Instant) -> Self {
        Self {
            capacity,
            window,
            window_start: now,
            count: 0,
        }
    }

    /// Window start and count as seen at `now`.
    fn current(&self, now: Instant) -> (Instant, u64) {
        match roll_window(self.window_start, now, self.window) {
            (_, 0) => (self.window_start, self.count),
            (start, _) => (start, 0),
        }
    }

    fn until_window_end(&self, window_start: Instant, now: Instant) -> Duration {
        self.window
            .saturating_sub(now.saturating_duration_since(window_start))
    }
}

impl Admission for FixedWindow {
    fn try_acquire(&mut self, cost: u64, now: Instant) -> Decision {
        let (window_start, count) = self.current(now);

        if cost <= self.capacity - count {
            self.window_start = window_start;
            self.count = count + cost;
            Decision::admitted(self.capacity - self.count)
        } else {
            Decision::over_limit(
                self.capacity - count,
                self.until_window_end(window_start, now),
            )
        }
    }

    fn status(&self, now: Instant) -> StrategyStatus {
        let (window_start, count) = self.current(now);
        let replenished_after = if count == 0 {
            Duration::ZERO
        } else {
            self.until_window_end(window_start, now)
        };

        StrategyStatus {
            usage: count as f64,
            remaining: self.capacity - count,
            replenished_after,
        }
    }
}
