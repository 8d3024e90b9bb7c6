use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::{Admission, Decision, StrategyStatus};

/// An exact sliding window.
///
/// Keeps one `(time, cost)` entry per admitted request and counts the cost
/// of entries younger than the window. Precise at every instant, at the
/// price of memory proportional to the admission rate.
#[derive(Debug, Clone, PartialEq)]
pub struct SlidingLog {
    capacity: u64,
    window: Duration,
    /// Admitted requests, oldest first
    entries: VecDeque<(Instant, u64)>,
    /// Sum of the costs in `entries`
    total: u64,
}

impl SlidingLog {
    pub fn new(capacity: u64, window: Duration) -> Self {
        Self {
            capacity,
            window,
            entries: VecDeque::new(),
            total: 0,
        }
    }

    fn is_expired(&self, admitted_at: Instant, now: Instant) -> bool {
        now.saturating_duration_since(admitted_at) >= self.window
    }

    /// Number of expired entries at the front of the log and their total cost.
    fn expired(&self, now: Instant) -> (usize, u64) {
        let mut count = 0;
        let mut cost = 0;
        for &(at, c) in &self.entries {
            if !self.is_expired(at, now) {
                break;
            }
            count += 1;
            cost += c;
        }
        (count, cost)
    }

    /// Wait until enough live entries expire to free `needed` permits.
    fn wait_for(&self, skip: usize, needed: u64, now: Instant) -> Duration {
        let mut freed = 0;
        for &(at, cost) in self.entries.iter().skip(skip) {
            freed += cost;
            if freed >= needed {
                return self
                    .window
                    .saturating_sub(now.saturating_duration_since(at));
            }
        }
        self.window
    }
}

impl Admission for SlidingLog {
    fn try_acquire(&mut self, cost: u64, now: Instant) -> Decision {
        let (expired, expired_cost) = self.expired(now);
        let live = self.total - expired_cost;

        if cost <= self.capacity - live {
            self.entries.drain(..expired);
            // Entries stay ordered even if the clock steps back
            let stamp = match self.entries.back() {
                Some(&(last, _)) => now.max(last),
                None => now,
            };
            self.entries.push_back((stamp, cost));
            self.total = live + cost;
            Decision::admitted(self.capacity - self.total)
        } else {
            let needed = cost - (self.capacity - live);
            Decision::over_limit(self.capacity - live, self.wait_for(expired, needed, now))
        }
    }

    fn status(&self, now: Instant) -> StrategyStatus {
        let (expired, expired_cost) = self.expired(now);
        let live = self.total - expired_cost;
        let replenished_after = if live == 0 {
            Duration::ZERO
        } else {
            self.wait_for(expired, live, now)
        };

        StrategyStatus {
            usage: live as f64,
            remaining: self.capacity - live,
            replenished_after,
        }
    }
}
