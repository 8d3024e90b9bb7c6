use std::time::Instant;

use super::{secs, whole, Admission, Decision, StrategyStatus};

/// A leaky bucket used as a meter.
///
/// Admissions pour `cost` into the bucket and the bucket drains at
/// `leak_rate` per second. A request that would overflow is rejected. Unlike
/// the token bucket it starts empty, so the first burst is the same size but
/// the level reads as "work in flight" rather than "credit left".
#[derive(Debug, Clone, PartialEq)]
pub struct LeakyBucket {
    capacity: u64,
    leak_rate: f64,
    level: f64,
    last_leak: Instant,
}

impl LeakyBucket {
    pub fn new(capacity: u64, leak_rate: f64, now: Instant) -> Self {
        Self {
            capacity,
            leak_rate,
            level: 0.0,
            last_leak: now,
        }
    }

    /// Bucket level at `now`.
    pub fn level(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_leak).as_secs_f64();
        (self.level - elapsed * self.leak_rate).max(0.0)
    }
}

impl Admission for LeakyBucket {
    fn try_acquire(&mut self, cost: u64, now: Instant) -> Decision {
        let level = self.level(now);
        let capacity = self.capacity as f64;
        let cost = cost as f64;

        if level + cost <= capacity {
            self.level = level + cost;
            self.last_leak = self.last_leak.max(now);
            Decision::admitted(whole(capacity - self.level))
        } else {
            let overflow = level + cost - capacity;
            Decision::over_limit(whole(capacity - level), secs(overflow / self.leak_rate))
        }
    }

    fn status(&self, now: Instant) -> StrategyStatus {
        let level = self.level(now);

        StrategyStatus {
            usage: level,
            remaining: whole(self.capacity as f64 - level),
            replenished_after: secs(level / self.leak_rate),
        }
    }
}
