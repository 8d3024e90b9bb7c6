use std::time::{Duration, Instant};

use super::{roll_window, secs, whole, Admission, Decision, StrategyStatus};

/// A Sliding Window Counter.
///
/// Keeps the count of the current fixed window and of the previous one and
/// estimates the trailing-window count as
/// `current + previous * (1 - elapsed_fraction_of_current_window)`.
///
/// The estimate assumes the previous window's traffic was spread evenly.
/// When it was bunched up at the end of that window the estimate runs low,
/// and the cost admitted in a true trailing window is bounded by
/// `capacity + previous * elapsed_fraction`, which stays below
/// `2 * capacity`.
#[derive(Debug, Clone, PartialEq)]
pub struct SlidingCounter {
    capacity: u64,
    window: Duration,
    current_window_start: Instant,
    previous_count: u64,
    current_count: u64,
}

/// Counters after rolling to the window containing `now`.
struct View {
    window_start: Instant,
    previous: u64,
    current: u64,
    /// Fraction of the current window already elapsed, in `[0, 1)`
    elapsed: f64,
}

impl View {
    fn estimated(&self) -> f64 {
        self.current as f64 + self.previous as f64 * (1.0 - self.elapsed)
    }
}

impl SlidingCounter {
    pub fn new(capacity: u64, window: Duration, now: Instant) -> Self {
        Self {
            capacity,
            window,
            current_window_start: now,
            previous_count: 0,
            current_count: 0,
        }
    }

    fn view(&self, now: Instant) -> View {
        let (window_start, previous, current) =
            match roll_window(self.current_window_start, now, self.window) {
                (start, 0) => (start, self.previous_count, self.current_count),
                // The old current window is now the previous one
                (start, 1) => (start, self.current_count, 0),
                // More than a full window has passed since anything was counted
                (start, _) => (start, 0, 0),
            };

        let elapsed = now.saturating_duration_since(window_start).as_secs_f64()
            / self.window.as_secs_f64();

        View {
            window_start,
            previous,
            current,
            elapsed: elapsed.min(1.0),
        }
    }

    /// Time until the estimate drops low enough to admit `cost`.
    fn wait_for(&self, view: &View, cost: u64) -> Duration {
        let window = self.window.as_secs_f64();
        let elapsed = view.elapsed * window;
        let room = self.capacity as f64 - view.current as f64 - cost as f64;

        let wait = if room >= 0.0 && view.previous > 0 {
            // The previous window's weight has to decay further
            let needed_fraction = 1.0 - room / view.previous as f64;
            needed_fraction * window - elapsed
        } else {
            // Only the next window helps, where today's count becomes the previous one
            let room_next = self.capacity as f64 - cost as f64;
            let needed_fraction = if view.current == 0 {
                0.0
            } else {
                (1.0 - room_next / view.current as f64).max(0.0)
            };
            (window - elapsed) + needed_fraction * window
        };

        secs(wait)
    }
}

impl Admission for SlidingCounter {
    fn try_acquire(&mut self, cost: u64, now: Instant) -> Decision {
        let view = self.view(now);
        let estimated = view.estimated();
        let capacity = self.capacity as f64;

        if cost <= self.capacity - view.current && estimated + cost as f64 <= capacity {
            self.current_window_start = view.window_start;
            self.previous_count = view.previous;
            self.current_count = view.current + cost;
            Decision::admitted(whole(capacity - estimated - cost as f64))
        } else {
            Decision::over_limit(whole(capacity - estimated), self.wait_for(&view, cost))
        }
    }

    fn status(&self, now: Instant) -> StrategyStatus {
        let view = self.view(now);
        let estimated = view.estimated();
        let window = self.window.as_secs_f64();

        // Full capacity returns once both counters have aged out
        let replenished_after = if view.current > 0 {
            secs(2.0 * window - view.elapsed * window)
        } else if view.previous > 0 {
            secs(window - view.elapsed * window)
        } else {
            Duration::ZERO
        };

        StrategyStatus {
            usage: estimated,
            remaining: whole(self.capacity as f64 - estimated),
            replenished_after,
        }
    }
}
