//! Background eviction of idle limiters.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::limiter::RateLimiter;

/// Shortest period between sweeps.
pub const MIN_SWEEP_PERIOD: Duration = Duration::from_millis(1);

/// Handle to a task that periodically sweeps idle keys out of a [`RateLimiter`].
#[derive(Debug)]
pub struct Maintenance {
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<usize>,
}

impl Maintenance {
    /// Spawn the sweep task on the current tokio runtime.
    ///
    /// The first sweep runs one `period` after spawning. Periods shorter
    /// than [`MIN_SWEEP_PERIOD`] are raised to it.
    pub fn spawn(limiter: Arc<RateLimiter>, period: Duration) -> Self {
        let period = period.max(MIN_SWEEP_PERIOD);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut total = 0;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = limiter.sweep();
                        total += evicted;
                        debug!(evicted, live = limiter.key_count(), "Maintenance sweep");
                    }
                    _ = &mut shutdown_rx => break,
                }
            }

            info!(total_evicted = total, "Maintenance task stopped");
            total
        });

        info!(period = ?period, "Maintenance task started");
        Self {
            shutdown_tx,
            handle,
        }
    }

    /// Stop the task and wait for it. Returns the number of keys it evicted.
    pub async fn shutdown(self) -> usize {
        let _ = self.shutdown_tx.send(());
        match self.handle.await {
            Ok(total) => total,
            Err(e) => {
                warn!(error = %e, "Maintenance task failed");
                0
            }
        }
    }
}
