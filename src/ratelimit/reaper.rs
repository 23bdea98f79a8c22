//! Background eviction of idle client records.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::limiter::RateLimiter;

/// Periodic sweep task for a [`RateLimiter`].
///
/// The task only holds a weak reference, so it ends on its own once the
/// limiter is dropped. Dropping the `Reaper` aborts the task.
pub struct Reaper {
    handle: JoinHandle<()>,
}

impl Reaper {
    /// Spawn a sweep of `limiter` every `interval` on the current tokio runtime.
    pub fn spawn(limiter: &Arc<RateLimiter>, interval: Duration) -> Self {
        let limiter = Arc::downgrade(limiter);
        info!(interval_ms = interval.as_millis() as u64, "Starting idle record reaper");
        let handle = tokio::spawn(run(limiter, interval));
        Self { handle }
    }

    /// Whether the sweep task is still alive.
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Stop sweeping.
    pub fn stop(self) {
        self.handle.abort();
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn run(limiter: Weak<RateLimiter>, interval: Duration) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately.
    tick.tick().await;

    loop {
        tick.tick().await;

        let Some(limiter) = limiter.upgrade() else {
            debug!("Rate limiter dropped, stopping reaper");
            return;
        };

        let removed = limiter.sweep(Instant::now());
        if removed > 0 {
            info!(
                removed = removed,
                tracked = limiter.key_count(),
                "Evicted idle rate limit records"
            );
        }
    }
}
