//! Drift-compensated periodic tick source

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(1000);

/// Fires a callback once per nominal interval on its own tokio task.
///
/// Each delay is shortened by the lateness of the previous fire, so the
/// number of ticks tracks wall-clock time instead of accumulating jitter.
/// If the host stalls for longer than one interval the missed ticks are
/// skipped, never replayed.
pub struct TickScheduler {
    interval: Duration,
    handle: Option<JoinHandle<()>>,
}

impl TickScheduler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.max(Duration::from_millis(1)),
            handle: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start ticking. A no-op while already running; the drift baseline of
    /// the existing tick stream is kept.
    pub fn start<F>(&mut self, on_tick: F)
    where
        F: FnMut() + Send + 'static,
    {
        if self.is_running() {
            debug!("Tick scheduler already running");
            return;
        }
        self.handle = Some(tokio::spawn(run(self.interval, on_tick)));
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for TickScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run<F: FnMut()>(interval: Duration, mut on_tick: F) {
    let mut expected = Instant::now() + interval;
    sleep(interval).await;

    loop {
        let now = Instant::now();
        let mut drift = now.saturating_duration_since(expected);

        if drift > interval {
            // Host was suspended: realign to the most recent boundary instead
            // of bursting ticks for time nobody worked.
            let missed = drift.as_nanos() / interval.as_nanos();
            let behind = drift.as_nanos() % interval.as_nanos();
            warn!(missed = missed as u64, ?drift, "Tick scheduler fell behind, skipping missed ticks");
            drift = Duration::from_nanos(behind as u64);
            expected = now - drift;
        }

        on_tick();

        expected += interval;
        sleep(interval.saturating_sub(drift)).await;
    }
}
