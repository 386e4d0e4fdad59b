// Background loop driver: periodic wake plus a debounced manual trigger.
//
// A run in progress is never interrupted. Shutdown is only observed while
// the loop is waiting, so the current run (and its network call) completes.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Notify};
use tracing::debug;

use crate::retry::backoff_delay;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    /// Wake up at least this often.
    pub interval: Duration,
    /// Quiet period after a trigger before running.
    pub debounce: Duration,
}

impl Default for Schedule {
    fn default() -> Self {
        Self { interval: Duration::from_secs(60), debounce: Duration::from_millis(100) }
    }
}

/// What a single run reports back to the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Nothing left to do until the next wake.
    Idle,
    /// More work is queued; run again right away.
    MoreWork,
    /// The run hit a transient failure; retry after a backoff.
    Failed,
}

/// Cloneable handle that asks a loop to run soon.
#[derive(Debug, Clone, Default)]
pub struct Trigger {
    notify: Arc<Notify>,
}

impl Trigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fire(&self) {
        self.notify.notify_one();
    }

    async fn fired(&self) {
        self.notify.notified().await;
    }
}

enum Wake {
    Timer,
    Trigger,
    Shutdown,
}

/// Drive `job` until shutdown. The first run happens immediately.
pub async fn run_loop<F, Fut>(
    name: &'static str,
    schedule: Schedule,
    trigger: Trigger,
    mut shutdown_rx: broadcast::Receiver<()>,
    mut job: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = RunOutcome>,
{
    let mut consecutive_failures = 0u32;
    loop {
        let wait = match job().await {
            RunOutcome::Idle => {
                consecutive_failures = 0;
                schedule.interval
            }
            RunOutcome::MoreWork => {
                consecutive_failures = 0;
                Duration::ZERO
            }
            RunOutcome::Failed => {
                let delay = backoff_delay(consecutive_failures).min(schedule.interval);
                consecutive_failures = consecutive_failures.saturating_add(1);
                delay
            }
        };

        let wake = tokio::select! {
            _ = tokio::time::sleep(wait) => Wake::Timer,
            _ = trigger.fired() => Wake::Trigger,
            _ = shutdown_rx.recv() => Wake::Shutdown,
        };

        match wake {
            Wake::Timer => {}
            Wake::Trigger => {
                // Coalesce a burst of triggers into one run.
                let shutdown = tokio::select! {
                    _ = debounce(&trigger, schedule.debounce) => false,
                    _ = shutdown_rx.recv() => true,
                };
                if shutdown {
                    break;
                }
            }
            Wake::Shutdown => break,
        }
    }
    debug!(loop_name = name, "background loop stopped");
}

/// Wait until `window` passes with no further trigger.
async fn debounce(trigger: &Trigger, window: Duration) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(window) => return,
            _ = trigger.fired() => {}
        }
    }
}
