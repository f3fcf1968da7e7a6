//! Cooperative driver for the speculative scheduler.
//!
//! The scheduler itself is synchronous and single-owner; this loop gives it
//! its ticks: deferred cascades run, proof deadlines are swept, and newly
//! speculatable tasks drain to the caller's handler.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use vigil_speculation::SpeculativeScheduler;
use vigil_types::TaskPda;

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Drive the scheduler until cancelled.
///
/// Each interval: sweep proof timeouts, run one cooperative tick, and hand
/// any newly speculatable tasks to `on_ready`.
pub async fn run_scheduler(
    scheduler: Arc<Mutex<SpeculativeScheduler>>,
    tick_interval: Duration,
    cancel: CancellationToken,
    mut on_ready: impl FnMut(Vec<TaskPda>) + Send,
) {
    let mut interval = tokio::time::interval(tick_interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // One final tick so already-queued cascades land.
                let mut scheduler = scheduler.lock().await;
                scheduler.tick();
                debug!("scheduler driver stopping");
                return;
            }
            _ = interval.tick() => {
                let mut scheduler = scheduler.lock().await;
                let timed_out = scheduler.check_proof_timeouts(now_ms());
                if !timed_out.is_empty() {
                    debug!(count = timed_out.len(), "proof timeouts failed");
                }
                scheduler.tick();
                let ready = scheduler.drain_ready();
                drop(scheduler);
                if !ready.is_empty() {
                    on_ready(ready);
                }
            }
        }
    }
}
