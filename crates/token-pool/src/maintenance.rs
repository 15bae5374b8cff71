//! Periodic background work
//!
//! One task runs three independent tickers: quota reset, ledger flush, and
//! queue drain. None of them sits on the request path.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::dispatch::Dispatcher;
use crate::ledger::Ledger;

/// Tick intervals for the maintenance task.
#[derive(Debug, Clone)]
pub struct MaintenanceIntervals {
    pub reset: Duration,
    pub flush: Duration,
    pub drain: Duration,
}

impl Default for MaintenanceIntervals {
    fn default() -> Self {
        Self {
            reset: Duration::from_secs(3600),
            flush: Duration::from_secs(60),
            drain: Duration::from_secs(5),
        }
    }
}

/// Spawn the maintenance task. Abort the returned handle to stop it.
pub fn spawn_maintenance(
    dispatcher: Arc<Dispatcher>,
    intervals: MaintenanceIntervals,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut reset = tokio::time::interval(intervals.reset);
        let mut flush = tokio::time::interval(intervals.flush);
        let mut drain = tokio::time::interval(intervals.drain);
        // Skip the immediate first ticks; the ledger was just loaded
        reset.tick().await;
        flush.tick().await;
        drain.tick().await;

        loop {
            tokio::select! {
                _ = reset.tick() => {
                    let count = reset_cycle(dispatcher.ledger(), Utc::now()).await;
                    if count > 0 {
                        info!(credentials = count, "quota reset cycle complete");
                    }
                }
                _ = flush.tick() => {
                    if let Err(e) = dispatcher.ledger().snapshot_all().await {
                        warn!(error = %e, "periodic ledger flush failed, will retry next cycle");
                    }
                }
                _ = drain.tick() => {
                    drain_cycle(&dispatcher);
                }
            }
        }
    })
}

/// Reset every credential whose billing period rolls over at `now`.
///
/// Returns how many were reset.
pub async fn reset_cycle(ledger: &Ledger, now: DateTime<Utc>) -> usize {
    let mut count = 0;
    for id in ledger.ids() {
        if ledger.reset_if_due(&id, now).await {
            count += 1;
        }
    }
    count
}

/// Redrive queued requests while credentials are free to take them.
fn drain_cycle(dispatcher: &Arc<Dispatcher>) {
    let mut redriven = 0;
    while dispatcher.drain_one() {
        redriven += 1;
        // Each redrive claims its slot asynchronously; stop at one per free credential
        if redriven >= dispatcher.pool().len().max(1) {
            break;
        }
    }
    if redriven > 0 {
        debug!(redriven, remaining = dispatcher.queue().len(), "drained pending queue");
    }
}
