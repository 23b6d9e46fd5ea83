//! Background replay of the reconciliation queue.

use std::time::Duration;

use tokio::time::{MissedTickBehavior, interval};
use tracing::{error, info};

use crate::state::AppState;

/// Tasks replayed per tick.
pub const REPLAY_BATCH: u32 = 50;

/// Replay open grants and transfers every `period` until the runtime stops.
///
/// A slow tick delays the next one instead of stacking up behind it.
pub async fn run_reconcile_worker(state: AppState, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(period_secs = period.as_secs(), "Reconciliation worker started");

    loop {
        ticker.tick().await;

        match state.reconciliation().replay_open(REPLAY_BATCH).await {
            Ok(summary) if summary.resolved + summary.failed > 0 => {
                info!(
                    resolved = summary.resolved,
                    failed = summary.failed,
                    "Reconciliation pass finished"
                );
            }
            Ok(_) => {}
            Err(e) => {
                let event_id = sentry::capture_error(&e);
                error!(error = %e, sentry_event_id = %event_id, "Reconciliation pass failed");
            }
        }
    }
}
