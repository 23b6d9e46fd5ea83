//! Reconciliation queue commands.
//!
//! # Usage
//!
//! ```bash
//! # Show open grants and transfers
//! dietshop reconcile list --limit 20
//!
//! # Replay open tasks now
//! dietshop reconcile retry
//! ```

use dietshop_storefront::services::reconciliation::ReconciliationService;
use dietshop_storefront::services::retry::RetryPolicy;

use super::{CommandError, store};

/// Print open reconciliation tasks, oldest first.
///
/// # Errors
///
/// Returns an error if the queue cannot be read.
pub async fn list(limit: u32) -> Result<(), CommandError> {
    let store = store().await?;
    let tasks = ReconciliationService::new(&store, RetryPolicy::default())
        .open_tasks(limit)
        .await?;

    #[allow(clippy::print_stdout)]
    {
        if tasks.is_empty() {
            println!("No open reconciliation tasks.");
        }
        for queued in &tasks {
            println!(
                "{}  {:<8}  attempts={}  created={}  error={}",
                queued.id,
                queued.task.kind(),
                queued.attempts,
                queued.created_at.format("%Y-%m-%d %H:%M:%S"),
                queued.last_error,
            );
        }
    }
    Ok(())
}

/// Replay up to `limit` open tasks.
///
/// # Errors
///
/// Returns an error if the queue cannot be read or updated.
pub async fn retry(limit: u32) -> Result<(), CommandError> {
    let store = store().await?;
    let summary = ReconciliationService::new(&store, RetryPolicy::default())
        .replay_open(limit)
        .await?;

    tracing::info!(
        resolved = summary.resolved,
        failed = summary.failed,
        "Reconciliation replay finished"
    );
    Ok(())
}
