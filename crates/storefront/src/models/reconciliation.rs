//! Reconciliation queue entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use dietshop_core::{Email, UserId};

use super::entitlement::{EntitlementOwner, Grant};

/// Work that could not be persisted and must be replayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReconciliationTask {
    /// A confirmed payment whose grant was not written.
    Grant {
        owner: EntitlementOwner,
        grant: Grant,
    },
    /// A guest migration that did not complete.
    Transfer { user_id: UserId, email: Email },
}

impl ReconciliationTask {
    /// Short label for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Grant { .. } => "grant",
            Self::Transfer { .. } => "transfer",
        }
    }
}

/// A stored reconciliation task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueuedTask {
    pub id: Uuid,
    pub task: ReconciliationTask,
    pub last_error: String,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}
