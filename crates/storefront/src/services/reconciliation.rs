//! Replay of queued grants and transfers, plus manual admin grants.

use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{info, instrument, warn};

use dietshop_core::{CheckoutStatus, Email, GrantOutcome, ProductId, UserId};

use crate::db::{RepositoryError, Store};
use crate::models::{EntitlementOwner, Grant, QueuedTask, ReconciliationTask};
use crate::services::linking::{AccountLinkingService, TransferError};
use crate::services::retry::RetryPolicy;

/// Why a queued task could not be replayed.
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error(transparent)]
    Store(#[from] RepositoryError),

    #[error(transparent)]
    Transfer(#[from] TransferError),
}

/// Counts from one replay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub resolved: usize,
    pub failed: usize,
}

/// Drains the reconciliation queue.
pub struct ReconciliationService<'a> {
    store: &'a dyn Store,
    policy: RetryPolicy,
}

impl<'a> ReconciliationService<'a> {
    #[must_use]
    pub fn new(store: &'a dyn Store, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    /// Unresolved tasks, oldest first.
    ///
    /// # Errors
    ///
    /// Returns a store error if the queue cannot be read.
    pub async fn open_tasks(&self, limit: u32) -> Result<Vec<QueuedTask>, RepositoryError> {
        self.store.open_tasks(limit).await
    }

    /// Replay up to `limit` open tasks. Failures stay open with their
    /// attempt count bumped.
    ///
    /// # Errors
    ///
    /// Returns a store error only if the queue itself cannot be read or
    /// updated.
    #[instrument(skip(self))]
    pub async fn replay_open(&self, limit: u32) -> Result<ReplaySummary, RepositoryError> {
        let mut summary = ReplaySummary::default();

        for queued in self.store.open_tasks(limit).await? {
            match self.replay(&queued.task).await {
                Ok(()) => {
                    self.store.mark_resolved(queued.id).await?;
                    info!(task_id = %queued.id, kind = queued.task.kind(), "Reconciliation task resolved");
                    summary.resolved += 1;
                }
                Err(e) => {
                    self.store.record_failure(queued.id, &e.to_string()).await?;
                    warn!(
                        task_id = %queued.id,
                        kind = queued.task.kind(),
                        attempts = queued.attempts + 1,
                        error = %e,
                        "Reconciliation task still failing"
                    );
                    summary.failed += 1;
                }
            }
        }

        Ok(summary)
    }

    /// Apply one task. Safe to repeat.
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError`] if the underlying write fails.
    pub async fn replay(&self, task: &ReconciliationTask) -> Result<(), ReplayError> {
        match task {
            ReconciliationTask::Grant { owner, grant } => {
                let owner = self.current_owner(owner).await?;
                self.store.grant(&owner, grant).await?;

                if let EntitlementOwner::Guest(email) = &owner
                    && let Some(user_id) = self.store.guest_link(email).await?
                {
                    self.store.merge_pending(email, &user_id).await?;
                }

                if let Some(checkout_session_id) = &grant.checkout_session_id {
                    self.store
                        .resolve_checkout(checkout_session_id, CheckoutStatus::Granted)
                        .await?;
                }
                Ok(())
            }
            ReconciliationTask::Transfer { user_id, email } => {
                AccountLinkingService::new(self.store, self.policy)
                    .link(user_id, email)
                    .await?;
                Ok(())
            }
        }
    }

    /// Grant a product to an account by hand.
    ///
    /// Goes through the same add-if-absent write as a paid confirmation, so
    /// racing a redelivered callback is harmless.
    ///
    /// # Errors
    ///
    /// Returns a store error if the write fails.
    #[instrument(skip(self, email, price))]
    pub async fn manual_grant(
        &self,
        user_id: &UserId,
        email: &Email,
        product_id: &ProductId,
        price: Decimal,
    ) -> Result<GrantOutcome, RepositoryError> {
        let grant = Grant {
            product_id: product_id.clone(),
            price,
            email: email.clone(),
            checkout_session_id: None,
        };
        let outcome = self
            .store
            .grant(&EntitlementOwner::Customer(user_id.clone()), &grant)
            .await?;

        info!(admin = true, new = outcome.is_new(), "Manual grant applied");
        Ok(outcome)
    }

    /// A guest owner whose email has since been linked now means the account.
    async fn current_owner(
        &self,
        owner: &EntitlementOwner,
    ) -> Result<EntitlementOwner, RepositoryError> {
        if let EntitlementOwner::Guest(email) = owner
            && let Some(user_id) = self.store.guest_link(email).await?
        {
            return Ok(EntitlementOwner::Customer(user_id));
        }
        Ok(owner.clone())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::db::{AccountStore, EntitlementStore, MemoryStore, ReconciliationStore};

    fn policy() -> RetryPolicy {
        RetryPolicy::once(Duration::from_secs(1))
    }

    fn email() -> Email {
        Email::parse("a@x.com").unwrap()
    }

    fn grant_task(owner: EntitlementOwner) -> ReconciliationTask {
        ReconciliationTask::Grant {
            owner,
            grant: Grant {
                product_id: ProductId::new("course_7"),
                price: Decimal::new(49, 0),
                email: email(),
                checkout_session_id: None,
            },
        }
    }

    #[tokio::test]
    async fn test_replay_resolves_grant() {
        let store = MemoryStore::new();
        let task = grant_task(EntitlementOwner::Customer(UserId::new("u2")));
        store.enqueue(&task, "timeout").await.unwrap();

        let summary = ReconciliationService::new(&store, policy())
            .replay_open(10)
            .await
            .unwrap();

        assert_eq!(summary, ReplaySummary { resolved: 1, failed: 0 });
        assert!(store.open_tasks(10).await.unwrap().is_empty());
        let customer = store.get_customer(&UserId::new("u2")).await.unwrap().unwrap();
        assert!(customer.entitlements.contains(&ProductId::new("course_7")));
    }

    #[tokio::test]
    async fn test_failed_replay_stays_open() {
        let store = MemoryStore::new();
        store
            .enqueue(&grant_task(EntitlementOwner::Customer(UserId::new("u2"))), "timeout")
            .await
            .unwrap();
        store.fail_next_grants(1);

        let summary = ReconciliationService::new(&store, policy())
            .replay_open(10)
            .await
            .unwrap();

        assert_eq!(summary, ReplaySummary { resolved: 0, failed: 1 });
        let open = store.open_tasks(10).await.unwrap();
        assert_eq!(open[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_guest_grant_follows_later_link() {
        let store = MemoryStore::new();
        store.record_guest_link(&email(), &UserId::new("u1")).await.unwrap();

        ReconciliationService::new(&store, policy())
            .replay(&grant_task(EntitlementOwner::Guest(email())))
            .await
            .unwrap();

        assert!(store.pending_for_email(&email()).await.unwrap().is_empty());
        let customer = store.get_customer(&UserId::new("u1")).await.unwrap().unwrap();
        assert!(customer.entitlements.contains(&ProductId::new("course_7")));
    }

    #[tokio::test]
    async fn test_manual_grant_is_idempotent() {
        let store = MemoryStore::new();
        let service = ReconciliationService::new(&store, policy());
        let (user, product) = (UserId::new("u2"), ProductId::new("course_7"));

        let first = service
            .manual_grant(&user, &email(), &product, Decimal::new(49, 0))
            .await
            .unwrap();
        let second = service
            .manual_grant(&user, &email(), &product, Decimal::new(49, 0))
            .await
            .unwrap();

        assert_eq!(first, GrantOutcome::Granted);
        assert_eq!(second, GrantOutcome::AlreadyOwned);
        let customer = store.get_customer(&user).await.unwrap().unwrap();
        assert_eq!(customer.entitlements.total_purchases(), 1);
    }
}
