//! Guest migration: moving email-keyed purchases onto an account.
//!
//! The link is recorded before the merge. A confirmation that lands after
//! the link resolves straight to the account; one that lands between the
//! link and the merge is picked up by the merge; one that lands before the
//! link is already pending and gets merged. Every ordering converges.

use thiserror::Error;
use tracing::{error, info, instrument, warn};

use dietshop_core::{Email, MergeReport, TransferState, UserId};

use crate::db::Store;
use crate::models::ReconciliationTask;
use crate::services::auth::{AuthError, AuthProvider, Identity};
use crate::services::retry::{RetryExhausted, RetryPolicy};

/// A guest transfer that did not complete.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("could not record guest link: {0}")]
    Link(RetryExhausted),

    #[error("could not merge guest purchases: {0}")]
    Merge(RetryExhausted),
}

/// Result of creating or signing in to an account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Onboarding {
    pub identity: Identity,
    pub transfer: TransferState,
}

/// Re-keys guest purchases onto accounts.
pub struct AccountLinkingService<'a> {
    store: &'a dyn Store,
    policy: RetryPolicy,
}

impl<'a> AccountLinkingService<'a> {
    #[must_use]
    pub fn new(store: &'a dyn Store, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    /// Link `email` to `user_id` and merge any pending guest grants.
    ///
    /// Idempotent: products the account already owns are reported in
    /// `already_owned` and not counted again.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError`] when either step exhausts its retries.
    #[instrument(skip_all, fields(user_id = %user_id))]
    pub async fn link(&self, user_id: &UserId, email: &Email) -> Result<MergeReport, TransferError> {
        self.policy
            .run("record_guest_link", || {
                self.store.record_guest_link(email, user_id)
            })
            .await
            .map_err(TransferError::Link)?;

        let report = self
            .policy
            .run("merge_pending", || self.store.merge_pending(email, user_id))
            .await
            .map_err(TransferError::Merge)?;

        if !report.already_owned.is_empty() {
            warn!(
                already_owned = ?report.already_owned,
                "Guest purchase duplicates an owned product; possible double payment"
            );
        }
        info!(
            transferred = report.transferred.len(),
            "Guest purchases linked"
        );
        Ok(report)
    }

    /// [`link`](Self::link), queueing the transfer for reconciliation on
    /// failure instead of returning an error.
    pub async fn transfer_or_queue(&self, user_id: &UserId, email: &Email) -> TransferState {
        match self.link(user_id, email).await {
            Ok(report) => TransferState::Completed {
                transferred: report.transferred,
                already_owned: report.already_owned,
            },
            Err(e) => {
                let task = ReconciliationTask::Transfer {
                    user_id: user_id.clone(),
                    email: email.clone(),
                };
                match self.store.enqueue(&task, &e.to_string()).await {
                    Ok(task_id) => {
                        warn!(user_id = %user_id, %task_id, error = %e, "Guest transfer queued");
                    }
                    Err(queue_err) => {
                        let event_id = sentry::capture_error(&queue_err);
                        error!(
                            user_id = %user_id,
                            error = %e,
                            queue_error = %queue_err,
                            sentry_event_id = %event_id,
                            "Guest transfer failed and could not be queued"
                        );
                    }
                }
                TransferState::Queued {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Create an account, then migrate its email's guest purchases.
    ///
    /// A failed transfer never fails account creation.
    ///
    /// # Errors
    ///
    /// Returns the auth provider's error if the account cannot be created.
    pub async fn register(
        &self,
        auth: &dyn AuthProvider,
        email: &str,
        password: &str,
    ) -> Result<Onboarding, AuthError> {
        let identity = auth.create_account(email, password).await?;
        let transfer = self
            .transfer_or_queue(&identity.user_id, &identity.email)
            .await;
        Ok(Onboarding { identity, transfer })
    }

    /// Authenticate, then migrate any guest purchases made under the
    /// account's email since the last sign-in.
    ///
    /// # Errors
    ///
    /// Returns the auth provider's error if the credentials are rejected.
    pub async fn sign_in(
        &self,
        auth: &dyn AuthProvider,
        email: &str,
        password: &str,
    ) -> Result<Onboarding, AuthError> {
        let identity = auth.authenticate(email, password).await?;
        let transfer = self
            .transfer_or_queue(&identity.user_id, &identity.email)
            .await;
        Ok(Onboarding { identity, transfer })
    }
}
