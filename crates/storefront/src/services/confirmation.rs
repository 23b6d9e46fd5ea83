//! Payment confirmation handling.
//!
//! Processor callbacks are delivered at least once and may race each other,
//! the shopper's redirect, and guest migration. Correctness comes from the
//! add-if-absent grant, not from locking: every path below may run any
//! number of times for the same event and ends in the same state.

use std::future::Future;

use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use dietshop_core::{
    CheckoutMetadata, CheckoutStatus, Email, GrantOutcome, Price, ProductId, UserId,
};

use crate::db::{RepositoryError, Store};
use crate::models::{CheckoutRecord, EntitlementOwner, Grant, ReconciliationTask};
use crate::services::payments::{EventAction, PaymentEvent, SessionObject, SignatureError, WebhookVerifier};
use crate::services::retry::RetryPolicy;

/// Errors handling a confirmation callback.
#[derive(Debug, Error)]
pub enum ConfirmationError {
    /// Authentication failed. No state was read or written.
    #[error("invalid signature: {0}")]
    InvalidSignature(#[from] SignatureError),

    #[error("malformed event: {0}")]
    MalformedEvent(String),

    /// Payment is confirmed but the grant could not be written. The grant
    /// has been queued for reconciliation when `task_id` is set.
    #[error("grant failed for {checkout_session_id}: {reason}")]
    GrantFailed {
        checkout_session_id: String,
        task_id: Option<Uuid>,
        reason: String,
    },

    #[error(transparent)]
    Store(#[from] RepositoryError),
}

/// What a callback did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationOutcome {
    /// The product is (now) owned. `outcome` tells a first delivery from a
    /// redelivery.
    Granted {
        owner: EntitlementOwner,
        product_id: ProductId,
        outcome: GrantOutcome,
    },
    /// The processor reported a failed or expired payment.
    Rejected { reason: String },
    /// The checkout already reached a terminal status.
    AlreadyResolved(CheckoutStatus),
    /// Not an event this service acts on.
    Ignored { event_type: String },
}

/// The purchase as the grant path sees it: server-captured where possible.
struct Purchase {
    product_id: ProductId,
    price: Decimal,
    buyer_user_id: Option<UserId>,
    buyer_email: Email,
}

impl From<&CheckoutRecord> for Purchase {
    fn from(record: &CheckoutRecord) -> Self {
        Self {
            product_id: record.product_id.clone(),
            price: record.price,
            buyer_user_id: record.buyer_user_id.clone(),
            buyer_email: record.buyer_email.clone(),
        }
    }
}

impl From<CheckoutMetadata> for Purchase {
    fn from(metadata: CheckoutMetadata) -> Self {
        Self {
            product_id: metadata.product_id,
            price: metadata.product_price,
            buyer_user_id: metadata.buyer_user_id,
            buyer_email: metadata.buyer_email,
        }
    }
}

/// Handles signed confirmation callbacks.
pub struct ConfirmationHandler<'a> {
    verifier: &'a WebhookVerifier,
    store: &'a dyn Store,
    policy: RetryPolicy,
}

impl<'a> ConfirmationHandler<'a> {
    #[must_use]
    pub fn new(verifier: &'a WebhookVerifier, store: &'a dyn Store, policy: RetryPolicy) -> Self {
        Self {
            verifier,
            store,
            policy,
        }
    }

    /// Verify and apply one callback.
    ///
    /// # Errors
    ///
    /// - `InvalidSignature` / `MalformedEvent`: reject the delivery.
    /// - `GrantFailed`: the payment is confirmed but unfulfilled; the
    ///   caller must answer with a server error so the processor redelivers.
    /// - `Store`: a read failed or timed out before anything was written.
    #[instrument(skip_all, fields(event_id = tracing::field::Empty))]
    pub async fn handle(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> Result<ConfirmationOutcome, ConfirmationError> {
        if let Err(e) = self.verifier.verify(payload, signature) {
            warn!(security = true, error = %e, "Rejected payment callback signature");
            return Err(e.into());
        }

        let event = PaymentEvent::from_slice(payload)
            .map_err(|e| ConfirmationError::MalformedEvent(e.to_string()))?;
        let session = event.session();
        tracing::Span::current().record("event_id", event.id.as_str());

        let action = event.action();
        if action == EventAction::Ignore {
            info!(event_type = %event.event_type, "Ignoring payment event");
            return Ok(ConfirmationOutcome::Ignored {
                event_type: event.event_type.clone(),
            });
        }

        let record = self
            .read("get_checkout", || self.store.get_checkout(&session.id))
            .await?;
        if let Some(record) = &record
            && record.status.is_terminal()
        {
            info!(
                checkout_session_id = %session.id,
                status = record.status.as_str(),
                "Checkout already resolved"
            );
            return Ok(ConfirmationOutcome::AlreadyResolved(record.status));
        }

        match action {
            EventAction::Reject => self.reject(session, record.is_some(), &event.event_type).await,
            EventAction::Grant => self.grant(session, record.as_ref()).await,
            EventAction::Ignore => Ok(ConfirmationOutcome::Ignored {
                event_type: event.event_type.clone(),
            }),
        }
    }

    async fn reject(
        &self,
        session: &SessionObject,
        has_record: bool,
        event_type: &str,
    ) -> Result<ConfirmationOutcome, ConfirmationError> {
        if has_record {
            self.store
                .resolve_checkout(&session.id, CheckoutStatus::Rejected)
                .await?;
        }
        info!(checkout_session_id = %session.id, event_type, "Payment not completed");
        Ok(ConfirmationOutcome::Rejected {
            reason: event_type.to_string(),
        })
    }

    async fn grant(
        &self,
        session: &SessionObject,
        record: Option<&CheckoutRecord>,
    ) -> Result<ConfirmationOutcome, ConfirmationError> {
        let purchase = Self::purchase(session, record)?;
        let owner = self.resolve_owner(&purchase).await?;
        let grant = Grant {
            product_id: purchase.product_id.clone(),
            price: purchase.price,
            email: purchase.buyer_email.clone(),
            checkout_session_id: Some(session.id.clone()),
        };

        let granted = self
            .policy
            .run("grant", || self.store.grant(&owner, &grant))
            .await;
        let outcome = match granted {
            Ok(outcome) => outcome,
            Err(exhausted) => {
                let task = ReconciliationTask::Grant {
                    owner: owner.clone(),
                    grant,
                };
                let task_id = self.queue(&task, &exhausted.last_error).await;
                let event_id = sentry::capture_error(&exhausted);
                error!(
                    checkout_session_id = %session.id,
                    owner = %owner,
                    product_id = %purchase.product_id,
                    task_id = ?task_id,
                    sentry_event_id = %event_id,
                    error = %exhausted,
                    "Paid purchase could not be granted"
                );
                return Err(ConfirmationError::GrantFailed {
                    checkout_session_id: session.id.to_string(),
                    task_id,
                    reason: exhausted.last_error,
                });
            }
        };

        if let EntitlementOwner::Guest(email) = &owner {
            self.follow_link(email).await;
        }

        if record.is_some()
            && let Err(e) = self
                .store
                .resolve_checkout(&session.id, CheckoutStatus::Granted)
                .await
        {
            // The grant is durable; a redelivery will resolve it.
            warn!(checkout_session_id = %session.id, error = %e, "Failed to resolve checkout");
        }

        info!(
            checkout_session_id = %session.id,
            owner = %owner,
            product_id = %purchase.product_id,
            new = outcome.is_new(),
            "Entitlement granted"
        );

        Ok(ConfirmationOutcome::Granted {
            owner,
            product_id: purchase.product_id,
            outcome,
        })
    }

    /// Pick the facts to grant from. The checkout record wins over anything
    /// echoed in the callback.
    fn purchase(
        session: &SessionObject,
        record: Option<&CheckoutRecord>,
    ) -> Result<Purchase, ConfirmationError> {
        let metadata = CheckoutMetadata::from_map(&session.metadata);

        let Some(record) = record else {
            let metadata =
                metadata.map_err(|e| ConfirmationError::MalformedEvent(e.to_string()))?;
            warn!(
                checkout_session_id = %session.id,
                "No checkout record; granting from signed metadata"
            );
            return Ok(metadata.into());
        };

        if let Ok(metadata) = &metadata
            && (metadata.product_id != record.product_id
                || metadata.product_price != record.price)
        {
            warn!(
                security = true,
                checkout_session_id = %session.id,
                metadata_product = %metadata.product_id,
                metadata_price = %metadata.product_price,
                record_product = %record.product_id,
                record_price = %record.price,
                "Callback metadata differs from checkout record"
            );
        }

        let expected_minor = Price::new(record.price, record.currency).to_minor_units();
        if let Some(charged) = session.amount_total
            && Some(charged) != expected_minor
        {
            warn!(
                security = true,
                checkout_session_id = %session.id,
                charged,
                expected = ?expected_minor,
                "Charged amount differs from checkout record"
            );
        }

        Ok(record.into())
    }

    /// Signed-in buyer, else a linked account, else the guest email.
    async fn resolve_owner(&self, purchase: &Purchase) -> Result<EntitlementOwner, ConfirmationError> {
        if let Some(user_id) = &purchase.buyer_user_id {
            return Ok(EntitlementOwner::Customer(user_id.clone()));
        }
        let link = self
            .read("guest_link", || self.store.guest_link(&purchase.buyer_email))
            .await?;
        match link {
            Some(user_id) => Ok(EntitlementOwner::Customer(user_id)),
            None => Ok(EntitlementOwner::Guest(purchase.buyer_email.clone())),
        }
    }

    /// Migration may have linked the email between the owner lookup and the
    /// pending write. Merge now so the grant does not sit under the email.
    async fn follow_link(&self, email: &Email) {
        let user_id = match self.read("guest_link", || self.store.guest_link(email)).await {
            Ok(Some(user_id)) => user_id,
            Ok(None) => return,
            Err(e) => {
                warn!(email = %email, error = %e, "Failed to re-check guest link");
                return;
            }
        };

        let merged = self
            .policy
            .run("merge_pending", || self.store.merge_pending(email, &user_id))
            .await;
        match merged {
            Ok(report) => info!(
                user_id = %user_id,
                transferred = report.transferred.len(),
                "Merged guest grant into linked account"
            ),
            Err(exhausted) => {
                let task = ReconciliationTask::Transfer {
                    user_id: user_id.clone(),
                    email: email.clone(),
                };
                let task_id = self.queue(&task, &exhausted.last_error).await;
                warn!(
                    user_id = %user_id,
                    task_id = ?task_id,
                    error = %exhausted,
                    "Guest grant left pending; transfer queued"
                );
            }
        }
    }

    /// A store read bounded by the retry policy. Exhaustion surfaces as
    /// `Unavailable` so the callback fails and the processor redelivers.
    async fn read<T, F, Fut>(&self, operation: &'static str, op: F) -> Result<T, ConfirmationError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RepositoryError>>,
    {
        self.policy
            .run(operation, op)
            .await
            .map_err(|exhausted| RepositoryError::Unavailable(exhausted.to_string()).into())
    }

    async fn queue(&self, task: &ReconciliationTask, reason: &str) -> Option<Uuid> {
        match self.store.enqueue(task, reason).await {
            Ok(id) => Some(id),
            Err(e) => {
                let event_id = sentry::capture_error(&e);
                error!(
                    task = ?task,
                    error = %e,
                    sentry_event_id = %event_id,
                    "Failed to queue reconciliation task"
                );
                None
            }
        }
    }
}
