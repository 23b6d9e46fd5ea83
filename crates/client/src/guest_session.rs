//! The browser's one live guest purchase.
//!
//! A guest has no account to hang a pending checkout on, so the checkout is
//! remembered in local storage under [`SESSION_KEY`]. Starting another
//! checkout overwrites it: a shopper who restarts has abandoned the first
//! attempt, and there is never more than one session to reconcile.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use dietshop_core::{
    AccountResponse, CheckoutSessionId, Email, Product, PurchaseSession, TransferState, UserId,
};

use crate::error::ClientError;
use crate::storage::LocalStorage;

/// Storage key of the live purchase session.
pub const SESSION_KEY: &str = "dietshop.purchase_session";

/// The server side of guest migration.
#[async_trait]
pub trait AccountLinker: Send + Sync {
    /// Move purchases recorded under `email` (the account's own email when
    /// `None`) onto the signed-in account.
    async fn transfer_guest_purchase(
        &self,
        email: Option<&Email>,
    ) -> Result<AccountResponse, ClientError>;
}

/// How a guest purchase hand-off ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handoff {
    /// The server moved (or queued moving) the purchase onto the account.
    Transferred(TransferState),
    /// The account's email differs from the guest email, so the server
    /// refused the transfer. The purchase stays with the guest email until
    /// an account with that email signs in.
    EmailMismatch { guest_email: Option<Email> },
}

/// Owns the persisted [`PurchaseSession`].
pub struct GuestSessionManager<S> {
    storage: S,
    ttl: Duration,
}

impl<S: LocalStorage> GuestSessionManager<S> {
    /// Manager with the default 24 hour session lifetime.
    pub fn new(storage: S) -> Self {
        Self::with_ttl(storage, PurchaseSession::default_ttl())
    }

    pub const fn with_ttl(storage: S, ttl: Duration) -> Self {
        Self { storage, ttl }
    }

    /// Start a purchase, replacing any session already live.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the session cannot be persisted.
    pub fn create(
        &self,
        product: &Product,
        guest_email: Option<Email>,
    ) -> Result<PurchaseSession, ClientError> {
        if let Some(previous) = self.get()? {
            debug!(
                session_id = %previous.session_id(),
                status = %previous.status(),
                "Replacing guest purchase session"
            );
        }

        let session = PurchaseSession::new(product, guest_email);
        self.save(&session)?;
        Ok(session)
    }

    /// The live session, if any.
    ///
    /// Expired, unreadable and other-version values are discarded and read
    /// as absent.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the backend cannot be read.
    pub fn get(&self) -> Result<Option<PurchaseSession>, ClientError> {
        self.get_at(Utc::now())
    }

    /// [`get`](Self::get) evaluated at `now`.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the backend cannot be read.
    pub fn get_at(&self, now: DateTime<Utc>) -> Result<Option<PurchaseSession>, ClientError> {
        let Some(raw) = self.storage.get(SESSION_KEY)? else {
            return Ok(None);
        };

        let session = match serde_json::from_str::<PurchaseSession>(&raw) {
            Ok(session) if session.is_current_version() => session,
            Ok(session) => {
                warn!(version = session.version(), "Discarding purchase session from another version");
                self.clear()?;
                return Ok(None);
            }
            Err(e) => {
                warn!(error = %e, "Discarding unreadable purchase session");
                self.clear()?;
                return Ok(None);
            }
        };

        if session.is_expired_at(now, self.ttl) {
            debug!(session_id = %session.session_id(), "Purchase session expired");
            self.clear()?;
            return Ok(None);
        }

        Ok(Some(session))
    }

    /// Record the processor's checkout session on the live session.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NoSession`] if nothing is live.
    pub fn attach_checkout(
        &self,
        checkout_session_id: CheckoutSessionId,
    ) -> Result<PurchaseSession, ClientError> {
        self.modify(|session| {
            session.attach_checkout(checkout_session_id);
            Ok(())
        })
    }

    /// `initiated -> redirected`, just before leaving for the processor.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NoSession`] if nothing is live, or a
    /// transition error if the session is not `initiated`.
    pub fn mark_redirected(&self) -> Result<PurchaseSession, ClientError> {
        self.modify(|session| session.mark_redirected().map_err(ClientError::from))
    }

    /// `redirected -> confirmed`, once the product shows up as owned.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NoSession`] if nothing is live, or a
    /// transition error if the session is not `redirected`.
    pub fn mark_confirmed(&self) -> Result<PurchaseSession, ClientError> {
        self.modify(|session| session.mark_confirmed().map_err(ClientError::from))
    }

    /// Forget the live session.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the backend cannot be written.
    pub fn clear(&self) -> Result<(), ClientError> {
        self.storage.remove(SESSION_KEY)?;
        Ok(())
    }

    /// Hand the guest purchase to a newly signed-in account, then forget it.
    ///
    /// Returns `None` when there is no live session. The session survives a
    /// failed call so the hand-off can be retried; a transfer the server
    /// queued counts as handed off. A refusal (403) can never succeed from
    /// this session, so it is forgotten as well.
    ///
    /// # Errors
    ///
    /// Returns the linker's error, or a storage error.
    pub async fn transfer_purchases_to_user(
        &self,
        linker: &dyn AccountLinker,
        user_id: &UserId,
    ) -> Result<Option<Handoff>, ClientError> {
        let Some(session) = self.get()? else {
            return Ok(None);
        };

        let response = match linker.transfer_guest_purchase(session.guest_email()).await {
            Ok(response) => response,
            Err(ClientError::Status { status: 403, .. }) => {
                self.clear()?;
                warn!(
                    session_id = %session.session_id(),
                    user_id = %user_id,
                    "Guest email does not match the account; dropping purchase session"
                );
                return Ok(Some(Handoff::EmailMismatch {
                    guest_email: session.guest_email().cloned(),
                }));
            }
            Err(e) => return Err(e),
        };
        if response.user_id != *user_id {
            warn!(
                expected = %user_id,
                actual = %response.user_id,
                "Guest purchase transferred to a different account than expected"
            );
        }

        self.clear()?;
        info!(
            session_id = %session.session_id(),
            product_id = %session.product_id(),
            "Guest purchase handed to account"
        );
        Ok(Some(Handoff::Transferred(response.transfer)))
    }

    fn save(&self, session: &PurchaseSession) -> Result<(), ClientError> {
        let json = serde_json::to_string(session)
            .map_err(|e| crate::error::StorageError::Corrupt(e.to_string()))?;
        self.storage.set(SESSION_KEY, &json)?;
        Ok(())
    }

    fn modify(
        &self,
        change: impl FnOnce(&mut PurchaseSession) -> Result<(), ClientError>,
    ) -> Result<PurchaseSession, ClientError> {
        let mut session = self.get()?.ok_or(ClientError::NoSession)?;
        change(&mut session)?;
        self.save(&session)?;
        Ok(session)
    }
}
