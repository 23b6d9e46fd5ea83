//! Client-held record of an in-flight guest purchase.
//!
//! A [`PurchaseSession`] links one browser to one guest checkout before any
//! account exists. It is persisted in navigation-surviving client storage,
//! carried across the redirect to the payment processor and back, and
//! destroyed once its purchase has been migrated onto an account.
//!
//! The type is versioned: a persisted value whose `version` differs from
//! [`PurchaseSession::SCHEMA_VERSION`] is treated as unreadable rather than
//! guessed at.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::email::Email;
use super::id::{CheckoutSessionId, ProductId, PurchaseSessionId};
use super::product::{Product, ProductType};
use super::status::PurchaseStatus;

/// A status change that the session state machine does not allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid purchase session transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: PurchaseStatus,
    pub to: PurchaseStatus,
}

/// An ephemeral guest purchase, owned by the client until migrated or expired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseSession {
    version: u32,
    session_id: PurchaseSessionId,
    guest_email: Option<Email>,
    product_id: ProductId,
    product_title: String,
    product_price: Decimal,
    product_type: ProductType,
    status: PurchaseStatus,
    checkout_session_id: Option<CheckoutSessionId>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl PurchaseSession {
    /// Current persisted schema version.
    pub const SCHEMA_VERSION: u32 = 1;

    /// How long an unfinished session survives before it is discarded.
    #[must_use]
    pub fn default_ttl() -> Duration {
        Duration::hours(24)
    }

    /// Start a new guest purchase for `product`.
    #[must_use]
    pub fn new(product: &Product, guest_email: Option<Email>) -> Self {
        Self::new_at(product, guest_email, Utc::now())
    }

    /// Start a new guest purchase with an explicit creation time.
    #[must_use]
    pub fn new_at(product: &Product, guest_email: Option<Email>, now: DateTime<Utc>) -> Self {
        Self {
            version: Self::SCHEMA_VERSION,
            session_id: PurchaseSessionId::generate(),
            guest_email,
            product_id: product.id.clone(),
            product_title: product.title.clone(),
            product_price: product.price.amount,
            product_type: product.product_type,
            status: PurchaseStatus::Initiated,
            checkout_session_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub const fn version(&self) -> u32 {
        self.version
    }

    #[must_use]
    pub const fn session_id(&self) -> PurchaseSessionId {
        self.session_id
    }

    #[must_use]
    pub const fn guest_email(&self) -> Option<&Email> {
        self.guest_email.as_ref()
    }

    #[must_use]
    pub const fn product_id(&self) -> &ProductId {
        &self.product_id
    }

    #[must_use]
    pub fn product_title(&self) -> &str {
        &self.product_title
    }

    /// Price shown to the shopper. Display only; the server re-prices.
    #[must_use]
    pub const fn product_price(&self) -> Decimal {
        self.product_price
    }

    #[must_use]
    pub const fn product_type(&self) -> ProductType {
        self.product_type
    }

    #[must_use]
    pub const fn status(&self) -> PurchaseStatus {
        self.status
    }

    /// Processor correlation token, once checkout has been created.
    #[must_use]
    pub const fn checkout_session_id(&self) -> Option<&CheckoutSessionId> {
        self.checkout_session_id.as_ref()
    }

    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub const fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Whether this value was written by a compatible schema version.
    #[must_use]
    pub const fn is_current_version(&self) -> bool {
        self.version == Self::SCHEMA_VERSION
    }

    /// Whether the session is older than `ttl` at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now.signed_duration_since(self.created_at) > ttl
    }

    /// Record the processor's checkout session ID (the correlation token).
    pub fn attach_checkout(&mut self, checkout_session_id: CheckoutSessionId) {
        self.checkout_session_id = Some(checkout_session_id);
        self.updated_at = Utc::now();
    }

    /// `initiated -> redirected`.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] from any other state.
    pub fn mark_redirected(&mut self) -> Result<(), InvalidTransition> {
        self.transition(PurchaseStatus::Redirected)
    }

    /// `redirected -> confirmed`.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] from any other state.
    pub fn mark_confirmed(&mut self) -> Result<(), InvalidTransition> {
        self.transition(PurchaseStatus::Confirmed)
    }

    /// `initiated | redirected -> abandoned`.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] if the session is already terminal.
    pub fn mark_abandoned(&mut self) -> Result<(), InvalidTransition> {
        self.transition(PurchaseStatus::Abandoned)
    }

    fn transition(&mut self, to: PurchaseStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(to) {
            return Err(InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }
}
