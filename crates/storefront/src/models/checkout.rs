//! Checkout record captured at initiation.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use dietshop_core::{CheckoutSessionId, CheckoutStatus, CurrencyCode, Email, ProductId, UserId};

/// Server-validated facts about one processor checkout session.
///
/// The confirmation handler trusts `price` from here, never from the
/// processor callback or the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckoutRecord {
    pub checkout_session_id: CheckoutSessionId,
    pub product_id: ProductId,
    pub price: Decimal,
    pub currency: CurrencyCode,
    pub buyer_user_id: Option<UserId>,
    pub buyer_email: Email,
    pub status: CheckoutStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}
