//! Grant targets and the grant payload.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use dietshop_core::{CheckoutSessionId, Email, ProductId, UserId};

/// Who a grant is recorded against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "key", rename_all = "snake_case")]
pub enum EntitlementOwner {
    /// An account, keyed by its auth-provider identity.
    Customer(UserId),
    /// A guest, keyed by normalized email until migrated.
    Guest(Email),
}

impl std::fmt::Display for EntitlementOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Customer(id) => write!(f, "customer:{id}"),
            Self::Guest(email) => write!(f, "guest:{email}"),
        }
    }
}

/// One product grant, priced from the server-captured checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    pub product_id: ProductId,
    pub price: Decimal,
    /// Buyer email; used to create the customer document on first grant.
    pub email: Email,
    pub checkout_session_id: Option<CheckoutSessionId>,
}

/// An email-keyed guest grant awaiting migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingEntitlement {
    pub email: Email,
    pub product_id: ProductId,
    pub price: Decimal,
    pub checkout_session_id: Option<CheckoutSessionId>,
    pub granted_at: DateTime<Utc>,
}
