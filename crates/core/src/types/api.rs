//! JSON bodies exchanged between the storefront server and its client.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::email::Email;
use super::id::{CheckoutSessionId, ProductId, UserId};

/// `POST /api/checkout` request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartCheckout {
    pub product_id: ProductId,
    /// Price the shopper was shown. Rejected if it no longer matches the catalog.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_price: Option<Decimal>,
    /// Required when the caller is not signed in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest_email: Option<Email>,
}

/// Where to send the shopper to pay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutRedirect {
    pub checkout_session_id: CheckoutSessionId,
    pub redirect_url: String,
}

/// `POST /auth/register` and `POST /auth/login` request body.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// `POST /api/account/transfer-guest-purchase` request body.
///
/// `email` defaults to the signed-in account's own address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferGuestPurchase {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<Email>,
}

/// State of the guest-purchase transfer attached to an account response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TransferState {
    /// Guest purchases were re-keyed onto the account.
    Completed {
        transferred: Vec<ProductId>,
        already_owned: Vec<ProductId>,
    },
    /// The transfer failed and was queued for reconciliation.
    Queued { reason: String },
}

/// Response for account creation, sign-in and explicit transfers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountResponse {
    pub user_id: UserId,
    pub email: Email,
    pub transfer: TransferState,
}
