//! Manual entitlement grant.
//!
//! # Usage
//!
//! ```bash
//! dietshop grant --user 7f0c... --email a@x.com --product diet_42 --price 99
//! ```
//!
//! Uses the same add-if-absent write as a paid confirmation, so granting a
//! product the account already owns changes nothing.

use rust_decimal::Decimal;

use dietshop_core::{Email, GrantOutcome, ProductId, UserId};
use dietshop_storefront::services::reconciliation::ReconciliationService;
use dietshop_storefront::services::retry::RetryPolicy;

use super::{CommandError, store};

/// Grant `product` to `user`.
///
/// # Errors
///
/// Returns an error for an invalid email or negative price, or if the write
/// fails.
pub async fn grant(
    user: &str,
    email: &str,
    product: &str,
    price: Decimal,
) -> Result<GrantOutcome, CommandError> {
    let email = Email::parse(email).map_err(|e| CommandError::InvalidArgument(e.to_string()))?;
    if price.is_sign_negative() {
        return Err(CommandError::InvalidArgument(format!(
            "price must not be negative: {price}"
        )));
    }

    let store = store().await?;
    let outcome = ReconciliationService::new(&store, RetryPolicy::default())
        .manual_grant(&UserId::new(user), &email, &ProductId::new(product), price)
        .await?;

    match outcome {
        GrantOutcome::Granted => tracing::info!(user, product, "Product granted"),
        GrantOutcome::AlreadyOwned => tracing::info!(user, product, "Product already owned"),
    }
    Ok(outcome)
}
