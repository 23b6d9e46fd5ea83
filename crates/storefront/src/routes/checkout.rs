//! Checkout initiation.

use axum::{Json, extract::State};
use tracing::instrument;

use dietshop_core::{CheckoutRedirect, CheckoutRequest, StartCheckout};

use crate::error::{AppError, Result, add_breadcrumb};
use crate::middleware::OptionalAuth;
use crate::state::AppState;

/// Start a hosted checkout for one product.
///
/// Signed-in shoppers are attributed by session and any `guest_email` in the
/// body is ignored. Guests must supply `guest_email`.
#[instrument(skip_all, fields(product_id = %body.product_id))]
pub async fn start(
    State(state): State<AppState>,
    OptionalAuth(user): OptionalAuth,
    Json(body): Json<StartCheckout>,
) -> Result<Json<CheckoutRedirect>> {
    let (buyer_email, buyer_user_id) = match user {
        Some(user) => (user.email, Some(user.id)),
        None => {
            let email = body
                .guest_email
                .ok_or_else(|| AppError::BadRequest("guest_email is required".to_string()))?;
            (email, None)
        }
    };

    let request = CheckoutRequest {
        product_id: body.product_id,
        product_price: body.expected_price,
        buyer_email,
        buyer_user_id,
    };

    let redirect = state.checkout().initiate(&request).await?;

    add_breadcrumb(
        "checkout",
        "Checkout started",
        Some(&[
            ("product_id", request.product_id.as_str()),
            ("checkout_session_id", redirect.checkout_session_id.as_str()),
        ]),
    );
    Ok(Json(redirect))
}
