//! Account API handlers.
//!
//! These routes require authentication.

use axum::{Json, extract::State, http::StatusCode};
use tracing::{instrument, warn};

use dietshop_core::{
    AccountResponse, EntitlementSummary, Entitlements, TransferGuestPurchase, TransferState,
};

use crate::error::{AppError, Result};
use crate::middleware::RequireAuth;
use crate::state::AppState;

/// Products owned by the signed-in user.
///
/// An account with no customer document yet owns nothing; that reads as an
/// empty summary, not an error, since the poller may ask before the first
/// grant lands.
#[instrument(skip_all, fields(user_id = %user.id))]
pub async fn entitlements(
    State(state): State<AppState>,
    RequireAuth(user): RequireAuth,
) -> Result<Json<EntitlementSummary>> {
    let summary = state.store().get_customer(&user.id).await?.map_or_else(
        || EntitlementSummary::new(user.id.clone(), user.email.clone(), &Entitlements::new()),
        |customer| customer.summary(),
    );

    Ok(Json(summary))
}

/// Move the caller's email-keyed guest purchases onto the caller.
///
/// Answers `200` when the transfer completed and `202` when it was queued.
#[instrument(skip_all, fields(user_id = %user.id))]
pub async fn transfer_guest_purchase(
    State(state): State<AppState>,
    RequireAuth(user): RequireAuth,
    Json(body): Json<TransferGuestPurchase>,
) -> Result<(StatusCode, Json<AccountResponse>)> {
    if let Some(email) = &body.email
        && *email != user.email
    {
        warn!(security = true, "Transfer requested for another account's email");
        return Err(AppError::Forbidden(
            "guest purchases can only be moved to the account with the same email".to_string(),
        ));
    }

    let transfer = state
        .linking()
        .transfer_or_queue(&user.id, &user.email)
        .await;

    let status = match transfer {
        TransferState::Completed { .. } => StatusCode::OK,
        TransferState::Queued { .. } => StatusCode::ACCEPTED,
    };

    Ok((
        status,
        Json(AccountResponse {
            user_id: user.id,
            email: user.email,
            transfer,
        }),
    ))
}
