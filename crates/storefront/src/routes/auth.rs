//! Authentication route handlers.
//!
//! Register and login both end with guest migration: any purchase made as a
//! guest under the account's email is moved onto the account. A failed
//! migration is queued and reported in the response; it never fails the
//! sign-in itself.

use axum::{Json, extract::State, http::StatusCode};
use tower_sessions::Session;
use tracing::instrument;

use dietshop_core::{AccountResponse, Credentials};

use crate::error::{AppError, Result, clear_sentry_user, set_sentry_user};
use crate::middleware::{clear_current_user, set_current_user};
use crate::models::CurrentUser;
use crate::services::linking::Onboarding;
use crate::state::AppState;

/// Create an account and sign it in.
#[instrument(skip_all)]
pub async fn register(
    State(state): State<AppState>,
    session: Session,
    Json(credentials): Json<Credentials>,
) -> Result<(StatusCode, Json<AccountResponse>)> {
    let onboarding = state
        .linking()
        .register(state.auth(), &credentials.email, &credentials.password)
        .await?;

    let response = start_session(&session, onboarding).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

/// Sign in to an existing account.
#[instrument(skip_all)]
pub async fn login(
    State(state): State<AppState>,
    session: Session,
    Json(credentials): Json<Credentials>,
) -> Result<Json<AccountResponse>> {
    let onboarding = state
        .linking()
        .sign_in(state.auth(), &credentials.email, &credentials.password)
        .await?;

    let response = start_session(&session, onboarding).await?;
    Ok(Json(response))
}

/// Sign out and destroy the session.
pub async fn logout(session: Session) -> StatusCode {
    if let Err(e) = clear_current_user(&session).await {
        tracing::error!("Failed to clear session: {}", e);
    }

    if let Err(e) = session.flush().await {
        tracing::error!("Failed to flush session: {}", e);
    }

    clear_sentry_user();
    StatusCode::NO_CONTENT
}

async fn start_session(session: &Session, onboarding: Onboarding) -> Result<AccountResponse> {
    let Onboarding { identity, transfer } = onboarding;

    let user = CurrentUser {
        id: identity.user_id,
        email: identity.email,
    };
    set_current_user(session, &user)
        .await
        .map_err(|e| AppError::Internal(format!("session error: {e}")))?;
    set_sentry_user(&user.id, Some(user.email.as_str()));

    Ok(AccountResponse {
        user_id: user.id,
        email: user.email,
        transfer,
    })
}
