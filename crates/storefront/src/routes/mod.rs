//! HTTP route handlers for the storefront.
//!
//! # Route Structure
//!
//! ```text
//! GET  /health                              - Liveness
//! GET  /health/ready                        - Readiness (store reachable)
//!
//! # Checkout
//! POST /api/checkout                        - Start a hosted checkout
//!
//! # Payment processor
//! POST /webhooks/payments                   - Signed confirmation callback
//!
//! # Auth
//! POST /auth/register                       - Create account, migrate guest purchases
//! POST /auth/login                          - Sign in, migrate guest purchases
//! POST /auth/logout                         - Sign out
//!
//! # Account (requires auth)
//! GET  /api/account/entitlements            - Owned products
//! POST /api/account/transfer-guest-purchase - Re-run guest migration
//! ```

pub mod account;
pub mod auth;
pub mod checkout;
pub mod webhooks;

use axum::{
    Router,
    routing::{get, post},
};

use crate::state::AppState;

/// Create the auth routes router.
pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/register", post(auth::register))
        .route("/login", post(auth::login))
        .route("/logout", post(auth::logout))
}

/// Create the account API routes router.
pub fn account_routes() -> Router<AppState> {
    Router::new()
        .route("/entitlements", get(account::entitlements))
        .route("/transfer-guest-purchase", post(account::transfer_guest_purchase))
}

/// Create all routes for the storefront.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/checkout", post(checkout::start))
        .nest("/api/account", account_routes())
        .route("/webhooks/payments", post(webhooks::payments))
        .nest("/auth", auth_routes())
}
