//! Business logic services for the storefront.
//!
//! # Services
//!
//! - `catalog` - Authoritative product prices (cached)
//! - `payments` - Payment processor client and callback verification
//! - `checkout` - Checkout session initiation
//! - `confirmation` - Idempotent grant on confirmed payment
//! - `linking` - Guest purchase migration onto accounts
//! - `reconciliation` - Replay of queued grants and transfers
//! - `auth` - Account creation and sign-in
//! - `retry` - Bounded retry for store writes

pub mod auth;
pub mod catalog;
pub mod checkout;
pub mod confirmation;
pub mod linking;
pub mod payments;
pub mod reconciliation;
pub mod retry;
