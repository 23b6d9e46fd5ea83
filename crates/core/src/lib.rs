//! Dietshop Core - Shared domain types.
//!
//! This crate provides the types shared by every Dietshop component:
//! - `storefront` - Checkout initiation, payment confirmation, guest migration
//! - `client` - Guest purchase session and post-checkout reconciliation
//! - `cli` - Migrations and manual reconciliation
//!
//! # Architecture
//!
//! The core crate contains only types and pure logic - no I/O, no database
//! access, no HTTP clients. This keeps it lightweight and allows it to be
//! used on both sides of the payment redirect.
//!
//! # Modules
//!
//! - [`types`] - IDs, emails, prices, statuses, purchase sessions, checkout
//!   metadata and the entitlement reducer

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod types;

pub use types::*;
