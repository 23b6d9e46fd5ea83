//! Core types for Dietshop.
//!
//! This module provides type-safe wrappers for common domain concepts.

pub mod api;
pub mod checkout;
pub mod email;
pub mod entitlement;
pub mod id;
pub mod price;
pub mod product;
pub mod purchase_session;
pub mod status;

pub use api::{
    AccountResponse, CheckoutRedirect, Credentials, StartCheckout, TransferGuestPurchase,
    TransferState,
};
pub use checkout::{CheckoutMetadata, CheckoutRequest, MetadataError};
pub use email::{Email, EmailError};
pub use entitlement::{EntitlementSummary, Entitlements, GrantOutcome, MergeReport};
pub use id::*;
pub use price::{CurrencyCode, Price};
pub use product::{Product, ProductType};
pub use purchase_session::{InvalidTransition, PurchaseSession};
pub use status::*;
