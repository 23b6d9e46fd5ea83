//! Domain models for the storefront.
//!
//! These are validated domain types, separate from database row types.

pub mod checkout;
pub mod customer;
pub mod entitlement;
pub mod reconciliation;
pub mod session;

pub use checkout::CheckoutRecord;
pub use customer::Customer;
pub use entitlement::{EntitlementOwner, Grant, PendingEntitlement};
pub use reconciliation::{QueuedTask, ReconciliationTask};
pub use session::{CurrentUser, keys as session_keys};
