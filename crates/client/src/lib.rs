//! Dietshop client.
//!
//! The browser-side half of the purchase flow, expressed as a library:
//!
//! - [`storage`] - Navigation-surviving key/value storage
//! - [`guest_session`] - The one live guest [`PurchaseSession`](dietshop_core::PurchaseSession)
//!   per browser, and its hand-off to an account
//! - [`api`] - Cookie-backed HTTP client for the storefront
//! - [`poller`] - Post-redirect entitlement refresh
//!
//! Nothing here decides whether a purchase happened. The client only reads
//! what the storefront has recorded, and tolerates reading it before the
//! payment callback has landed.

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod api;
pub mod error;
pub mod guest_session;
pub mod poller;
pub mod storage;

pub use api::StorefrontApi;
pub use error::{ClientError, StorageError};
pub use guest_session::{AccountLinker, GuestSessionManager, Handoff};
pub use poller::{
    Detection, EntitlementSource, MemoryLocation, PageLocation, PollPolicy, ReconcileOutcome,
    ReconciliationPoller,
};
pub use storage::{FileStorage, LocalStorage, MemoryStorage};
