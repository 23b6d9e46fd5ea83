//! Entitlement store and the storefront's other persistent state.
//!
//! # Database: `dietshop_storefront`
//!
//! ## Tables
//!
//! - `customer` / `customer_password` - Accounts and local credentials
//! - `entitlement` - One row per owned `(user_id, product_id)`
//! - `pending_entitlement` - Guest grants keyed by email until migrated
//! - `guest_link` - Email to account links recorded by guest migration
//! - `product` - Authoritative catalog prices
//! - `checkout` - Server-validated checkout facts and confirmation status
//! - `reconciliation_task` - Grants and transfers awaiting replay
//! - `tower_sessions.session` - Tower-sessions storage
//!
//! Every entitlement mutation is an add-if-absent set union, so duplicate
//! and reordered writes converge to the same state without locking.
//!
//! # Backends
//!
//! - [`PgStore`] - `PostgreSQL`, used by the binary and the CLI
//! - [`MemoryStore`] - In-process, used by tests and local runs
//!
//! # Migrations
//!
//! Migrations are stored in `crates/storefront/migrations/` and run via:
//! ```bash
//! cargo run -p dietshop-cli -- migrate
//! ```

mod memory;
mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use dietshop_core::{CheckoutSessionId, CheckoutStatus, Email, GrantOutcome, MergeReport, UserId};

use crate::models::{
    CheckoutRecord, Customer, EntitlementOwner, Grant, PendingEntitlement, QueuedTask,
    ReconciliationTask,
};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// Database error from sqlx.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Data in the store is corrupted or invalid.
    #[error("data corruption: {0}")]
    DataCorruption(String),

    /// Requested entity was not found.
    #[error("not found")]
    NotFound,

    /// Constraint violation (e.g., unique email).
    #[error("constraint violation: {0}")]
    Conflict(String),

    /// The backend is temporarily unable to serve the request.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Account documents and local credentials.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Create a customer document with a password credential.
    ///
    /// Returns `RepositoryError::Conflict` if the email is already registered.
    async fn create_account(
        &self,
        user_id: &UserId,
        email: &Email,
        password_hash: &str,
    ) -> Result<Customer, RepositoryError>;

    /// Look up the credential for an email.
    async fn password_hash(&self, email: &Email)
    -> Result<Option<(UserId, String)>, RepositoryError>;

    /// Full customer document, including owned products.
    async fn get_customer(&self, user_id: &UserId) -> Result<Option<Customer>, RepositoryError>;

    /// Customer document for an email.
    async fn find_customer_by_email(
        &self,
        email: &Email,
    ) -> Result<Option<Customer>, RepositoryError>;

    /// Connectivity check for readiness probes.
    async fn ping(&self) -> Result<(), RepositoryError> {
        Ok(())
    }
}

/// Durable per-owner record of granted products.
#[async_trait]
pub trait EntitlementStore: Send + Sync {
    /// Add `grant.product_id` to `owner` if absent.
    ///
    /// Counters move only when the product was newly added. A customer
    /// document is created on the first direct grant if none exists yet.
    async fn grant(
        &self,
        owner: &EntitlementOwner,
        grant: &Grant,
    ) -> Result<GrantOutcome, RepositoryError>;

    /// Guest grants recorded against `email`.
    async fn pending_for_email(
        &self,
        email: &Email,
    ) -> Result<Vec<PendingEntitlement>, RepositoryError>;

    /// Re-key every guest grant for `email` onto `user_id` and drop the
    /// pending records. Products the user already owns are not counted twice.
    async fn merge_pending(
        &self,
        email: &Email,
        user_id: &UserId,
    ) -> Result<MergeReport, RepositoryError>;

    /// Record that guest purchases under `email` belong to `user_id`.
    async fn record_guest_link(&self, email: &Email, user_id: &UserId)
    -> Result<(), RepositoryError>;

    /// Account linked to `email`, if migration has run.
    async fn guest_link(&self, email: &Email) -> Result<Option<UserId>, RepositoryError>;
}

/// Checkout records written at initiation and resolved at confirmation.
#[async_trait]
pub trait CheckoutStore: Send + Sync {
    /// Store a new `pending_confirmation` record.
    async fn insert_checkout(&self, record: &CheckoutRecord) -> Result<(), RepositoryError>;

    /// Look up a checkout by processor session ID.
    async fn get_checkout(
        &self,
        id: &CheckoutSessionId,
    ) -> Result<Option<CheckoutRecord>, RepositoryError>;

    /// Move a pending checkout to a terminal status.
    ///
    /// Returns `false` if the record is missing or already terminal.
    async fn resolve_checkout(
        &self,
        id: &CheckoutSessionId,
        status: CheckoutStatus,
    ) -> Result<bool, RepositoryError>;
}

/// Durable queue of work awaiting manual or background reconciliation.
#[async_trait]
pub trait ReconciliationStore: Send + Sync {
    /// Queue a task with the error that caused it.
    async fn enqueue(
        &self,
        task: &ReconciliationTask,
        error: &str,
    ) -> Result<Uuid, RepositoryError>;

    /// Unresolved tasks, oldest first.
    async fn open_tasks(&self, limit: u32) -> Result<Vec<QueuedTask>, RepositoryError>;

    /// Mark a task done. Returns `false` if it was already resolved.
    async fn mark_resolved(&self, id: Uuid) -> Result<bool, RepositoryError>;

    /// Record another failed replay attempt.
    async fn record_failure(&self, id: Uuid, error: &str) -> Result<(), RepositoryError>;
}

/// Everything the storefront persists.
pub trait Store: AccountStore + EntitlementStore + CheckoutStore + ReconciliationStore {}

impl<T> Store for T where
    T: AccountStore + EntitlementStore + CheckoutStore + ReconciliationStore + ?Sized
{
}

/// Create a `PostgreSQL` connection pool with sensible defaults.
///
/// # Arguments
///
/// * `database_url` - `PostgreSQL` connection string (wrapped in `SecretString`)
///
/// # Errors
///
/// Returns `sqlx::Error` if the connection cannot be established.
pub async fn create_pool(database_url: &secrecy::SecretString) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url.expose_secret())
        .await
}
