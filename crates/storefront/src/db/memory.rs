//! In-process store backend.
//!
//! All state sits behind one mutex, so each operation is atomic. Used by
//! tests and for running the storefront without a database.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use dietshop_core::{
    CheckoutSessionId, CheckoutStatus, Email, Entitlements, GrantOutcome, MergeReport, ProductId,
    UserId,
};

use super::{
    AccountStore, CheckoutStore, EntitlementStore, ReconciliationStore, RepositoryError,
};
use crate::models::{
    CheckoutRecord, Customer, EntitlementOwner, Grant, PendingEntitlement, QueuedTask,
    ReconciliationTask,
};

#[derive(Default)]
struct State {
    customers: HashMap<UserId, Customer>,
    passwords: HashMap<Email, (UserId, String)>,
    pending: BTreeMap<(Email, ProductId), PendingEntitlement>,
    links: HashMap<Email, UserId>,
    checkouts: HashMap<CheckoutSessionId, CheckoutRecord>,
    tasks: Vec<QueuedTask>,
    failing_grants: u32,
    failing_merges: u32,
    stalling_reads: u32,
}

impl State {
    fn customer_entry(&mut self, user_id: &UserId, email: &Email) -> &mut Customer {
        self.customers.entry(user_id.clone()).or_insert_with(|| {
            let now = Utc::now();
            Customer {
                id: user_id.clone(),
                email: email.clone(),
                entitlements: Entitlements::new(),
                created_at: now,
                updated_at: now,
            }
        })
    }
}

/// In-memory [`Store`](super::Store).
///
/// Cheaply cloneable; clones share state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` grant writes fail with `Unavailable`.
    pub fn fail_next_grants(&self, count: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.failing_grants = count;
        }
    }

    /// Make the next `count` guest merges fail with `Unavailable`.
    pub fn fail_next_merges(&self, count: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.failing_merges = count;
        }
    }

    /// Make the next `count` checkout or guest-link reads never complete.
    pub fn stall_next_reads(&self, count: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.stalling_reads = count;
        }
    }

    async fn stall_if_scheduled(&self) {
        let stall = self.state.lock().is_ok_and(|mut state| {
            let stall = state.stalling_reads > 0;
            state.stalling_reads = state.stalling_reads.saturating_sub(1);
            stall
        });
        if stall {
            std::future::pending::<()>().await;
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, RepositoryError> {
        self.state
            .lock()
            .map_err(|_| RepositoryError::Unavailable("memory store lock poisoned".to_owned()))
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn create_account(
        &self,
        user_id: &UserId,
        email: &Email,
        password_hash: &str,
    ) -> Result<Customer, RepositoryError> {
        let mut state = self.state()?;
        if state.passwords.contains_key(email)
            || state.customers.values().any(|c| &c.email == email)
        {
            return Err(RepositoryError::Conflict("email already exists".to_owned()));
        }
        if state.customers.contains_key(user_id) {
            return Err(RepositoryError::Conflict("user id already exists".to_owned()));
        }

        state
            .passwords
            .insert(email.clone(), (user_id.clone(), password_hash.to_owned()));
        Ok(state.customer_entry(user_id, email).clone())
    }

    async fn password_hash(
        &self,
        email: &Email,
    ) -> Result<Option<(UserId, String)>, RepositoryError> {
        Ok(self.state()?.passwords.get(email).cloned())
    }

    async fn get_customer(&self, user_id: &UserId) -> Result<Option<Customer>, RepositoryError> {
        Ok(self.state()?.customers.get(user_id).cloned())
    }

    async fn find_customer_by_email(
        &self,
        email: &Email,
    ) -> Result<Option<Customer>, RepositoryError> {
        Ok(self
            .state()?
            .customers
            .values()
            .find(|c| &c.email == email)
            .cloned())
    }
}

#[async_trait]
impl EntitlementStore for MemoryStore {
    async fn grant(
        &self,
        owner: &EntitlementOwner,
        grant: &Grant,
    ) -> Result<GrantOutcome, RepositoryError> {
        let mut state = self.state()?;
        if state.failing_grants > 0 {
            state.failing_grants -= 1;
            return Err(RepositoryError::Unavailable("injected grant failure".to_owned()));
        }

        match owner {
            EntitlementOwner::Customer(user_id) => {
                let customer = state.customer_entry(user_id, &grant.email);
                let outcome = customer.entitlements.grant(&grant.product_id, grant.price);
                if outcome.is_new() {
                    customer.updated_at = Utc::now();
                }
                Ok(outcome)
            }
            EntitlementOwner::Guest(email) => {
                let key = (email.clone(), grant.product_id.clone());
                if state.pending.contains_key(&key) {
                    return Ok(GrantOutcome::AlreadyOwned);
                }
                state.pending.insert(
                    key,
                    PendingEntitlement {
                        email: email.clone(),
                        product_id: grant.product_id.clone(),
                        price: grant.price,
                        checkout_session_id: grant.checkout_session_id.clone(),
                        granted_at: Utc::now(),
                    },
                );
                Ok(GrantOutcome::Granted)
            }
        }
    }

    async fn pending_for_email(
        &self,
        email: &Email,
    ) -> Result<Vec<PendingEntitlement>, RepositoryError> {
        Ok(self
            .state()?
            .pending
            .values()
            .filter(|p| &p.email == email)
            .cloned()
            .collect())
    }

    async fn merge_pending(
        &self,
        email: &Email,
        user_id: &UserId,
    ) -> Result<MergeReport, RepositoryError> {
        let mut state = self.state()?;
        if state.failing_merges > 0 {
            state.failing_merges -= 1;
            return Err(RepositoryError::Unavailable("injected merge failure".to_owned()));
        }

        let keys: Vec<_> = state
            .pending
            .keys()
            .filter(|(e, _)| e == email)
            .cloned()
            .collect();
        let moved: Vec<_> = keys
            .iter()
            .filter_map(|key| state.pending.remove(key))
            .map(|p| (p.product_id, p.price))
            .collect();

        let customer = state.customer_entry(user_id, email);
        let report = customer.entitlements.absorb(moved);
        if !report.transferred.is_empty() {
            customer.updated_at = Utc::now();
        }
        Ok(report)
    }

    async fn record_guest_link(
        &self,
        email: &Email,
        user_id: &UserId,
    ) -> Result<(), RepositoryError> {
        self.state()?.links.insert(email.clone(), user_id.clone());
        Ok(())
    }

    async fn guest_link(&self, email: &Email) -> Result<Option<UserId>, RepositoryError> {
        self.stall_if_scheduled().await;
        Ok(self.state()?.links.get(email).cloned())
    }
}

#[async_trait]
impl CheckoutStore for MemoryStore {
    async fn insert_checkout(&self, record: &CheckoutRecord) -> Result<(), RepositoryError> {
        let mut state = self.state()?;
        if state.checkouts.contains_key(&record.checkout_session_id) {
            return Err(RepositoryError::Conflict(format!(
                "checkout {} already exists",
                record.checkout_session_id
            )));
        }
        state
            .checkouts
            .insert(record.checkout_session_id.clone(), record.clone());
        Ok(())
    }

    async fn get_checkout(
        &self,
        id: &CheckoutSessionId,
    ) -> Result<Option<CheckoutRecord>, RepositoryError> {
        self.stall_if_scheduled().await;
        Ok(self.state()?.checkouts.get(id).cloned())
    }

    async fn resolve_checkout(
        &self,
        id: &CheckoutSessionId,
        status: CheckoutStatus,
    ) -> Result<bool, RepositoryError> {
        let mut state = self.state()?;
        match state.checkouts.get_mut(id) {
            Some(record) if !record.status.is_terminal() => {
                record.status = status;
                record.resolved_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl ReconciliationStore for MemoryStore {
    async fn enqueue(
        &self,
        task: &ReconciliationTask,
        error: &str,
    ) -> Result<Uuid, RepositoryError> {
        let id = Uuid::new_v4();
        self.state()?.tasks.push(QueuedTask {
            id,
            task: task.clone(),
            last_error: error.to_owned(),
            attempts: 1,
            created_at: Utc::now(),
            resolved_at: None,
        });
        Ok(id)
    }

    async fn open_tasks(&self, limit: u32) -> Result<Vec<QueuedTask>, RepositoryError> {
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);
        Ok(self
            .state()?
            .tasks
            .iter()
            .filter(|t| t.resolved_at.is_none())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_resolved(&self, id: Uuid) -> Result<bool, RepositoryError> {
        let mut state = self.state()?;
        match state.tasks.iter_mut().find(|t| t.id == id) {
            Some(task) if task.resolved_at.is_none() => {
                task.resolved_at = Some(Utc::now());
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn record_failure(&self, id: Uuid, error: &str) -> Result<(), RepositoryError> {
        let mut state = self.state()?;
        let task = state
            .tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(RepositoryError::NotFound)?;
        task.attempts = task.attempts.saturating_add(1);
        error.clone_into(&mut task.last_error);
        Ok(())
    }
}
