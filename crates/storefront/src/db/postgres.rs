//! `PostgreSQL` store backend.
//!
//! Idempotency comes from primary keys plus `ON CONFLICT DO NOTHING`:
//! counters are bumped in the same transaction, and only when the insert
//! actually added a row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::instrument;
use uuid::Uuid;

use dietshop_core::{
    CheckoutSessionId, CheckoutStatus, CurrencyCode, Email, Entitlements, GrantOutcome,
    MergeReport, ProductId, UserId,
};

use super::{
    AccountStore, CheckoutStore, EntitlementStore, ReconciliationStore, RepositoryError,
};
use crate::models::{
    CheckoutRecord, Customer, EntitlementOwner, Grant, PendingEntitlement, QueuedTask,
    ReconciliationTask,
};

/// `PostgreSQL`-backed [`Store`](super::Store).
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Wrap an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn load_customer(&self, row: CustomerRow) -> Result<Customer, RepositoryError> {
        let product_ids: Vec<ProductId> = sqlx::query_scalar(
            r"
            SELECT product_id
            FROM storefront.entitlement
            WHERE user_id = $1
            ",
        )
        .bind(&row.id)
        .fetch_all(&self.pool)
        .await?;

        let total_purchases = u64::try_from(row.total_purchases).map_err(|_| {
            RepositoryError::DataCorruption(format!(
                "negative total_purchases for customer {}",
                row.id
            ))
        })?;

        Ok(Customer {
            entitlements: Entitlements::from_parts(
                product_ids.into_iter().collect(),
                total_purchases,
                row.total_spent,
            ),
            id: row.id,
            email: row.email,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct CustomerRow {
    id: UserId,
    email: Email,
    total_purchases: i64,
    total_spent: Decimal,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct PendingRow {
    email: Email,
    product_id: ProductId,
    price: Decimal,
    checkout_session_id: Option<CheckoutSessionId>,
    granted_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct CheckoutRow {
    checkout_session_id: CheckoutSessionId,
    product_id: ProductId,
    price: Decimal,
    currency: String,
    buyer_user_id: Option<UserId>,
    buyer_email: Email,
    status: String,
    created_at: DateTime<Utc>,
    resolved_at: Option<DateTime<Utc>>,
}

impl TryFrom<CheckoutRow> for CheckoutRecord {
    type Error = RepositoryError;

    fn try_from(row: CheckoutRow) -> Result<Self, Self::Error> {
        let currency = row.currency.parse::<CurrencyCode>().map_err(|e: String| {
            RepositoryError::DataCorruption(format!("invalid currency in database: {e}"))
        })?;
        let status = row.status.parse::<CheckoutStatus>().map_err(|e: String| {
            RepositoryError::DataCorruption(format!("invalid checkout status in database: {e}"))
        })?;

        Ok(Self {
            checkout_session_id: row.checkout_session_id,
            product_id: row.product_id,
            price: row.price,
            currency,
            buyer_user_id: row.buyer_user_id,
            buyer_email: row.buyer_email,
            status,
            created_at: row.created_at,
            resolved_at: row.resolved_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: Uuid,
    task: Json<ReconciliationTask>,
    last_error: String,
    attempts: i32,
    created_at: DateTime<Utc>,
    resolved_at: Option<DateTime<Utc>>,
}

impl TryFrom<TaskRow> for QueuedTask {
    type Error = RepositoryError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let attempts = u32::try_from(row.attempts).map_err(|_| {
            RepositoryError::DataCorruption(format!("negative attempts for task {}", row.id))
        })?;

        Ok(Self {
            id: row.id,
            task: row.task.0,
            last_error: row.last_error,
            attempts,
            created_at: row.created_at,
            resolved_at: row.resolved_at,
        })
    }
}

/// Map a unique violation to `Conflict`, anything else to `Database`.
fn conflict_or_database(e: sqlx::Error, message: &str) -> RepositoryError {
    if let sqlx::Error::Database(ref db_err) = e
        && db_err.is_unique_violation()
    {
        return RepositoryError::Conflict(message.to_owned());
    }
    RepositoryError::Database(e)
}

/// Create the customer document if it does not exist yet.
async fn ensure_customer(
    tx: &mut Transaction<'_, Postgres>,
    user_id: &UserId,
    email: &Email,
) -> Result<(), RepositoryError> {
    sqlx::query(
        r"
        INSERT INTO storefront.customer (id, email)
        VALUES ($1, $2)
        ON CONFLICT DO NOTHING
        ",
    )
    .bind(user_id)
    .bind(email)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Insert one entitlement row. Returns whether it was new.
async fn insert_entitlement(
    tx: &mut Transaction<'_, Postgres>,
    user_id: &UserId,
    product_id: &ProductId,
    price: Decimal,
    checkout_session_id: Option<&CheckoutSessionId>,
) -> Result<bool, RepositoryError> {
    let result = sqlx::query(
        r"
        INSERT INTO storefront.entitlement (user_id, product_id, price, checkout_session_id)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (user_id, product_id) DO NOTHING
        ",
    )
    .bind(user_id)
    .bind(product_id)
    .bind(price)
    .bind(checkout_session_id)
    .execute(&mut **tx)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Bump the derived counters by `count` purchases totalling `spent`.
async fn bump_counters(
    tx: &mut Transaction<'_, Postgres>,
    user_id: &UserId,
    count: usize,
    spent: Decimal,
) -> Result<(), RepositoryError> {
    let count = i64::try_from(count)
        .map_err(|_| RepositoryError::DataCorruption("purchase count overflow".to_owned()))?;
    sqlx::query(
        r"
        UPDATE storefront.customer
        SET total_purchases = total_purchases + $2,
            total_spent = total_spent + $3,
            updated_at = now()
        WHERE id = $1
        ",
    )
    .bind(user_id)
    .bind(count)
    .bind(spent)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl AccountStore for PgStore {
    #[instrument(skip_all, fields(user_id = %user_id))]
    async fn create_account(
        &self,
        user_id: &UserId,
        email: &Email,
        password_hash: &str,
    ) -> Result<Customer, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let row: CustomerRow = sqlx::query_as(
            r"
            INSERT INTO storefront.customer (id, email)
            VALUES ($1, $2)
            RETURNING id, email, total_purchases, total_spent, created_at, updated_at
            ",
        )
        .bind(user_id)
        .bind(email)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| conflict_or_database(e, "email already exists"))?;

        sqlx::query(
            r"
            INSERT INTO storefront.customer_password (user_id, password_hash)
            VALUES ($1, $2)
            ",
        )
        .bind(user_id)
        .bind(password_hash)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Customer {
            id: row.id,
            email: row.email,
            entitlements: Entitlements::new(),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }

    async fn password_hash(
        &self,
        email: &Email,
    ) -> Result<Option<(UserId, String)>, RepositoryError> {
        let row: Option<(UserId, String)> = sqlx::query_as(
            r"
            SELECT c.id, p.password_hash
            FROM storefront.customer c
            JOIN storefront.customer_password p ON p.user_id = c.id
            WHERE c.email = $1
            ",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_customer(&self, user_id: &UserId) -> Result<Option<Customer>, RepositoryError> {
        let row: Option<CustomerRow> = sqlx::query_as(
            r"
            SELECT id, email, total_purchases, total_spent, created_at, updated_at
            FROM storefront.customer
            WHERE id = $1
            ",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.load_customer(row).await?)),
            None => Ok(None),
        }
    }

    async fn find_customer_by_email(
        &self,
        email: &Email,
    ) -> Result<Option<Customer>, RepositoryError> {
        let row: Option<CustomerRow> = sqlx::query_as(
            r"
            SELECT id, email, total_purchases, total_spent, created_at, updated_at
            FROM storefront.customer
            WHERE email = $1
            ",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.load_customer(row).await?)),
            None => Ok(None),
        }
    }

    async fn ping(&self) -> Result<(), RepositoryError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl EntitlementStore for PgStore {
    #[instrument(skip_all, fields(owner = %owner, product_id = %grant.product_id))]
    async fn grant(
        &self,
        owner: &EntitlementOwner,
        grant: &Grant,
    ) -> Result<GrantOutcome, RepositoryError> {
        match owner {
            EntitlementOwner::Customer(user_id) => {
                let mut tx = self.pool.begin().await?;
                ensure_customer(&mut tx, user_id, &grant.email).await?;
                let inserted = insert_entitlement(
                    &mut tx,
                    user_id,
                    &grant.product_id,
                    grant.price,
                    grant.checkout_session_id.as_ref(),
                )
                .await?;
                if inserted {
                    bump_counters(&mut tx, user_id, 1, grant.price).await?;
                }
                tx.commit().await?;

                Ok(if inserted {
                    GrantOutcome::Granted
                } else {
                    GrantOutcome::AlreadyOwned
                })
            }
            EntitlementOwner::Guest(email) => {
                let result = sqlx::query(
                    r"
                    INSERT INTO storefront.pending_entitlement
                        (email, product_id, price, checkout_session_id)
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (email, product_id) DO NOTHING
                    ",
                )
                .bind(email)
                .bind(&grant.product_id)
                .bind(grant.price)
                .bind(grant.checkout_session_id.as_ref())
                .execute(&self.pool)
                .await?;

                Ok(if result.rows_affected() == 1 {
                    GrantOutcome::Granted
                } else {
                    GrantOutcome::AlreadyOwned
                })
            }
        }
    }

    async fn pending_for_email(
        &self,
        email: &Email,
    ) -> Result<Vec<PendingEntitlement>, RepositoryError> {
        let rows: Vec<PendingRow> = sqlx::query_as(
            r"
            SELECT email, product_id, price, checkout_session_id, granted_at
            FROM storefront.pending_entitlement
            WHERE email = $1
            ORDER BY granted_at
            ",
        )
        .bind(email)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| PendingEntitlement {
                email: r.email,
                product_id: r.product_id,
                price: r.price,
                checkout_session_id: r.checkout_session_id,
                granted_at: r.granted_at,
            })
            .collect())
    }

    #[instrument(skip_all, fields(email = %email, user_id = %user_id))]
    async fn merge_pending(
        &self,
        email: &Email,
        user_id: &UserId,
    ) -> Result<MergeReport, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        // Row locks serialize concurrent merges of the same email.
        let rows: Vec<(ProductId, Decimal, Option<CheckoutSessionId>)> = sqlx::query_as(
            r"
            SELECT product_id, price, checkout_session_id
            FROM storefront.pending_entitlement
            WHERE email = $1
            ORDER BY product_id
            FOR UPDATE
            ",
        )
        .bind(email)
        .fetch_all(&mut *tx)
        .await?;

        let mut report = MergeReport::default();
        if rows.is_empty() {
            tx.commit().await?;
            return Ok(report);
        }

        ensure_customer(&mut tx, user_id, email).await?;

        let mut spent = Decimal::ZERO;
        for (product_id, price, checkout_session_id) in rows {
            if insert_entitlement(
                &mut tx,
                user_id,
                &product_id,
                price,
                checkout_session_id.as_ref(),
            )
            .await?
            {
                spent += price;
                report.transferred.push(product_id);
            } else {
                report.already_owned.push(product_id);
            }
        }

        if !report.transferred.is_empty() {
            bump_counters(&mut tx, user_id, report.transferred.len(), spent).await?;
        }

        let moved: Vec<String> = report
            .transferred
            .iter()
            .chain(report.already_owned.iter())
            .map(ToString::to_string)
            .collect();
        sqlx::query(
            r"
            DELETE FROM storefront.pending_entitlement
            WHERE email = $1 AND product_id = ANY($2)
            ",
        )
        .bind(email)
        .bind(&moved)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(report)
    }

    async fn record_guest_link(
        &self,
        email: &Email,
        user_id: &UserId,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            r"
            INSERT INTO storefront.guest_link (email, user_id)
            VALUES ($1, $2)
            ON CONFLICT (email) DO UPDATE SET user_id = EXCLUDED.user_id, linked_at = now()
            ",
        )
        .bind(email)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn guest_link(&self, email: &Email) -> Result<Option<UserId>, RepositoryError> {
        let user_id: Option<UserId> = sqlx::query_scalar(
            r"
            SELECT user_id
            FROM storefront.guest_link
            WHERE email = $1
            ",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user_id)
    }
}

#[async_trait]
impl CheckoutStore for PgStore {
    async fn insert_checkout(&self, record: &CheckoutRecord) -> Result<(), RepositoryError> {
        sqlx::query(
            r"
            INSERT INTO storefront.checkout
                (checkout_session_id, product_id, price, currency,
                 buyer_user_id, buyer_email, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ",
        )
        .bind(&record.checkout_session_id)
        .bind(&record.product_id)
        .bind(record.price)
        .bind(record.currency.code())
        .bind(record.buyer_user_id.as_ref())
        .bind(&record.buyer_email)
        .bind(record.status.as_str())
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| conflict_or_database(e, "checkout already exists"))?;
        Ok(())
    }

    async fn get_checkout(
        &self,
        id: &CheckoutSessionId,
    ) -> Result<Option<CheckoutRecord>, RepositoryError> {
        let row: Option<CheckoutRow> = sqlx::query_as(
            r"
            SELECT checkout_session_id, product_id, price, currency,
                   buyer_user_id, buyer_email, status, created_at, resolved_at
            FROM storefront.checkout
            WHERE checkout_session_id = $1
            ",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(CheckoutRecord::try_from).transpose()
    }

    async fn resolve_checkout(
        &self,
        id: &CheckoutSessionId,
        status: CheckoutStatus,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r"
            UPDATE storefront.checkout
            SET status = $2, resolved_at = now()
            WHERE checkout_session_id = $1 AND status = 'pending_confirmation'
            ",
        )
        .bind(id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl ReconciliationStore for PgStore {
    async fn enqueue(
        &self,
        task: &ReconciliationTask,
        error: &str,
    ) -> Result<Uuid, RepositoryError> {
        let id = Uuid::new_v4();
        sqlx::query(
            r"
            INSERT INTO storefront.reconciliation_task (id, task, last_error)
            VALUES ($1, $2, $3)
            ",
        )
        .bind(id)
        .bind(Json(task))
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn open_tasks(&self, limit: u32) -> Result<Vec<QueuedTask>, RepositoryError> {
        let rows: Vec<TaskRow> = sqlx::query_as(
            r"
            SELECT id, task, last_error, attempts, created_at, resolved_at
            FROM storefront.reconciliation_task
            WHERE resolved_at IS NULL
            ORDER BY created_at
            LIMIT $1
            ",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(QueuedTask::try_from).collect()
    }

    async fn mark_resolved(&self, id: Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r"
            UPDATE storefront.reconciliation_task
            SET resolved_at = now(), updated_at = now()
            WHERE id = $1 AND resolved_at IS NULL
            ",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_failure(&self, id: Uuid, error: &str) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r"
            UPDATE storefront.reconciliation_task
            SET attempts = attempts + 1, last_error = $2, updated_at = now()
            WHERE id = $1
            ",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }
}
