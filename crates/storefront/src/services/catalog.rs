//! Product catalog: the authoritative source of checkout prices.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;
use rust_decimal::Decimal;
use sqlx::PgPool;
use tracing::{debug, instrument};

use dietshop_core::{CurrencyCode, Price, Product, ProductId, ProductType};

use crate::db::RepositoryError;

/// Read-only product lookup.
#[async_trait]
pub trait ProductCatalog: Send + Sync {
    /// Active product by ID, or `None` if unknown or retired.
    async fn product(&self, id: &ProductId) -> Result<Option<Product>, RepositoryError>;
}

#[async_trait]
impl<C: ProductCatalog + ?Sized> ProductCatalog for Arc<C> {
    async fn product(&self, id: &ProductId) -> Result<Option<Product>, RepositoryError> {
        (**self).product(id).await
    }
}

/// Fixed in-process catalog for tests and local runs.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    products: HashMap<ProductId, Product>,
}

impl StaticCatalog {
    #[must_use]
    pub fn new(products: impl IntoIterator<Item = Product>) -> Self {
        Self {
            products: products.into_iter().map(|p| (p.id.clone(), p)).collect(),
        }
    }
}

#[async_trait]
impl ProductCatalog for StaticCatalog {
    async fn product(&self, id: &ProductId) -> Result<Option<Product>, RepositoryError> {
        Ok(self.products.get(id).cloned())
    }
}

#[derive(sqlx::FromRow)]
struct ProductRow {
    id: String,
    title: String,
    price: Decimal,
    currency: String,
    product_type: String,
}

impl TryFrom<ProductRow> for Product {
    type Error = RepositoryError;

    fn try_from(row: ProductRow) -> Result<Self, Self::Error> {
        let currency = row
            .currency
            .parse::<CurrencyCode>()
            .map_err(RepositoryError::DataCorruption)?;
        let product_type = row
            .product_type
            .parse::<ProductType>()
            .map_err(RepositoryError::DataCorruption)?;

        Ok(Self {
            id: ProductId::new(row.id),
            title: row.title,
            price: Price::new(row.price, currency),
            product_type,
        })
    }
}

/// Catalog backed by the `storefront.product` table.
#[derive(Debug, Clone)]
pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProductCatalog for PgCatalog {
    #[instrument(skip(self), fields(product_id = %id))]
    async fn product(&self, id: &ProductId) -> Result<Option<Product>, RepositoryError> {
        let row = sqlx::query_as::<_, ProductRow>(
            r"
            SELECT id, title, price, currency, product_type
            FROM storefront.product
            WHERE id = $1 AND active
            ",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Product::try_from).transpose()
    }
}

/// Read-through cache in front of another catalog.
///
/// Only hits are cached, so a product added to the catalog becomes
/// purchasable without waiting for the TTL.
pub struct CachedCatalog<C> {
    inner: C,
    cache: Cache<ProductId, Product>,
}

impl<C: ProductCatalog> CachedCatalog<C> {
    /// Wrap `inner` with a 5 minute, 1000 entry cache.
    #[must_use]
    pub fn new(inner: C) -> Self {
        Self::with_ttl(inner, Duration::from_secs(300))
    }

    #[must_use]
    pub fn with_ttl(inner: C, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(1000)
            .time_to_live(ttl)
            .build();
        Self { inner, cache }
    }
}

#[async_trait]
impl<C: ProductCatalog> ProductCatalog for CachedCatalog<C> {
    async fn product(&self, id: &ProductId) -> Result<Option<Product>, RepositoryError> {
        if let Some(product) = self.cache.get(id).await {
            debug!(product_id = %id, "Cache hit for product");
            return Ok(Some(product));
        }

        let product = self.inner.product(id).await?;
        if let Some(product) = &product {
            self.cache.insert(id.clone(), product.clone()).await;
        }
        Ok(product)
    }
}
