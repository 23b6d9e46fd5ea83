//! Application state shared across handlers.

use std::sync::Arc;

use sqlx::PgPool;

use crate::config::StorefrontConfig;
use crate::db::{PgStore, Store};
use crate::services::auth::{AuthProvider, LocalAuthProvider};
use crate::services::catalog::{CachedCatalog, PgCatalog, ProductCatalog};
use crate::services::checkout::CheckoutService;
use crate::services::confirmation::ConfirmationHandler;
use crate::services::linking::AccountLinkingService;
use crate::services::payments::{HttpProcessor, PaymentProcessor, ProcessorError, WebhookVerifier};
use crate::services::reconciliation::ReconciliationService;
use crate::services::retry::RetryPolicy;

/// Application state shared across all handlers.
///
/// Cheaply cloneable via `Arc`. Every backend sits behind a trait object so
/// tests can assemble the same state over in-memory parts.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: StorefrontConfig,
    store: Arc<dyn Store>,
    catalog: Arc<dyn ProductCatalog>,
    processor: Arc<dyn PaymentProcessor>,
    auth: Arc<dyn AuthProvider>,
    verifier: WebhookVerifier,
    retry_policy: RetryPolicy,
}

impl AppState {
    /// Create the production state over a `PostgreSQL` pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the payment processor client cannot be built.
    pub fn new(config: StorefrontConfig, pool: PgPool) -> Result<Self, ProcessorError> {
        let store: Arc<dyn Store> = Arc::new(PgStore::new(pool.clone()));
        let catalog = Arc::new(CachedCatalog::new(PgCatalog::new(pool)));
        let processor = Arc::new(HttpProcessor::new(&config.payments, &config.base_url)?);
        let auth = Arc::new(LocalAuthProvider::new(Arc::clone(&store)));

        Ok(Self::from_parts(config, store, catalog, processor, auth))
    }

    /// Assemble state from explicit backends.
    #[must_use]
    pub fn from_parts(
        config: StorefrontConfig,
        store: Arc<dyn Store>,
        catalog: Arc<dyn ProductCatalog>,
        processor: Arc<dyn PaymentProcessor>,
        auth: Arc<dyn AuthProvider>,
    ) -> Self {
        let verifier = WebhookVerifier::new(
            config.payments.webhook_secret.clone(),
            config.payments.signature_tolerance,
        );
        let retry_policy = RetryPolicy::from(config.grants);

        Self {
            inner: Arc::new(AppStateInner {
                config,
                store,
                catalog,
                processor,
                auth,
                verifier,
                retry_policy,
            }),
        }
    }

    /// Get a reference to the storefront configuration.
    #[must_use]
    pub fn config(&self) -> &StorefrontConfig {
        &self.inner.config
    }

    /// Get the entitlement store.
    #[must_use]
    pub fn store(&self) -> &dyn Store {
        self.inner.store.as_ref()
    }

    /// Get the account provider.
    #[must_use]
    pub fn auth(&self) -> &dyn AuthProvider {
        self.inner.auth.as_ref()
    }

    /// Get the retry budget for post-payment writes.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        self.inner.retry_policy
    }

    /// Checkout initiation over the configured catalog and processor.
    #[must_use]
    pub fn checkout(&self) -> CheckoutService<'_> {
        CheckoutService::new(
            self.inner.catalog.as_ref(),
            self.inner.processor.as_ref(),
            self.store(),
            self.inner.config.payments.currency,
            self.inner.config.payments.timeout,
        )
    }

    /// Payment callback handling.
    #[must_use]
    pub fn confirmation(&self) -> ConfirmationHandler<'_> {
        ConfirmationHandler::new(&self.inner.verifier, self.store(), self.retry_policy())
    }

    /// Guest migration.
    #[must_use]
    pub fn linking(&self) -> AccountLinkingService<'_> {
        AccountLinkingService::new(self.store(), self.retry_policy())
    }

    /// Replay of queued grants and transfers.
    #[must_use]
    pub fn reconciliation(&self) -> ReconciliationService<'_> {
        ReconciliationService::new(self.store(), self.retry_policy())
    }
}
