//! Checkout session initiation.
//!
//! Looks up the authoritative price, opens a hosted checkout with the
//! processor, and records the server-validated facts the confirmation
//! handler will trust. Nothing here touches entitlements.

use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{info, instrument, warn};

use dietshop_core::{
    CheckoutMetadata, CheckoutRedirect, CheckoutRequest, CheckoutStatus, CurrencyCode, ProductId,
};

use crate::db::{RepositoryError, Store};
use crate::models::CheckoutRecord;
use crate::services::catalog::ProductCatalog;
use crate::services::payments::{CheckoutSessionParams, PaymentProcessor, ProcessorError};

/// Errors starting a checkout. All happen before any payment.
#[derive(Debug, Error)]
pub enum CheckoutError {
    #[error("product not found: {0}")]
    ProductNotFound(ProductId),

    /// The caller's price differs from the catalog.
    #[error("price mismatch for {product_id}: expected {expected}, catalog {actual}")]
    PriceMismatch {
        product_id: ProductId,
        expected: Decimal,
        actual: Decimal,
    },

    #[error("product {0} is not sold in {1}")]
    UnsupportedCurrency(ProductId, CurrencyCode),

    /// Network failure, timeout or 5xx from the processor. Retryable.
    #[error("payment processor unavailable: {0}")]
    ProcessorUnavailable(String),

    /// The processor refused the session.
    #[error(transparent)]
    Processor(ProcessorError),

    #[error(transparent)]
    Store(#[from] RepositoryError),
}

impl From<ProcessorError> for CheckoutError {
    fn from(err: ProcessorError) -> Self {
        if err.is_retryable() {
            Self::ProcessorUnavailable(err.to_string())
        } else {
            Self::Processor(err)
        }
    }
}

/// Starts checkouts for catalog products.
pub struct CheckoutService<'a> {
    catalog: &'a dyn ProductCatalog,
    processor: &'a dyn PaymentProcessor,
    store: &'a dyn Store,
    currency: CurrencyCode,
    processor_timeout: Duration,
}

impl<'a> CheckoutService<'a> {
    #[must_use]
    pub fn new(
        catalog: &'a dyn ProductCatalog,
        processor: &'a dyn PaymentProcessor,
        store: &'a dyn Store,
        currency: CurrencyCode,
        processor_timeout: Duration,
    ) -> Self {
        Self {
            catalog,
            processor,
            store,
            currency,
            processor_timeout,
        }
    }

    /// Open a hosted checkout for `request` and return the redirect.
    ///
    /// The metadata sent to the processor always carries the catalog price,
    /// never `request.product_price`.
    ///
    /// # Errors
    ///
    /// See [`CheckoutError`]. `ProcessorUnavailable` is safe to retry.
    #[instrument(
        skip_all,
        fields(product_id = %request.product_id, guest = request.is_guest())
    )]
    pub async fn initiate(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutRedirect, CheckoutError> {
        let product = self
            .catalog
            .product(&request.product_id)
            .await?
            .ok_or_else(|| CheckoutError::ProductNotFound(request.product_id.clone()))?;

        if product.price.currency_code != self.currency {
            return Err(CheckoutError::UnsupportedCurrency(
                product.id,
                product.price.currency_code,
            ));
        }

        if let Some(claimed) = request.product_price
            && claimed != product.price.amount
        {
            warn!(
                security = true,
                product_id = %product.id,
                claimed = %claimed,
                catalog = %product.price.amount,
                "Checkout price does not match catalog"
            );
            return Err(CheckoutError::PriceMismatch {
                product_id: product.id,
                expected: claimed,
                actual: product.price.amount,
            });
        }

        let metadata = CheckoutMetadata {
            product_id: product.id.clone(),
            product_price: product.price.amount,
            buyer_user_id: request.buyer_user_id.clone(),
            buyer_email: request.buyer_email.clone(),
        };
        let params = CheckoutSessionParams {
            product_title: product.title.clone(),
            price: product.price,
            metadata,
        };

        let session = tokio::time::timeout(
            self.processor_timeout,
            self.processor.create_checkout_session(&params),
        )
        .await
        .map_err(|_| {
            CheckoutError::ProcessorUnavailable(format!(
                "no response within {:?}",
                self.processor_timeout
            ))
        })??;

        let record = CheckoutRecord {
            checkout_session_id: session.id.clone(),
            product_id: product.id,
            price: product.price.amount,
            currency: product.price.currency_code,
            buyer_user_id: request.buyer_user_id.clone(),
            buyer_email: request.buyer_email.clone(),
            status: CheckoutStatus::PendingConfirmation,
            created_at: Utc::now(),
            resolved_at: None,
        };
        self.store.insert_checkout(&record).await?;

        info!(
            checkout_session_id = %session.id,
            price = %record.price,
            "Checkout session started"
        );

        Ok(CheckoutRedirect {
            checkout_session_id: session.id,
            redirect_url: session.url,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use dietshop_core::{CheckoutSessionId, Email, Price, Product, ProductType, UserId};

    use super::*;
    use crate::db::{CheckoutStore, EntitlementStore, MemoryStore};
    use crate::services::catalog::StaticCatalog;
    use crate::services::payments::CreatedSession;

    #[derive(Default)]
    struct RecordingProcessor {
        calls: Mutex<Vec<CheckoutSessionParams>>,
        fail_with: Option<u16>,
    }

    #[async_trait]
    impl PaymentProcessor for RecordingProcessor {
        async fn create_checkout_session(
            &self,
            params: &CheckoutSessionParams,
        ) -> Result<CreatedSession, ProcessorError> {
            self.calls.lock().unwrap().push(params.clone());
            match self.fail_with {
                Some(status) if status >= 500 => {
                    Err(ProcessorError::Unavailable(format!("status {status}")))
                }
                Some(status) => Err(ProcessorError::Rejected {
                    status,
                    message: "bad request".to_string(),
                }),
                None => Ok(CreatedSession {
                    id: CheckoutSessionId::new("cs_test_1"),
                    url: "https://pay.test/cs_test_1".to_string(),
                }),
            }
        }
    }

    fn catalog() -> StaticCatalog {
        StaticCatalog::new([Product {
            id: ProductId::new("diet_42"),
            title: "Keto Basics".to_string(),
            price: Price::new(Decimal::new(99, 0), CurrencyCode::USD),
            product_type: ProductType::Diet,
        }])
    }

    fn guest_request(price: Option<Decimal>) -> CheckoutRequest {
        CheckoutRequest {
            product_id: ProductId::new("diet_42"),
            product_price: price,
            buyer_email: Email::parse("a@x.com").unwrap(),
            buyer_user_id: None,
        }
    }

    fn service<'a>(
        catalog: &'a StaticCatalog,
        processor: &'a RecordingProcessor,
        store: &'a MemoryStore,
    ) -> CheckoutService<'a> {
        CheckoutService::new(
            catalog,
            processor,
            store,
            CurrencyCode::USD,
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_initiate_records_catalog_price() {
        let (catalog, processor, store) = (catalog(), RecordingProcessor::default(), MemoryStore::new());

        let redirect = service(&catalog, &processor, &store)
            .initiate(&guest_request(Some(Decimal::new(9900, 2))))
            .await
            .unwrap();

        assert_eq!(redirect.redirect_url, "https://pay.test/cs_test_1");

        let record = store
            .get_checkout(&redirect.checkout_session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.price, Decimal::new(99, 0));
        assert_eq!(record.status, CheckoutStatus::PendingConfirmation);
        assert!(record.buyer_user_id.is_none());

        let calls = processor.calls.lock().unwrap();
        assert_eq!(calls[0].metadata.product_price, Decimal::new(99, 0));
    }

    #[tokio::test]
    async fn test_initiate_never_grants() {
        let (catalog, processor, store) = (catalog(), RecordingProcessor::default(), MemoryStore::new());
        let request = CheckoutRequest {
            buyer_user_id: Some(UserId::new("u2")),
            ..guest_request(None)
        };

        service(&catalog, &processor, &store)
            .initiate(&request)
            .await
            .unwrap();

        let email = Email::parse("a@x.com").unwrap();
        assert!(store.pending_for_email(&email).await.unwrap().is_empty());
        assert!(
            crate::db::AccountStore::get_customer(&store, &UserId::new("u2"))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_price_mismatch_is_rejected_before_processor() {
        let (catalog, processor, store) = (catalog(), RecordingProcessor::default(), MemoryStore::new());

        let err = service(&catalog, &processor, &store)
            .initiate(&guest_request(Some(Decimal::new(1, 0))))
            .await
            .unwrap_err();

        assert!(matches!(err, CheckoutError::PriceMismatch { .. }));
        assert!(processor.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_product() {
        let (catalog, processor, store) = (catalog(), RecordingProcessor::default(), MemoryStore::new());
        let request = CheckoutRequest {
            product_id: ProductId::new("nope"),
            ..guest_request(None)
        };

        let err = service(&catalog, &processor, &store)
            .initiate(&request)
            .await
            .unwrap_err();
        assert!(matches!(err, CheckoutError::ProductNotFound(_)));
    }

    #[tokio::test]
    async fn test_processor_errors_are_classified() {
        let (catalog, store) = (catalog(), MemoryStore::new());

        let down = RecordingProcessor {
            fail_with: Some(503),
            ..Default::default()
        };
        let err = service(&catalog, &down, &store)
            .initiate(&guest_request(None))
            .await
            .unwrap_err();
        assert!(matches!(err, CheckoutError::ProcessorUnavailable(_)));

        let refused = RecordingProcessor {
            fail_with: Some(400),
            ..Default::default()
        };
        let err = service(&catalog, &refused, &store)
            .initiate(&guest_request(None))
            .await
            .unwrap_err();
        assert!(matches!(err, CheckoutError::Processor(_)));
    }
}
