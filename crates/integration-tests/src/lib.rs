//! Integration tests for Dietshop.
//!
//! # Running Tests
//!
//! ```bash
//! cargo test -p dietshop-integration-tests
//! ```
//!
//! The storefront runs over [`MemoryStore`] and a stub payment processor, so
//! no database or network access is needed. Tests that go over HTTP start
//! the full router on an ephemeral port and drive it with the real client.
//!
//! # Test Categories
//!
//! - `purchase_flow` - Checkout through confirmation, over HTTP
//! - `confirmation` - Idempotent, price-safe grants
//! - `guest_migration` - Guest purchases joining an account in any order
//! - `reconciliation` - Queued grants and transfers

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use argon2::Params;
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use secrecy::SecretString;
use url::Url;

use dietshop_client::StorefrontApi;
use dietshop_core::{
    CheckoutMetadata, CheckoutRedirect, CheckoutRequest, CheckoutSessionId, CurrencyCode, Email,
    Price, Product, ProductId, ProductType,
};
use dietshop_storefront::app;
use dietshop_storefront::config::{GrantConfig, PaymentsConfig, StorefrontConfig};
use dietshop_storefront::db::MemoryStore;
use dietshop_storefront::middleware::session_layer;
use dietshop_storefront::services::auth::LocalAuthProvider;
use dietshop_storefront::services::catalog::StaticCatalog;
use dietshop_storefront::services::checkout::CheckoutError;
use dietshop_storefront::services::confirmation::{ConfirmationError, ConfirmationOutcome};
use dietshop_storefront::services::payments::{
    CheckoutSessionParams, CreatedSession, PaymentProcessor, ProcessorError, SIGNATURE_HEADER,
    WebhookVerifier,
};
use dietshop_storefront::state::AppState;

/// Shared secret the stub processor signs callbacks with.
pub const WEBHOOK_SECRET: &str = "whsec_integration_only";

/// Event type for a paid hosted checkout.
pub const COMPLETED: &str = "checkout.session.completed";

/// The diet plan every scenario sells.
#[must_use]
pub fn diet_42() -> Product {
    Product {
        id: ProductId::new("diet_42"),
        title: "Mediterranean Diet Plan".to_string(),
        price: Price::new(Decimal::new(99, 0), CurrencyCode::USD),
        product_type: ProductType::Diet,
    }
}

/// The course every scenario sells.
#[must_use]
pub fn course_7() -> Product {
    Product {
        id: ProductId::new("course_7"),
        title: "Meal Prep Fundamentals".to_string(),
        price: Price::new(Decimal::new(49, 0), CurrencyCode::USD),
        product_type: ProductType::Course,
    }
}

/// Parse a test email.
///
/// # Panics
///
/// Panics if `s` is not a valid address.
#[must_use]
pub fn email(s: &str) -> Email {
    Email::parse(s).expect("valid test email")
}

/// Storefront configuration for tests: plain HTTP, no Sentry, fast retries,
/// and no background worker.
///
/// # Panics
///
/// Panics if the hard-coded URLs fail to parse.
#[must_use]
pub fn test_config() -> StorefrontConfig {
    StorefrontConfig {
        database_url: SecretString::from("postgres://unused@localhost/dietshop_test"),
        host: "127.0.0.1".parse().expect("valid host"),
        port: 0,
        base_url: Url::parse("http://127.0.0.1/").expect("valid base URL"),
        session_secret: SecretString::from("integration-session-key-9fQ2xL7pW4mZ8vK3"),
        payments: PaymentsConfig {
            api_base: Url::parse("http://127.0.0.1:9/").expect("valid processor URL"),
            secret_key: SecretString::from("sk_integration"),
            webhook_secret: SecretString::from(WEBHOOK_SECRET),
            currency: CurrencyCode::USD,
            timeout: Duration::from_secs(2),
            signature_tolerance: Duration::from_secs(300),
        },
        grants: GrantConfig {
            max_attempts: 2,
            retry_base: Duration::from_millis(1),
            attempt_timeout: Duration::from_secs(1),
        },
        reconcile_interval: None,
        sentry_dsn: None,
        sentry_environment: None,
        sentry_sample_rate: 0.0,
        sentry_traces_sample_rate: 0.0,
    }
}

/// Payment processor double.
///
/// Hands out sequential `cs_test_N` session IDs and remembers what each
/// session was opened for, so tests can build the callback the real
/// processor would send.
#[derive(Default)]
pub struct StubProcessor {
    counter: AtomicU32,
    unavailable: AtomicBool,
    sessions: Mutex<Vec<(CheckoutSessionId, CheckoutSessionParams)>>,
}

impl StubProcessor {
    /// Make every following call fail as a network error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// What session `id` was opened with.
    #[must_use]
    pub fn params(&self, id: &CheckoutSessionId) -> Option<CheckoutSessionParams> {
        self.sessions
            .lock()
            .ok()?
            .iter()
            .find(|(session_id, _)| session_id == id)
            .map(|(_, params)| params.clone())
    }

    /// Number of sessions opened so far.
    #[must_use]
    pub fn opened(&self) -> usize {
        self.sessions.lock().map_or(0, |sessions| sessions.len())
    }
}

#[async_trait]
impl PaymentProcessor for StubProcessor {
    async fn create_checkout_session(
        &self,
        params: &CheckoutSessionParams,
    ) -> Result<CreatedSession, ProcessorError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ProcessorError::Unavailable("connection refused".to_string()));
        }

        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let id = CheckoutSessionId::new(format!("cs_test_{n}"));
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.push((id.clone(), params.clone()));
        }

        Ok(CreatedSession {
            url: format!("https://pay.test/c/{id}"),
            id,
        })
    }
}

/// A storefront wired over in-memory backends.
pub struct TestContext {
    pub state: AppState,
    pub store: MemoryStore,
    pub processor: Arc<StubProcessor>,
    verifier: WebhookVerifier,
    events: AtomicU32,
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl TestContext {
    /// Storefront selling [`diet_42`] and [`course_7`].
    #[must_use]
    pub fn new() -> Self {
        let config = test_config();
        let store = MemoryStore::new();
        let processor = Arc::new(StubProcessor::default());
        let shared: Arc<dyn dietshop_storefront::db::Store> = Arc::new(store.clone());
        // Minimum Argon2 cost
        let params = Params::new(8, 1, 1, None).expect("valid argon2 params");
        let auth = Arc::new(LocalAuthProvider::with_params(Arc::clone(&shared), params));
        let catalog = Arc::new(StaticCatalog::new([diet_42(), course_7()]));
        let verifier = WebhookVerifier::new(
            config.payments.webhook_secret.clone(),
            config.payments.signature_tolerance,
        );

        let state = AppState::from_parts(
            config,
            shared,
            catalog,
            Arc::clone(&processor) as Arc<dyn PaymentProcessor>,
            auth,
        );

        Self {
            state,
            store,
            processor,
            verifier,
            events: AtomicU32::new(0),
        }
    }

    /// Start the full router on an ephemeral port and return its base URL.
    ///
    /// # Panics
    ///
    /// Panics if no local port can be bound.
    pub async fn serve(&self) -> Url {
        let router = app(
            self.state.clone(),
            session_layer(
                tower_sessions::MemoryStore::default(),
                self.state.config(),
            ),
        );
        let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .expect("bind ephemeral port");
        let addr = listener.local_addr().expect("local address");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("test server");
        });
        Url::parse(&format!("http://{addr}/")).expect("valid server URL")
    }

    /// A fresh cookie jar against `base_url`, as one browser would hold.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client cannot be built.
    #[must_use]
    pub fn browser(base_url: &Url) -> StorefrontApi {
        StorefrontApi::new(base_url.clone()).expect("storefront client")
    }

    /// Start a guest checkout through the service layer.
    ///
    /// # Errors
    ///
    /// Returns the checkout error unchanged.
    pub async fn guest_checkout(
        &self,
        product: &Product,
        buyer: &str,
    ) -> Result<CheckoutRedirect, CheckoutError> {
        self.state
            .checkout()
            .initiate(&CheckoutRequest {
                product_id: product.id.clone(),
                product_price: Some(product.price.amount),
                buyer_email: email(buyer),
                buyer_user_id: None,
            })
            .await
    }

    /// Start a signed-in checkout through the service layer.
    ///
    /// # Errors
    ///
    /// Returns the checkout error unchanged.
    pub async fn customer_checkout(
        &self,
        product: &Product,
        user_id: &dietshop_core::UserId,
        buyer: &str,
    ) -> Result<CheckoutRedirect, CheckoutError> {
        self.state
            .checkout()
            .initiate(&CheckoutRequest {
                product_id: product.id.clone(),
                product_price: Some(product.price.amount),
                buyer_email: email(buyer),
                buyer_user_id: Some(user_id.clone()),
            })
            .await
    }

    /// The event body the processor sends when checkout `id` is paid.
    ///
    /// Metadata is echoed exactly as it was handed to the processor.
    ///
    /// # Panics
    ///
    /// Panics if the stub processor never opened `id`.
    #[must_use]
    pub fn paid_event(&self, id: &CheckoutSessionId) -> Vec<u8> {
        let params = self.processor.params(id).expect("session opened by stub");
        self.event(COMPLETED, id, &params.metadata, params.price.to_minor_units())
    }

    /// A signed-shape event body with explicit contents.
    ///
    /// Every call gets a new event ID, as a processor redelivery would not.
    ///
    /// # Panics
    ///
    /// Panics if the body cannot be serialized.
    #[must_use]
    pub fn event(
        &self,
        event_type: &str,
        id: &CheckoutSessionId,
        metadata: &CheckoutMetadata,
        amount_total: Option<i64>,
    ) -> Vec<u8> {
        let n = self.events.fetch_add(1, Ordering::SeqCst) + 1;
        serde_json::to_vec(&serde_json::json!({
            "id": format!("evt_{n}"),
            "type": event_type,
            "created": Utc::now().timestamp(),
            "data": {"object": {
                "id": id.as_str(),
                "payment_status": "paid",
                "amount_total": amount_total,
                "currency": "usd",
                "metadata": metadata.to_map(),
            }}
        }))
        .expect("serializable event")
    }

    /// Signature header for `payload`, valid now.
    #[must_use]
    pub fn sign(&self, payload: &[u8]) -> String {
        self.verifier.sign(payload, Utc::now().timestamp())
    }

    /// Deliver a correctly signed callback to the confirmation handler.
    ///
    /// # Errors
    ///
    /// Returns the handler's error unchanged.
    pub async fn deliver(&self, payload: &[u8]) -> Result<ConfirmationOutcome, ConfirmationError> {
        let signature = self.sign(payload);
        self.state
            .confirmation()
            .handle(payload, Some(&signature))
            .await
    }

    /// POST `payload` to the callback endpoint of the server at `base_url`,
    /// signed when `signed` is set. Returns the status code.
    ///
    /// # Panics
    ///
    /// Panics if the request cannot be sent.
    pub async fn post_callback(&self, base_url: &Url, payload: Vec<u8>, signed: bool) -> u16 {
        let mut request = reqwest::Client::new()
            .post(base_url.join("webhooks/payments").expect("valid callback URL"))
            .header("content-type", "application/json");
        if signed {
            request = request.header(SIGNATURE_HEADER, self.sign(&payload));
        }

        request
            .body(payload)
            .send()
            .await
            .expect("callback delivered")
            .status()
            .as_u16()
    }
}
