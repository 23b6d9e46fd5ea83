//! Payment processor boundary.
//!
//! Outbound: [`PaymentProcessor::create_checkout_session`] opens a hosted
//! checkout carrying [`CheckoutMetadata`] as opaque metadata.
//! Inbound: [`WebhookVerifier`] authenticates the signed confirmation
//! callback and [`PaymentEvent`] decodes it.

mod event;
mod signature;

pub use event::{EventAction, EventData, PaymentEvent, SessionObject};
pub use signature::{SIGNATURE_HEADER, SignatureError, WebhookVerifier};

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use rust_decimal::Decimal;
use secrecy::ExposeSecret;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use dietshop_core::{CheckoutMetadata, CheckoutSessionId, Price};

use crate::config::PaymentsConfig;

/// Errors from the payment processor API.
#[derive(Debug, Error)]
pub enum ProcessorError {
    /// Network failure, timeout or 5xx. The shopper may retry.
    #[error("payment processor unavailable: {0}")]
    Unavailable(String),

    /// The processor refused the request.
    #[error("payment processor rejected request: {status} - {message}")]
    Rejected { status: u16, message: String },

    /// The processor answered with something we could not read.
    #[error("invalid processor response: {0}")]
    InvalidResponse(String),

    /// The amount cannot be expressed in the currency's minor units.
    #[error("amount {0} cannot be charged")]
    InvalidAmount(Decimal),
}

impl ProcessorError {
    /// Whether the shopper can usefully try again.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<reqwest::Error> for ProcessorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::InvalidResponse(err.to_string())
        } else {
            Self::Unavailable(err.to_string())
        }
    }
}

/// What to sell in one hosted checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSessionParams {
    pub product_title: String,
    /// Catalog price; the charged amount.
    pub price: Price,
    pub metadata: CheckoutMetadata,
}

/// A checkout the processor has accepted.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CreatedSession {
    pub id: CheckoutSessionId,
    pub url: String,
}

/// Outbound half of the processor boundary.
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    /// Open a hosted checkout and return where to send the shopper.
    async fn create_checkout_session(
        &self,
        params: &CheckoutSessionParams,
    ) -> Result<CreatedSession, ProcessorError>;
}

#[async_trait]
impl<P: PaymentProcessor + ?Sized> PaymentProcessor for Arc<P> {
    async fn create_checkout_session(
        &self,
        params: &CheckoutSessionParams,
    ) -> Result<CreatedSession, ProcessorError> {
        (**self).create_checkout_session(params).await
    }
}

/// HTTP client for a Stripe-compatible checkout sessions API.
#[derive(Clone)]
pub struct HttpProcessor {
    client: reqwest::Client,
    endpoint: Url,
    success_url: String,
    cancel_url: String,
}

impl HttpProcessor {
    /// Build a client from configuration.
    ///
    /// The success URL sends the shopper to the dashboard with the processor's
    /// session ID substituted into `checkout_session_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the API key is not a valid header value or the
    /// HTTP client fails to build.
    pub fn new(config: &PaymentsConfig, base_url: &Url) -> Result<Self, ProcessorError> {
        let mut headers = HeaderMap::new();
        let auth_value = format!("Bearer {}", config.secret_key.expose_secret());
        let mut auth_value = HeaderValue::from_str(&auth_value)
            .map_err(|e| ProcessorError::InvalidResponse(format!("Invalid API key format: {e}")))?;
        auth_value.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth_value);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()?;

        let endpoint = config
            .api_base
            .join("v1/checkout/sessions")
            .map_err(|e| ProcessorError::InvalidResponse(e.to_string()))?;

        let base = base_url.as_str().trim_end_matches('/');
        Ok(Self {
            client,
            endpoint,
            success_url: format!("{base}/dashboard?checkout_session_id={{CHECKOUT_SESSION_ID}}"),
            cancel_url: format!("{base}/checkout/cancelled"),
        })
    }

    fn form(&self, params: &CheckoutSessionParams) -> Result<Vec<(String, String)>, ProcessorError> {
        let unit_amount = params
            .price
            .to_minor_units()
            .filter(|amount| *amount >= 0)
            .ok_or(ProcessorError::InvalidAmount(params.price.amount))?;

        let mut form = vec![
            ("mode".to_string(), "payment".to_string()),
            ("success_url".to_string(), self.success_url.clone()),
            ("cancel_url".to_string(), self.cancel_url.clone()),
            (
                "customer_email".to_string(),
                params.metadata.buyer_email.to_string(),
            ),
            (
                "line_items[0][price_data][currency]".to_string(),
                params.price.currency_code.code().to_lowercase(),
            ),
            (
                "line_items[0][price_data][unit_amount]".to_string(),
                unit_amount.to_string(),
            ),
            (
                "line_items[0][price_data][product_data][name]".to_string(),
                params.product_title.clone(),
            ),
            ("line_items[0][quantity]".to_string(), "1".to_string()),
        ];

        for (key, value) in params.metadata.to_map() {
            form.push((format!("metadata[{key}]"), value));
        }

        Ok(form)
    }
}

#[async_trait]
impl PaymentProcessor for HttpProcessor {
    #[tracing::instrument(skip_all, fields(product_id = %params.metadata.product_id))]
    async fn create_checkout_session(
        &self,
        params: &CheckoutSessionParams,
    ) -> Result<CreatedSession, ProcessorError> {
        let form = self.form(params)?;

        let response = self
            .client
            .post(self.endpoint.clone())
            .form(&form)
            .send()
            .await?;
        let status = response.status();

        if status.is_server_error() {
            return Err(ProcessorError::Unavailable(format!("status {}", status.as_u16())));
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProcessorError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let session: CreatedSession = response.json().await?;
        tracing::debug!(checkout_session_id = %session.id, "Checkout session created");
        Ok(session)
    }
}
