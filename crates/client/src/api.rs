//! HTTP client for the storefront.
//!
//! Holds the session cookie across calls the way a browser would, so
//! `login` followed by `entitlements` reads the signed-in account.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use url::Url;

use dietshop_core::{
    AccountResponse, CheckoutRedirect, Credentials, Email, EntitlementSummary, StartCheckout,
    TransferGuestPurchase,
};

use crate::error::ClientError;
use crate::guest_session::AccountLinker;
use crate::poller::EntitlementSource;

/// Default per-request timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Error body returned by the storefront.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// Cookie-backed storefront API client.
#[derive(Debug, Clone)]
pub struct StorefrontApi {
    client: reqwest::Client,
    base_url: Url,
}

impl StorefrontApi {
    /// Client for the storefront at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client fails to build.
    pub fn new(base_url: Url) -> Result<Self, ClientError> {
        Self::with_timeout(base_url, DEFAULT_TIMEOUT)
    }

    /// Client with an explicit per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client fails to build.
    pub fn with_timeout(base_url: Url, timeout: Duration) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(timeout)
            .build()?;

        Ok(Self { client, base_url })
    }

    /// Create an account. The server migrates guest purchases made under the
    /// same email as part of the call.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Status`] with 409 if the email is taken.
    pub async fn register(&self, email: &str, password: &str) -> Result<AccountResponse, ClientError> {
        self.post("auth/register", &credentials(email, password))
            .await
    }

    /// Sign in. Also migrates guest purchases.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Unauthorized`] on bad credentials.
    pub async fn login(&self, email: &str, password: &str) -> Result<AccountResponse, ClientError> {
        self.post("auth/login", &credentials(email, password)).await
    }

    /// Sign out.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub async fn logout(&self) -> Result<(), ClientError> {
        let response = self.client.post(self.url("auth/logout")?).send().await?;
        check(response).await?;
        Ok(())
    }

    /// Start a hosted checkout and get the processor redirect.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Status`] for catalog and price errors, and a
    /// transient error when the processor is unavailable.
    pub async fn start_checkout(&self, body: &StartCheckout) -> Result<CheckoutRedirect, ClientError> {
        self.post("api/checkout", body).await
    }

    /// Products owned by the signed-in account.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Unauthorized`] when not signed in.
    pub async fn entitlements(&self) -> Result<EntitlementSummary, ClientError> {
        let response = self
            .client
            .get(self.url("api/account/entitlements")?)
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    /// Ask the server to re-run guest migration for the signed-in account.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Status`] with 403 if `email` is not the
    /// account's.
    pub async fn transfer_guest_purchase(
        &self,
        email: Option<Email>,
    ) -> Result<AccountResponse, ClientError> {
        self.post(
            "api/account/transfer-guest-purchase",
            &TransferGuestPurchase { email },
        )
        .await
    }

    fn url(&self, path: &str) -> Result<Url, ClientError> {
        Ok(self.base_url.join(path)?)
    }

    async fn post<B, T>(&self, path: &str, body: &B) -> Result<T, ClientError>
    where
        B: Serialize + Sync + ?Sized,
        T: DeserializeOwned,
    {
        let response = self.client.post(self.url(path)?).json(body).send().await?;
        Ok(check(response).await?.json().await?)
    }
}

fn credentials(email: &str, password: &str) -> Credentials {
    Credentials {
        email: email.to_string(),
        password: password.to_string(),
    }
}

/// Map a non-success response to a [`ClientError`].
async fn check(response: Response) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::UNAUTHORIZED {
        return Err(ClientError::Unauthorized);
    }

    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&text).map_or(text, |body| body.error);
    Err(ClientError::Status {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl AccountLinker for StorefrontApi {
    async fn transfer_guest_purchase(
        &self,
        email: Option<&Email>,
    ) -> Result<AccountResponse, ClientError> {
        Self::transfer_guest_purchase(self, email.cloned()).await
    }
}

#[async_trait]
impl EntitlementSource for StorefrontApi {
    async fn entitlements(&self) -> Result<EntitlementSummary, ClientError> {
        Self::entitlements(self).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use axum::{Json, Router, http::StatusCode as AxumStatus, routing::{get, post}};

    use super::*;

    async fn serve(router: Router) -> Url {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        Url::parse(&format!("http://{addr}/")).unwrap()
    }

    #[tokio::test]
    async fn test_error_body_is_surfaced() {
        let router = Router::new().route(
            "/api/checkout",
            post(|| async {
                (
                    AxumStatus::BAD_REQUEST,
                    Json(serde_json::json!({"error": "price mismatch"})),
                )
            }),
        );
        let api = StorefrontApi::new(serve(router).await).unwrap();

        let err = api
            .start_checkout(&StartCheckout {
                product_id: "diet_42".into(),
                expected_price: None,
                guest_email: None,
            })
            .await
            .unwrap_err();

        match err {
            ClientError::Status { status, message } => {
                assert_eq!(status, 400);
                assert_eq!(message, "price mismatch");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unauthorized_maps_to_variant() {
        let router = Router::new().route(
            "/api/account/entitlements",
            get(|| async { AxumStatus::UNAUTHORIZED }),
        );
        let api = StorefrontApi::new(serve(router).await).unwrap();

        assert!(matches!(
            api.entitlements().await,
            Err(ClientError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn test_server_errors_are_transient() {
        let router = Router::new().route(
            "/api/account/entitlements",
            get(|| async { AxumStatus::SERVICE_UNAVAILABLE }),
        );
        let api = StorefrontApi::new(serve(router).await).unwrap();

        let err = api.entitlements().await.unwrap_err();
        assert!(err.is_transient());
    }
}
