//! Authentication boundary.
//!
//! The entitlement store keys accounts on the stable `UserId` an
//! [`AuthProvider`] returns. [`LocalAuthProvider`] issues UUID identities and
//! keeps Argon2id password hashes in the account store.

mod error;

pub use error::AuthError;

use std::sync::Arc;

use argon2::{
    Algorithm, Argon2, Params, Version,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use async_trait::async_trait;
use tracing::instrument;

use dietshop_core::{Email, UserId};

use crate::db::{RepositoryError, Store};

/// Minimum password length.
const MIN_PASSWORD_LENGTH: usize = 8;

/// An authenticated account identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub email: Email,
}

/// Account creation and sign-in.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Create an account and return its stable identity.
    async fn create_account(&self, email: &str, password: &str) -> Result<Identity, AuthError>;

    /// Check credentials and return the account identity.
    async fn authenticate(&self, email: &str, password: &str) -> Result<Identity, AuthError>;
}

/// Password accounts stored alongside the customer documents.
pub struct LocalAuthProvider {
    store: Arc<dyn Store>,
    argon2: Argon2<'static>,
}

impl LocalAuthProvider {
    /// Provider with the default Argon2id parameters.
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            argon2: Argon2::default(),
        }
    }

    /// Provider with explicit Argon2id cost parameters.
    #[must_use]
    pub fn with_params(store: Arc<dyn Store>, params: Params) -> Self {
        Self {
            store,
            argon2: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
        }
    }

    /// Hash a password using Argon2id.
    fn hash_password(&self, password: &str) -> Result<String, AuthError> {
        let salt = SaltString::generate(&mut OsRng);

        self.argon2
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|_| AuthError::PasswordHash)
    }

    /// Verify a password against a hash.
    fn verify_password(&self, password: &str, hash: &str) -> Result<(), AuthError> {
        let parsed_hash = PasswordHash::new(hash).map_err(|_| AuthError::InvalidCredentials)?;

        self.argon2
            .verify_password(password.as_bytes(), &parsed_hash)
            .map_err(|_| AuthError::InvalidCredentials)
    }
}

#[async_trait]
impl AuthProvider for LocalAuthProvider {
    /// Register a new account with email and password.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::InvalidEmail` if the email format is invalid.
    /// Returns `AuthError::WeakPassword` if the password doesn't meet requirements.
    /// Returns `AuthError::UserAlreadyExists` if the email is already registered.
    #[instrument(skip_all)]
    async fn create_account(&self, email: &str, password: &str) -> Result<Identity, AuthError> {
        let email = Email::parse(email)?;
        validate_password(password)?;
        let password_hash = self.hash_password(password)?;

        let user_id = UserId::generate();
        let customer = self
            .store
            .create_account(&user_id, &email, &password_hash)
            .await
            .map_err(|e| match e {
                RepositoryError::Conflict(_) => AuthError::UserAlreadyExists,
                other => AuthError::Repository(other),
            })?;

        tracing::info!(user_id = %customer.id, "Account created");
        Ok(Identity {
            user_id: customer.id,
            email: customer.email,
        })
    }

    /// Login with email and password.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::InvalidCredentials` if the email/password is wrong.
    #[instrument(skip_all)]
    async fn authenticate(&self, email: &str, password: &str) -> Result<Identity, AuthError> {
        let email = Email::parse(email)?;

        let (user_id, password_hash) = self
            .store
            .password_hash(&email)
            .await?
            .ok_or(AuthError::InvalidCredentials)?;

        self.verify_password(password, &password_hash)?;

        Ok(Identity { user_id, email })
    }
}

/// Validate password meets requirements.
fn validate_password(password: &str) -> Result<(), AuthError> {
    if password.chars().count() < MIN_PASSWORD_LENGTH {
        return Err(AuthError::WeakPassword(format!(
            "password must be at least {MIN_PASSWORD_LENGTH} characters"
        )));
    }

    Ok(())
}
