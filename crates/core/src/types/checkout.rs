//! Checkout requests and the metadata echoed through the payment processor.
//!
//! The processor treats metadata as an opaque string map and returns it
//! verbatim on its confirmation callback. [`CheckoutMetadata`] is the typed
//! view of that map; the key names are part of the wire contract.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::email::{Email, EmailError};
use super::id::{ProductId, UserId};

/// Metadata key for the purchased product.
pub const META_PRODUCT_ID: &str = "product_id";
/// Metadata key for the server-validated price.
pub const META_PRODUCT_PRICE: &str = "product_price";
/// Metadata key for the signed-in buyer (empty for guests).
pub const META_BUYER_USER_ID: &str = "buyer_user_id";
/// Metadata key for the buyer's email.
pub const META_BUYER_EMAIL: &str = "buyer_email";

/// A request to start checkout for one product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutRequest {
    pub product_id: ProductId,
    /// Price the caller believes it is paying. Only ever compared against the
    /// catalog; never used as the charged amount.
    pub product_price: Option<Decimal>,
    pub buyer_email: Email,
    /// `None` means guest checkout.
    pub buyer_user_id: Option<UserId>,
}

impl CheckoutRequest {
    /// Whether this checkout is attributed to an email rather than an account.
    #[must_use]
    pub const fn is_guest(&self) -> bool {
        self.buyer_user_id.is_none()
    }
}

/// Errors decoding [`CheckoutMetadata`] from a processor metadata map.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MetadataError {
    #[error("metadata is missing `{0}`")]
    Missing(&'static str),

    #[error("metadata field `{0}` is not a valid decimal")]
    InvalidPrice(&'static str),

    #[error("metadata buyer email is invalid: {0}")]
    InvalidEmail(#[from] EmailError),
}

/// Checkout facts embedded at initiation and echoed back on confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutMetadata {
    pub product_id: ProductId,
    pub product_price: Decimal,
    pub buyer_user_id: Option<UserId>,
    pub buyer_email: Email,
}

impl CheckoutMetadata {
    /// Encode as the processor's string map.
    #[must_use]
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert(META_PRODUCT_ID.to_owned(), self.product_id.to_string());
        map.insert(
            META_PRODUCT_PRICE.to_owned(),
            self.product_price.normalize().to_string(),
        );
        map.insert(
            META_BUYER_USER_ID.to_owned(),
            self.buyer_user_id
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default(),
        );
        map.insert(META_BUYER_EMAIL.to_owned(), self.buyer_email.to_string());
        map
    }

    /// Decode from the processor's string map.
    ///
    /// An absent or empty `buyer_user_id` decodes as a guest purchase.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError`] if a required key is missing or malformed.
    pub fn from_map(map: &BTreeMap<String, String>) -> Result<Self, MetadataError> {
        let product_id = map
            .get(META_PRODUCT_ID)
            .filter(|v| !v.is_empty())
            .ok_or(MetadataError::Missing(META_PRODUCT_ID))?;

        let product_price = map
            .get(META_PRODUCT_PRICE)
            .ok_or(MetadataError::Missing(META_PRODUCT_PRICE))?
            .parse::<Decimal>()
            .map_err(|_| MetadataError::InvalidPrice(META_PRODUCT_PRICE))?;

        let buyer_user_id = map
            .get(META_BUYER_USER_ID)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .map(UserId::from);

        let buyer_email = map
            .get(META_BUYER_EMAIL)
            .ok_or(MetadataError::Missing(META_BUYER_EMAIL))?;
        let buyer_email = Email::parse(buyer_email)?;

        Ok(Self {
            product_id: ProductId::new(product_id.as_str()),
            product_price,
            buyer_user_id,
            buyer_email,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn guest_metadata() -> CheckoutMetadata {
        CheckoutMetadata {
            product_id: ProductId::new("diet_42"),
            product_price: Decimal::new(99, 0),
            buyer_user_id: None,
            buyer_email: Email::parse("a@x.com").unwrap(),
        }
    }

    #[test]
    fn test_guest_metadata_encodes_empty_user() {
        let map = guest_metadata().to_map();
        assert_eq!(map.get(META_BUYER_USER_ID).unwrap(), "");
        assert_eq!(map.get(META_PRODUCT_PRICE).unwrap(), "99");

        let decoded = CheckoutMetadata::from_map(&map).unwrap();
        assert_eq!(decoded, guest_metadata());
        assert!(decoded.buyer_user_id.is_none());
    }

    #[test]
    fn test_signed_in_metadata() {
        let mut metadata = guest_metadata();
        metadata.buyer_user_id = Some(UserId::new("u2"));

        let decoded = CheckoutMetadata::from_map(&metadata.to_map()).unwrap();
        assert_eq!(decoded.buyer_user_id, Some(UserId::new("u2")));
    }

    #[test]
    fn test_missing_user_key_is_guest() {
        let mut map = guest_metadata().to_map();
        map.remove(META_BUYER_USER_ID);
        assert!(CheckoutMetadata::from_map(&map).unwrap().buyer_user_id.is_none());
    }

    #[test]
    fn test_missing_product_is_error() {
        let mut map = guest_metadata().to_map();
        map.remove(META_PRODUCT_ID);
        assert!(matches!(
            CheckoutMetadata::from_map(&map),
            Err(MetadataError::Missing(META_PRODUCT_ID))
        ));
    }

    #[test]
    fn test_bad_price_is_error() {
        let mut map = guest_metadata().to_map();
        map.insert(META_PRODUCT_PRICE.to_owned(), "ninety-nine".to_owned());
        assert!(matches!(
            CheckoutMetadata::from_map(&map),
            Err(MetadataError::InvalidPrice(_))
        ));
    }

    #[test]
    fn test_bad_email_is_error() {
        let mut map = guest_metadata().to_map();
        map.insert(META_BUYER_EMAIL.to_owned(), "nobody".to_owned());
        assert!(matches!(
            CheckoutMetadata::from_map(&map),
            Err(MetadataError::InvalidEmail(_))
        ));
    }
}
