//! Confirmation callback signature verification.
//!
//! Header format: `t=<unix seconds>,v1=<hex hmac-sha256>[,v1=...]`, where the
//! MAC covers `"{t}.{raw body}"`. Several `v1` entries may appear while the
//! processor rotates secrets; any one matching is enough.

use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use thiserror::Error;

/// Request header carrying the signature.
pub const SIGNATURE_HEADER: &str = "payments-signature";

/// Why a callback failed authentication.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("missing signature header")]
    MissingHeader,

    #[error("malformed signature header: {0}")]
    Malformed(&'static str),

    #[error("signature timestamp outside tolerance")]
    Expired,

    #[error("signature mismatch")]
    Mismatch,
}

/// Verifies callbacks signed with the shared webhook secret.
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: SecretString,
    tolerance: Duration,
}

impl std::fmt::Debug for WebhookVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookVerifier")
            .field("secret", &"[REDACTED]")
            .field("tolerance", &self.tolerance)
            .finish()
    }
}

impl WebhookVerifier {
    #[must_use]
    pub const fn new(secret: SecretString, tolerance: Duration) -> Self {
        Self { secret, tolerance }
    }

    /// Verify `payload` against the signature header at the current time.
    ///
    /// # Errors
    ///
    /// Returns [`SignatureError`] if the header is absent, unparseable,
    /// outside the replay window, or does not match.
    pub fn verify(&self, payload: &[u8], header: Option<&str>) -> Result<(), SignatureError> {
        self.verify_at(payload, header, Utc::now())
    }

    /// Verify as of `now`.
    ///
    /// # Errors
    ///
    /// See [`WebhookVerifier::verify`].
    pub fn verify_at(
        &self,
        payload: &[u8],
        header: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), SignatureError> {
        let header = header
            .filter(|h| !h.trim().is_empty())
            .ok_or(SignatureError::MissingHeader)?;

        let mut timestamp: Option<i64> = None;
        let mut signatures = Vec::new();
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => {
                    timestamp = Some(
                        value
                            .parse()
                            .map_err(|_| SignatureError::Malformed("invalid timestamp"))?,
                    );
                }
                Some(("v1", value)) => signatures.push(value),
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or(SignatureError::Malformed("missing timestamp"))?;
        if signatures.is_empty() {
            return Err(SignatureError::Malformed("missing v1 signature"));
        }

        if now.timestamp().abs_diff(timestamp) > self.tolerance.as_secs() {
            return Err(SignatureError::Expired);
        }

        let mac = self.mac(payload, timestamp);
        let matched = signatures.iter().any(|candidate| {
            hex::decode(candidate).is_ok_and(|bytes| mac.clone().verify_slice(&bytes).is_ok())
        });
        if matched {
            Ok(())
        } else {
            Err(SignatureError::Mismatch)
        }
    }

    /// Produce a header value for `payload` at `timestamp`.
    ///
    /// Used by tests and the local processor stub.
    #[must_use]
    pub fn sign(&self, payload: &[u8], timestamp: i64) -> String {
        let digest = self.mac(payload, timestamp).finalize().into_bytes();
        format!("t={timestamp},v1={}", hex::encode(digest))
    }

    fn mac(&self, payload: &[u8], timestamp: i64) -> Hmac<Sha256> {
        // HMAC accepts keys of any length
        #[allow(clippy::expect_used)]
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret.expose_secret().as_bytes())
            .expect("HMAC key of any size");
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        mac
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const PAYLOAD: &[u8] = br#"{"type":"checkout.session.completed"}"#;

    fn verifier() -> WebhookVerifier {
        WebhookVerifier::new(
            SecretString::from("whsec_test123secret456"),
            Duration::from_secs(300),
        )
    }

    #[test]
    fn test_valid_signature() {
        let now = Utc::now();
        let header = verifier().sign(PAYLOAD, now.timestamp());
        assert!(verifier().verify_at(PAYLOAD, Some(&header), now).is_ok());
    }

    #[test]
    fn test_wrong_secret_is_mismatch() {
        let now = Utc::now();
        let other = WebhookVerifier::new(SecretString::from("wrong"), Duration::from_secs(300));
        let header = other.sign(PAYLOAD, now.timestamp());
        assert_eq!(
            verifier().verify_at(PAYLOAD, Some(&header), now),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_modified_payload_is_mismatch() {
        let now = Utc::now();
        let header = verifier().sign(PAYLOAD, now.timestamp());
        let tampered = br#"{"type":"checkout.session.completed","x":1}"#;
        assert_eq!(
            verifier().verify_at(tampered, Some(&header), now),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_old_timestamp_is_expired() {
        let now = Utc::now();
        let header = verifier().sign(PAYLOAD, now.timestamp() - 600);
        assert_eq!(
            verifier().verify_at(PAYLOAD, Some(&header), now),
            Err(SignatureError::Expired)
        );
    }

    #[test]
    fn test_any_rotated_signature_matches() {
        let now = Utc::now();
        let good = verifier().sign(PAYLOAD, now.timestamp());
        let good_sig = good.split_once("v1=").unwrap().1;
        let header = format!("t={},v1=deadbeef,v1={good_sig}", now.timestamp());
        assert!(verifier().verify_at(PAYLOAD, Some(&header), now).is_ok());
    }

    #[test]
    fn test_missing_and_malformed_headers() {
        let now = Utc::now();
        assert_eq!(
            verifier().verify_at(PAYLOAD, None, now),
            Err(SignatureError::MissingHeader)
        );
        assert_eq!(
            verifier().verify_at(PAYLOAD, Some("v1=abc"), now),
            Err(SignatureError::Malformed("missing timestamp"))
        );
        assert_eq!(
            verifier().verify_at(PAYLOAD, Some("t=abc,v1=abc"), now),
            Err(SignatureError::Malformed("invalid timestamp"))
        );
        assert_eq!(
            verifier().verify_at(PAYLOAD, Some(&format!("t={}", now.timestamp())), now),
            Err(SignatureError::Malformed("missing v1 signature"))
        );
    }

    #[test]
    fn test_extreme_timestamps_are_expired() {
        let now = Utc::now();
        for timestamp in [i64::MIN, i64::MAX] {
            let header = format!("t={timestamp},v1=00");
            assert_eq!(
                verifier().verify_at(PAYLOAD, Some(&header), now),
                Err(SignatureError::Expired),
                "{timestamp}"
            );
        }
    }

    #[test]
    fn test_non_hex_signature_is_mismatch() {
        let now = Utc::now();
        let header = format!("t={},v1=not-hex", now.timestamp());
        assert_eq!(
            verifier().verify_at(PAYLOAD, Some(&header), now),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_truncated_signature_is_mismatch() {
        let now = Utc::now();
        let good = verifier().sign(PAYLOAD, now.timestamp());
        let truncated = good.get(..good.len() - 2).unwrap();
        assert_eq!(
            verifier().verify_at(PAYLOAD, Some(truncated), now),
            Err(SignatureError::Mismatch)
        );
    }
}
