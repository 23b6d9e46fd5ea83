//! Post-checkout entitlement refresh.
//!
//! The shopper's return from the payment processor and the processor's
//! confirmation callback are independent signals. The dashboard may load
//! before the server has granted anything, so after a redirect the poller
//! re-reads entitlements a few times before giving up and offering a manual
//! refresh. It never reports a failure: the purchase is most likely fine.
//!
//! A return is detected from a one-time flag written before the redirect
//! ([`PENDING_CHECKOUT_KEY`]) and from the processor's correlation token in
//! the return URL ([`CHECKOUT_SESSION_PARAM`]). Both are consumed on
//! detection so a page refresh does not re-trigger the poll.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use dietshop_core::{CheckoutSessionId, EntitlementSummary, ProductId};

use crate::error::{ClientError, StorageError};
use crate::storage::LocalStorage;

/// Storage key of the one-time "just checked out" flag.
pub const PENDING_CHECKOUT_KEY: &str = "dietshop.pending_checkout";

/// Query parameter carrying the processor's checkout session id.
pub const CHECKOUT_SESSION_PARAM: &str = "checkout_session_id";

/// Where the current user's entitlements are read from.
#[async_trait]
pub trait EntitlementSource: Send + Sync {
    async fn entitlements(&self) -> Result<EntitlementSummary, ClientError>;
}

/// The page's address bar.
pub trait PageLocation: Send + Sync {
    /// Current URL.
    fn current(&self) -> Url;

    /// Replace the visible URL in place, without navigating.
    fn replace(&self, url: Url);
}

/// In-memory [`PageLocation`].
#[derive(Debug)]
pub struct MemoryLocation {
    url: Mutex<Url>,
    replacements: Mutex<usize>,
}

impl MemoryLocation {
    #[must_use]
    pub const fn new(url: Url) -> Self {
        Self {
            url: Mutex::new(url),
            replacements: Mutex::new(0),
        }
    }

    /// How many times the URL was replaced in place.
    #[must_use]
    pub fn replacements(&self) -> usize {
        self.replacements.lock().map_or(0, |count| *count)
    }
}

impl PageLocation for MemoryLocation {
    fn current(&self) -> Url {
        match self.url.lock() {
            Ok(url) => url.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn replace(&self, url: Url) {
        if let Ok(mut current) = self.url.lock() {
            *current = url;
        }
        if let Ok(mut count) = self.replacements.lock() {
            *count += 1;
        }
    }
}

/// Read budget after a redirect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Total reads, including the first.
    pub attempts: u32,
    /// Pause between reads.
    pub delay: Duration,
    /// Ceiling for the pause after repeated failed reads, which doubles it.
    pub max_delay: Duration,
    /// Upper bound on a single read.
    pub read_timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(8),
            read_timeout: Duration::from_secs(5),
        }
    }
}

/// The flag written just before leaving for the processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct PendingCheckout {
    product_id: ProductId,
    checkout_session_id: Option<CheckoutSessionId>,
    armed_at: DateTime<Utc>,
}

/// A detected return from checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    /// Product the shopper bought, when the flag survived.
    pub product_id: Option<ProductId>,
    /// Correlation token, from the URL or the flag.
    pub checkout_session_id: Option<CheckoutSessionId>,
}

/// Result of a post-redirect refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The purchased product is owned. Show the success indicator.
    Confirmed(EntitlementSummary),
    /// Entitlements were refreshed; there was no specific product to wait for.
    Refreshed(EntitlementSummary),
    /// The product has not shown up within the budget. Offer a manual
    /// refresh; the confirmation is probably still in flight.
    StillProcessing { last: Option<EntitlementSummary> },
    /// Nobody is signed in, so there is nothing to read.
    SignInRequired,
}

/// Detects a checkout return and refreshes entitlements.
pub struct ReconciliationPoller<S, L> {
    storage: S,
    location: L,
    policy: PollPolicy,
}

impl<S: LocalStorage, L: PageLocation> ReconciliationPoller<S, L> {
    pub const fn new(storage: S, location: L, policy: PollPolicy) -> Self {
        Self {
            storage,
            location,
            policy,
        }
    }

    pub const fn location(&self) -> &L {
        &self.location
    }

    /// Write the one-time flag. Call just before redirecting to the
    /// processor.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the flag cannot be written.
    pub fn arm(
        &self,
        product_id: &ProductId,
        checkout_session_id: Option<&CheckoutSessionId>,
    ) -> Result<(), ClientError> {
        let pending = PendingCheckout {
            product_id: product_id.clone(),
            checkout_session_id: checkout_session_id.cloned(),
            armed_at: Utc::now(),
        };
        let json =
            serde_json::to_string(&pending).map_err(|e| StorageError::Corrupt(e.to_string()))?;
        self.storage.set(PENDING_CHECKOUT_KEY, &json)?;
        Ok(())
    }

    /// Consume the flag and the URL token, if either is present.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the flag cannot be read or cleared.
    pub fn detect(&self) -> Result<Option<Detection>, ClientError> {
        let pending = match self.storage.get(PENDING_CHECKOUT_KEY)? {
            Some(raw) => {
                self.storage.remove(PENDING_CHECKOUT_KEY)?;
                serde_json::from_str::<PendingCheckout>(&raw)
                    .inspect_err(|e| warn!(error = %e, "Ignoring unreadable checkout flag"))
                    .ok()
            }
            None => None,
        };

        let from_url = self.take_url_token();

        if pending.is_none() && from_url.is_none() {
            return Ok(None);
        }

        let (product_id, flagged_session) = pending
            .map(|p| (Some(p.product_id), p.checkout_session_id))
            .unwrap_or_default();

        if let (Some(url_id), Some(flag_id)) = (&from_url, &flagged_session)
            && url_id != flag_id
        {
            warn!(
                url = %url_id,
                flag = %flag_id,
                "Return URL names a different checkout than the one started here"
            );
        }

        Ok(Some(Detection {
            product_id,
            checkout_session_id: from_url.or(flagged_session),
        }))
    }

    /// Re-read entitlements until the detected product shows up or the
    /// budget runs out.
    pub async fn reconcile(
        &self,
        source: &dyn EntitlementSource,
        detection: &Detection,
    ) -> ReconcileOutcome {
        let mut last = None;
        let mut delay = self.policy.delay;

        for attempt in 1..=self.policy.attempts.max(1) {
            if attempt > 1 {
                tokio::time::sleep(delay).await;
            }

            let read = tokio::time::timeout(self.policy.read_timeout, source.entitlements())
                .await
                .unwrap_or(Err(ClientError::Timeout));

            match read {
                Ok(summary) => match &detection.product_id {
                    None => return ReconcileOutcome::Refreshed(summary),
                    Some(product_id) if summary.owns(product_id) => {
                        info!(%product_id, attempt, "Purchase visible after checkout");
                        return ReconcileOutcome::Confirmed(summary);
                    }
                    Some(product_id) => {
                        debug!(%product_id, attempt, "Purchase not visible yet");
                        last = Some(summary);
                        delay = self.policy.delay;
                    }
                },
                Err(ClientError::Unauthorized) => return ReconcileOutcome::SignInRequired,
                Err(e) => {
                    warn!(attempt, error = %e, "Entitlement read failed");
                    delay = delay.saturating_mul(2).min(self.policy.max_delay.max(self.policy.delay));
                }
            }
        }

        ReconcileOutcome::StillProcessing { last }
    }

    /// [`detect`](Self::detect), then [`reconcile`](Self::reconcile) if a
    /// return was detected.
    ///
    /// # Errors
    ///
    /// Returns a storage error from detection. Read failures are folded
    /// into [`ReconcileOutcome::StillProcessing`].
    pub async fn run(
        &self,
        source: &dyn EntitlementSource,
    ) -> Result<Option<ReconcileOutcome>, ClientError> {
        let Some(detection) = self.detect()? else {
            return Ok(None);
        };
        Ok(Some(self.reconcile(source, &detection).await))
    }

    fn take_url_token(&self) -> Option<CheckoutSessionId> {
        let url = self.location.current();
        let token = url
            .query_pairs()
            .find(|(key, _)| key == CHECKOUT_SESSION_PARAM)
            .map(|(_, value)| CheckoutSessionId::new(value.into_owned()))?;

        let remaining: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(key, _)| key != CHECKOUT_SESSION_PARAM)
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        let mut stripped = url.clone();
        if remaining.is_empty() {
            stripped.set_query(None);
        } else {
            stripped.query_pairs_mut().clear().extend_pairs(remaining);
        }
        self.location.replace(stripped);

        Some(token)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::VecDeque;

    use rust_decimal::Decimal;

    use dietshop_core::{Email, UserId};

    use super::*;
    use crate::storage::MemoryStorage;

    fn summary(products: &[&str]) -> EntitlementSummary {
        EntitlementSummary {
            user_id: UserId::new("u2"),
            email: Email::parse("b@x.com").unwrap(),
            purchased_product_ids: products.iter().map(|p| ProductId::new(*p)).collect(),
            total_purchases: products.len() as u64,
            total_spent: Decimal::new(49, 0) * Decimal::from(products.len()),
        }
    }

    /// Replays a scripted sequence of reads, repeating the last one.
    struct Scripted {
        reads: Mutex<VecDeque<Result<EntitlementSummary, ClientError>>>,
        calls: Mutex<u32>,
    }

    impl Scripted {
        fn new(reads: Vec<Result<EntitlementSummary, ClientError>>) -> Self {
            Self {
                reads: Mutex::new(reads.into()),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl EntitlementSource for Scripted {
        async fn entitlements(&self) -> Result<EntitlementSummary, ClientError> {
            *self.calls.lock().unwrap() += 1;
            let mut reads = self.reads.lock().unwrap();
            if reads.len() > 1 {
                reads.pop_front().unwrap()
            } else {
                match reads.front().unwrap() {
                    Ok(summary) => Ok(summary.clone()),
                    Err(_) => Err(ClientError::Timeout),
                }
            }
        }
    }

    fn dashboard(query: &str) -> MemoryLocation {
        MemoryLocation::new(Url::parse(&format!("https://shop.test/dashboard{query}")).unwrap())
    }

    fn poller(location: MemoryLocation) -> ReconciliationPoller<MemoryStorage, MemoryLocation> {
        ReconciliationPoller::new(MemoryStorage::new(), location, PollPolicy::default())
    }

    #[test]
    fn test_nothing_detected_on_plain_load() {
        let poller = poller(dashboard(""));
        assert!(poller.detect().unwrap().is_none());
        assert_eq!(poller.location().replacements(), 0);
    }

    #[test]
    fn test_detect_consumes_flag_and_url_token() {
        let poller = poller(dashboard("?checkout_session_id=cs_1&tab=plans"));
        poller
            .arm(&ProductId::new("course_7"), Some(&CheckoutSessionId::new("cs_1")))
            .unwrap();

        let detection = poller.detect().unwrap().unwrap();
        assert_eq!(detection.product_id, Some(ProductId::new("course_7")));
        assert_eq!(detection.checkout_session_id.unwrap().as_str(), "cs_1");

        assert_eq!(
            poller.location().current().as_str(),
            "https://shop.test/dashboard?tab=plans"
        );
        assert_eq!(poller.location().replacements(), 1);

        // A refresh sees neither marker.
        assert!(poller.detect().unwrap().is_none());
    }

    #[test]
    fn test_url_token_alone_is_detected() {
        let poller = poller(dashboard("?checkout_session_id=cs_9"));

        let detection = poller.detect().unwrap().unwrap();
        assert_eq!(detection.product_id, None);
        assert_eq!(poller.location().current().query(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_late_confirmation() {
        let poller = poller(dashboard(""));
        poller.arm(&ProductId::new("course_7"), None).unwrap();
        let source = Scripted::new(vec![
            Ok(summary(&[])),
            Err(ClientError::Timeout),
            Ok(summary(&["course_7"])),
        ]);

        let outcome = poller.run(&source).await.unwrap().unwrap();

        assert_eq!(outcome, ReconcileOutcome::Confirmed(summary(&["course_7"])));
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhaustion_is_not_an_error() {
        let poller = poller(dashboard(""));
        poller.arm(&ProductId::new("course_7"), None).unwrap();
        let source = Scripted::new(vec![Ok(summary(&[]))]);

        let outcome = poller.run(&source).await.unwrap().unwrap();

        assert_eq!(
            outcome,
            ReconcileOutcome::StillProcessing {
                last: Some(summary(&[]))
            }
        );
        assert_eq!(source.calls(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_reads_back_off_to_ceiling() {
        let policy = PollPolicy {
            attempts: 4,
            delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
            read_timeout: Duration::from_secs(1),
        };
        let poller = ReconciliationPoller::new(MemoryStorage::new(), dashboard(""), policy);
        poller.arm(&ProductId::new("course_7"), None).unwrap();
        let source = Scripted::new(vec![
            Err(ClientError::Timeout),
            Err(ClientError::Timeout),
            Err(ClientError::Timeout),
            Ok(summary(&["course_7"])),
        ]);
        let started = tokio::time::Instant::now();

        let outcome = poller.run(&source).await.unwrap().unwrap();

        // 200ms, then 300ms twice once capped
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(800), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(900), "{elapsed:?}");
        assert_eq!(outcome, ReconcileOutcome::Confirmed(summary(&["course_7"])));
        assert_eq!(source.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_signed_out_stops_immediately() {
        let poller = poller(dashboard(""));
        poller.arm(&ProductId::new("course_7"), None).unwrap();
        let source = Scripted::new(vec![Err(ClientError::Unauthorized), Ok(summary(&[]))]);

        let outcome = poller.run(&source).await.unwrap().unwrap();

        assert_eq!(outcome, ReconcileOutcome::SignInRequired);
        assert_eq!(source.calls(), 1);
    }
}
