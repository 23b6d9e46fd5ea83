//! Confirmation callback payload.

use std::collections::BTreeMap;

use serde::Deserialize;

use dietshop_core::CheckoutSessionId;

/// A processor event as delivered to the webhook endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub created: i64,
    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub object: SessionObject,
}

/// The checkout session the event is about.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionObject {
    pub id: CheckoutSessionId,
    #[serde(default)]
    pub payment_status: Option<String>,
    /// Amount charged in minor units, as reported by the processor.
    #[serde(default)]
    pub amount_total: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    /// Metadata echoed from checkout initiation.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// What the confirmation handler should do with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    /// Payment succeeded: grant the product.
    Grant,
    /// Payment failed or the session expired: close the checkout.
    Reject,
    /// Not relevant (or payment still in flight).
    Ignore,
}

impl PaymentEvent {
    /// Parse a raw callback body.
    ///
    /// # Errors
    ///
    /// Returns the JSON error if the body is not a processor event.
    pub fn from_slice(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    /// The session this event concerns.
    #[must_use]
    pub const fn session(&self) -> &SessionObject {
        &self.data.object
    }

    /// Classify the event.
    ///
    /// A completed session with delayed payment methods reports
    /// `payment_status = "unpaid"`; the grant waits for
    /// `checkout.session.async_payment_succeeded`.
    #[must_use]
    pub fn action(&self) -> EventAction {
        match self.event_type.as_str() {
            "checkout.session.completed" => {
                match self.session().payment_status.as_deref() {
                    Some("paid" | "no_payment_required") => EventAction::Grant,
                    _ => EventAction::Ignore,
                }
            }
            "checkout.session.async_payment_succeeded" => EventAction::Grant,
            "checkout.session.async_payment_failed" | "checkout.session.expired" => {
                EventAction::Reject
            }
            _ => EventAction::Ignore,
        }
    }
}
