//! Status enums for purchase sessions and checkouts.

use serde::{Deserialize, Serialize};

/// Lifecycle of a client-held guest [`PurchaseSession`](crate::PurchaseSession).
///
/// ```text
/// initiated -> redirected -> confirmed
///      \            \
///       +------------+----> abandoned
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseStatus {
    /// Checkout started, shopper not yet sent to the processor.
    #[default]
    Initiated,
    /// Shopper was sent to the payment processor.
    Redirected,
    /// Payment confirmed and entitlement observed.
    Confirmed,
    /// Shopper gave up (explicit skip, expiry, or overwritten by a new checkout).
    Abandoned,
}

impl PurchaseStatus {
    /// Whether no further transitions are allowed.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed | Self::Abandoned)
    }

    /// Whether `self -> next` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Initiated, Self::Redirected | Self::Abandoned)
                | (Self::Redirected, Self::Confirmed | Self::Abandoned)
        )
    }
}

impl std::fmt::Display for PurchaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initiated => write!(f, "initiated"),
            Self::Redirected => write!(f, "redirected"),
            Self::Confirmed => write!(f, "confirmed"),
            Self::Abandoned => write!(f, "abandoned"),
        }
    }
}

/// Server-side state of a checkout awaiting the processor's confirmation.
///
/// `PendingConfirmation` moves to exactly one terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutStatus {
    #[default]
    PendingConfirmation,
    Granted,
    Rejected,
}

impl CheckoutStatus {
    /// Whether no further transitions are allowed.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::PendingConfirmation)
    }

    /// Stable string form used in storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PendingConfirmation => "pending_confirmation",
            Self::Granted => "granted",
            Self::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for CheckoutStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CheckoutStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_confirmation" => Ok(Self::PendingConfirmation),
            "granted" => Ok(Self::Granted),
            "rejected" => Ok(Self::Rejected),
            _ => Err(format!("invalid checkout status: {s}")),
        }
    }
}
