//! Customer document.

use chrono::{DateTime, Utc};
use serde::Serialize;

use dietshop_core::{Email, EntitlementSummary, Entitlements, UserId};

/// A customer account and the products it owns.
///
/// Created on first authentication (or lazily by the first direct grant) and
/// never deleted by this service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Customer {
    pub id: UserId,
    pub email: Email,
    pub entitlements: Entitlements,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Customer {
    /// Wire view for the client.
    #[must_use]
    pub fn summary(&self) -> EntitlementSummary {
        EntitlementSummary::new(self.id.clone(), self.email.clone(), &self.entitlements)
    }
}
