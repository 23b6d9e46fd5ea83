//! Entitlement set and its add-if-absent reducer.
//!
//! Every mutation of a user's owned products goes through
//! [`Entitlements::grant`]: a set union that only bumps the derived counters
//! when the product was not already present. Applying the same grant any
//! number of times, or applying grants in any order, ends in the same state.

use std::collections::BTreeSet;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::email::Email;
use super::id::{ProductId, UserId};

/// Result of an add-if-absent grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantOutcome {
    /// The product was added and counters were bumped.
    Granted,
    /// The product was already owned; nothing changed.
    AlreadyOwned,
}

impl GrantOutcome {
    #[must_use]
    pub const fn is_new(&self) -> bool {
        matches!(self, Self::Granted)
    }
}

/// Products moved by a merge, split by whether they were new to the target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReport {
    /// Products newly granted to the target.
    pub transferred: Vec<ProductId>,
    /// Products the target already owned (the source grant was dropped).
    pub already_owned: Vec<ProductId>,
}

impl MergeReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.transferred.is_empty() && self.already_owned.is_empty()
    }
}

/// A set of owned products plus monotonically non-decreasing counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entitlements {
    purchased_product_ids: BTreeSet<ProductId>,
    total_purchases: u64,
    total_spent: Decimal,
}

impl Entitlements {
    /// Empty entitlement set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from stored parts.
    #[must_use]
    pub const fn from_parts(
        purchased_product_ids: BTreeSet<ProductId>,
        total_purchases: u64,
        total_spent: Decimal,
    ) -> Self {
        Self {
            purchased_product_ids,
            total_purchases,
            total_spent,
        }
    }

    /// Add `product_id` if absent; bump counters only on first grant.
    pub fn grant(&mut self, product_id: &ProductId, price: Decimal) -> GrantOutcome {
        if self.purchased_product_ids.insert(product_id.clone()) {
            self.total_purchases = self.total_purchases.saturating_add(1);
            self.total_spent += price;
            GrantOutcome::Granted
        } else {
            GrantOutcome::AlreadyOwned
        }
    }

    /// Fold a batch of `(product, price)` grants in, reporting what was new.
    pub fn absorb<I>(&mut self, grants: I) -> MergeReport
    where
        I: IntoIterator<Item = (ProductId, Decimal)>,
    {
        let mut report = MergeReport::default();
        for (product_id, price) in grants {
            match self.grant(&product_id, price) {
                GrantOutcome::Granted => report.transferred.push(product_id),
                GrantOutcome::AlreadyOwned => report.already_owned.push(product_id),
            }
        }
        report
    }

    #[must_use]
    pub fn contains(&self, product_id: &ProductId) -> bool {
        self.purchased_product_ids.contains(product_id)
    }

    #[must_use]
    pub const fn product_ids(&self) -> &BTreeSet<ProductId> {
        &self.purchased_product_ids
    }

    #[must_use]
    pub const fn total_purchases(&self) -> u64 {
        self.total_purchases
    }

    #[must_use]
    pub const fn total_spent(&self) -> Decimal {
        self.total_spent
    }
}

/// Wire view of a user's entitlements, as read by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitlementSummary {
    pub user_id: UserId,
    pub email: Email,
    pub purchased_product_ids: Vec<ProductId>,
    pub total_purchases: u64,
    pub total_spent: Decimal,
}

impl EntitlementSummary {
    /// Build a summary for `user_id` from its entitlement set.
    #[must_use]
    pub fn new(user_id: UserId, email: Email, entitlements: &Entitlements) -> Self {
        Self {
            user_id,
            email,
            purchased_product_ids: entitlements.product_ids().iter().cloned().collect(),
            total_purchases: entitlements.total_purchases(),
            total_spent: entitlements.total_spent(),
        }
    }

    #[must_use]
    pub fn owns(&self, product_id: &ProductId) -> bool {
        self.purchased_product_ids.contains(product_id)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn diet() -> ProductId {
        ProductId::new("diet_42")
    }

    #[test]
    fn test_repeated_grant_counts_once() {
        let mut entitlements = Entitlements::new();
        assert_eq!(
            entitlements.grant(&diet(), Decimal::new(99, 0)),
            GrantOutcome::Granted
        );
        for _ in 0..5 {
            assert_eq!(
                entitlements.grant(&diet(), Decimal::new(99, 0)),
                GrantOutcome::AlreadyOwned
            );
        }

        assert_eq!(entitlements.product_ids().len(), 1);
        assert_eq!(entitlements.total_purchases(), 1);
        assert_eq!(entitlements.total_spent(), Decimal::new(99, 0));
    }

    #[test]
    fn test_grant_order_does_not_matter() {
        let course = ProductId::new("course_7");

        let mut a = Entitlements::new();
        a.grant(&diet(), Decimal::new(99, 0));
        a.grant(&course, Decimal::new(49, 0));

        let mut b = Entitlements::new();
        b.grant(&course, Decimal::new(49, 0));
        b.grant(&diet(), Decimal::new(99, 0));
        b.grant(&course, Decimal::new(49, 0));

        assert_eq!(a, b);
    }

    #[test]
    fn test_absorb_reports_overlap() {
        let mut entitlements = Entitlements::new();
        entitlements.grant(&diet(), Decimal::new(99, 0));

        let report = entitlements.absorb([
            (diet(), Decimal::new(99, 0)),
            (ProductId::new("course_7"), Decimal::new(49, 0)),
        ]);

        assert_eq!(report.transferred, vec![ProductId::new("course_7")]);
        assert_eq!(report.already_owned, vec![diet()]);
        assert_eq!(entitlements.total_purchases(), 2);
        assert_eq!(entitlements.total_spent(), Decimal::new(148, 0));
    }

    #[test]
    fn test_summary_lists_products() {
        let mut entitlements = Entitlements::new();
        entitlements.grant(&diet(), Decimal::new(99, 0));

        let summary = EntitlementSummary::new(
            UserId::new("u1"),
            Email::parse("a@x.com").unwrap(),
            &entitlements,
        );
        assert!(summary.owns(&diet()));
        assert_eq!(summary.total_purchases, 1);
    }
}
