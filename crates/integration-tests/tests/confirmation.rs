//! Integration tests for checkout initiation and payment confirmation.
//!
//! Run over the in-memory store; see the crate docs.

#![allow(clippy::unwrap_used)]

use rust_decimal::Decimal;

use dietshop_core::{
    CheckoutMetadata, CheckoutRequest, CheckoutStatus, GrantOutcome, ProductId, UserId,
};
use dietshop_integration_tests::{COMPLETED, TestContext, course_7, diet_42, email};
use dietshop_storefront::db::{AccountStore, CheckoutStore, EntitlementStore};
use dietshop_storefront::models::EntitlementOwner;
use dietshop_storefront::services::checkout::CheckoutError;
use dietshop_storefront::services::confirmation::{ConfirmationError, ConfirmationOutcome};

// =============================================================================
// Checkout Initiation
// =============================================================================

#[tokio::test]
async fn test_checkout_records_catalog_price() {
    let ctx = TestContext::new();

    let redirect = ctx.guest_checkout(&diet_42(), "a@x.com").await.unwrap();

    let record = ctx
        .store
        .get_checkout(&redirect.checkout_session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, CheckoutStatus::PendingConfirmation);
    assert_eq!(record.price, Decimal::new(99, 0));
    assert_eq!(record.buyer_email, email("a@x.com"));

    let params = ctx.processor.params(&redirect.checkout_session_id).unwrap();
    assert_eq!(params.metadata.product_price, Decimal::new(99, 0));
    assert!(redirect.redirect_url.contains(redirect.checkout_session_id.as_str()));
}

#[tokio::test]
async fn test_price_mismatch_never_reaches_processor() {
    let ctx = TestContext::new();

    let result = ctx
        .state
        .checkout()
        .initiate(&CheckoutRequest {
            product_id: ProductId::new("diet_42"),
            product_price: Some(Decimal::new(1, 0)),
            buyer_email: email("a@x.com"),
            buyer_user_id: None,
        })
        .await;

    assert!(matches!(result, Err(CheckoutError::PriceMismatch { .. })));
    assert_eq!(ctx.processor.opened(), 0);
}

#[tokio::test]
async fn test_unknown_product_is_rejected() {
    let ctx = TestContext::new();

    let result = ctx
        .state
        .checkout()
        .initiate(&CheckoutRequest {
            product_id: ProductId::new("diet_404"),
            product_price: None,
            buyer_email: email("a@x.com"),
            buyer_user_id: None,
        })
        .await;

    assert!(matches!(result, Err(CheckoutError::ProductNotFound(_))));
    assert_eq!(ctx.processor.opened(), 0);
}

#[tokio::test]
async fn test_processor_outage_is_retryable() {
    let ctx = TestContext::new();
    ctx.processor.set_unavailable(true);

    let result = ctx.guest_checkout(&diet_42(), "a@x.com").await;
    assert!(matches!(result, Err(CheckoutError::ProcessorUnavailable(_))));

    ctx.processor.set_unavailable(false);
    let redirect = ctx.guest_checkout(&diet_42(), "a@x.com").await.unwrap();
    assert_eq!(redirect.checkout_session_id.as_str(), "cs_test_1");
}

// =============================================================================
// No Grant Before Payment
// =============================================================================

#[tokio::test]
async fn test_started_checkout_grants_nothing() {
    let ctx = TestContext::new();
    let user = UserId::new("u2");

    ctx.customer_checkout(&course_7(), &user, "b@x.com")
        .await
        .unwrap();
    ctx.guest_checkout(&diet_42(), "a@x.com").await.unwrap();

    assert!(ctx.store.get_customer(&user).await.unwrap().is_none());
    assert!(
        ctx.store
            .pending_for_email(&email("a@x.com"))
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_expired_checkout_grants_nothing() {
    let ctx = TestContext::new();
    let redirect = ctx.guest_checkout(&diet_42(), "a@x.com").await.unwrap();
    let params = ctx.processor.params(&redirect.checkout_session_id).unwrap();

    let expired = ctx.event(
        "checkout.session.expired",
        &redirect.checkout_session_id,
        &params.metadata,
        None,
    );
    let outcome = ctx.deliver(&expired).await.unwrap();

    assert!(matches!(outcome, ConfirmationOutcome::Rejected { .. }));
    let record = ctx
        .store
        .get_checkout(&redirect.checkout_session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, CheckoutStatus::Rejected);
    assert!(
        ctx.store
            .pending_for_email(&email("a@x.com"))
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_bad_signature_changes_nothing() {
    let ctx = TestContext::new();
    let redirect = ctx.guest_checkout(&diet_42(), "a@x.com").await.unwrap();
    let payload = ctx.paid_event(&redirect.checkout_session_id);

    let forged = ctx
        .state
        .confirmation()
        .handle(&payload, Some("t=1700000000,v1=deadbeef"))
        .await;
    let unsigned = ctx.state.confirmation().handle(&payload, None).await;

    assert!(matches!(forged, Err(ConfirmationError::InvalidSignature(_))));
    assert!(matches!(unsigned, Err(ConfirmationError::InvalidSignature(_))));
    let record = ctx
        .store
        .get_checkout(&redirect.checkout_session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, CheckoutStatus::PendingConfirmation);
    assert!(
        ctx.store
            .pending_for_email(&email("a@x.com"))
            .await
            .unwrap()
            .is_empty()
    );
}

// =============================================================================
// Idempotency
// =============================================================================

#[tokio::test]
async fn test_redelivered_confirmation_grants_once() {
    let ctx = TestContext::new();
    let user = UserId::new("u2");
    let redirect = ctx
        .customer_checkout(&course_7(), &user, "b@x.com")
        .await
        .unwrap();

    let first = ctx
        .deliver(&ctx.paid_event(&redirect.checkout_session_id))
        .await
        .unwrap();
    let second = ctx
        .deliver(&ctx.paid_event(&redirect.checkout_session_id))
        .await
        .unwrap();

    assert_eq!(
        first,
        ConfirmationOutcome::Granted {
            owner: EntitlementOwner::Customer(user.clone()),
            product_id: ProductId::new("course_7"),
            outcome: GrantOutcome::Granted,
        }
    );
    assert_eq!(
        second,
        ConfirmationOutcome::AlreadyResolved(CheckoutStatus::Granted)
    );

    let summary = ctx.store.get_customer(&user).await.unwrap().unwrap().summary();
    assert_eq!(summary.purchased_product_ids, vec![ProductId::new("course_7")]);
    assert_eq!(summary.total_purchases, 1);
    assert_eq!(summary.total_spent, Decimal::new(49, 0));
}

#[tokio::test]
async fn test_concurrent_confirmations_grant_once() {
    let ctx = TestContext::new();
    let user = UserId::new("u2");
    let redirect = ctx
        .customer_checkout(&course_7(), &user, "b@x.com")
        .await
        .unwrap();
    let a = ctx.paid_event(&redirect.checkout_session_id);
    let b = ctx.paid_event(&redirect.checkout_session_id);

    let (first, second) = tokio::join!(ctx.deliver(&a), ctx.deliver(&b));
    first.unwrap();
    second.unwrap();

    let summary = ctx.store.get_customer(&user).await.unwrap().unwrap().summary();
    assert_eq!(summary.total_purchases, 1);
    assert_eq!(summary.total_spent, Decimal::new(49, 0));
}

// =============================================================================
// Price Integrity
// =============================================================================

#[tokio::test]
async fn test_grant_uses_recorded_price_over_callback_metadata() {
    let ctx = TestContext::new();
    let user = UserId::new("u1");
    let redirect = ctx
        .customer_checkout(&diet_42(), &user, "a@x.com")
        .await
        .unwrap();

    let tampered = CheckoutMetadata {
        product_price: Decimal::new(1, 0),
        ..ctx.processor.params(&redirect.checkout_session_id).unwrap().metadata
    };
    let payload = ctx.event(COMPLETED, &redirect.checkout_session_id, &tampered, Some(100));
    ctx.deliver(&payload).await.unwrap();

    let summary = ctx.store.get_customer(&user).await.unwrap().unwrap().summary();
    assert_eq!(summary.total_spent, Decimal::new(99, 0));
}

#[tokio::test]
async fn test_missing_record_falls_back_to_signed_metadata() {
    let ctx = TestContext::new();
    let id = dietshop_core::CheckoutSessionId::new("cs_untracked");
    let metadata = CheckoutMetadata {
        product_id: ProductId::new("course_7"),
        product_price: Decimal::new(49, 0),
        buyer_user_id: None,
        buyer_email: email("c@x.com"),
    };

    let outcome = ctx
        .deliver(&ctx.event(COMPLETED, &id, &metadata, Some(4900)))
        .await
        .unwrap();

    assert!(matches!(
        outcome,
        ConfirmationOutcome::Granted {
            owner: EntitlementOwner::Guest(_),
            ..
        }
    ));
    let pending = ctx.store.pending_for_email(&email("c@x.com")).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending.first().unwrap().price, Decimal::new(49, 0));
}
