//! End-to-end purchase flow over HTTP.
//!
//! Each test starts the full storefront router on an ephemeral port and
//! drives it the way a browser would: one cookie jar, one local storage,
//! one address bar.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use url::Url;

use dietshop_client::poller::PENDING_CHECKOUT_KEY;
use dietshop_client::{
    ClientError, GuestSessionManager, Handoff, LocalStorage, MemoryLocation, MemoryStorage, PageLocation,
    PollPolicy, ReconcileOutcome, ReconciliationPoller,
};
use dietshop_core::{ProductId, PurchaseStatus, StartCheckout, TransferState};
use dietshop_integration_tests::{TestContext, course_7, diet_42, email};
use dietshop_storefront::db::EntitlementStore;

const PASSWORD: &str = "correct-horse-battery";

fn poll_policy() -> PollPolicy {
    PollPolicy {
        attempts: 3,
        delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(80),
        read_timeout: Duration::from_secs(2),
    }
}

fn guest_start(product: &dietshop_core::Product, buyer: &str) -> StartCheckout {
    StartCheckout {
        product_id: product.id.clone(),
        expected_price: Some(product.price.amount),
        guest_email: Some(email(buyer)),
    }
}

// =============================================================================
// Health
// =============================================================================

#[tokio::test]
async fn test_health_endpoints() {
    let ctx = TestContext::new();
    let base = ctx.serve().await;

    for path in ["health", "health/ready"] {
        let response = reqwest::get(base.join(path).unwrap()).await.unwrap();
        assert_eq!(response.status().as_u16(), 200, "{path}");
    }
}

// =============================================================================
// Guest Purchase
// =============================================================================

#[tokio::test]
async fn test_guest_purchase_then_sign_up() {
    let ctx = TestContext::new();
    let base = ctx.serve().await;
    let browser = TestContext::browser(&base);
    let storage = Arc::new(MemoryStorage::new());
    let sessions = GuestSessionManager::new(Arc::clone(&storage));

    // Guest starts checkout for diet_42
    sessions.create(&diet_42(), Some(email("a@x.com"))).unwrap();
    let redirect = browser
        .start_checkout(&guest_start(&diet_42(), "a@x.com"))
        .await
        .unwrap();
    sessions
        .attach_checkout(redirect.checkout_session_id.clone())
        .unwrap();
    let live = sessions.mark_redirected().unwrap();
    assert_eq!(live.status(), PurchaseStatus::Redirected);

    let return_url = Url::parse(&format!(
        "http://shop.test/account?tab=plans&checkout_session_id={}",
        redirect.checkout_session_id
    ))
    .unwrap();
    let poller = ReconciliationPoller::new(
        Arc::clone(&storage),
        MemoryLocation::new(return_url),
        poll_policy(),
    );
    poller
        .arm(&ProductId::new("diet_42"), Some(&redirect.checkout_session_id))
        .unwrap();

    // Processor confirms payment
    let status = ctx
        .post_callback(&base, ctx.paid_event(&redirect.checkout_session_id), true)
        .await;
    assert_eq!(status, 200);

    // Shopper comes back and creates an account
    let account = browser.register("a@x.com", PASSWORD).await.unwrap();
    assert_eq!(
        account.transfer,
        TransferState::Completed {
            transferred: vec![ProductId::new("diet_42")],
            already_owned: vec![],
        }
    );

    // The client hand-off finds nothing left to move and forgets the session
    let handed = sessions
        .transfer_purchases_to_user(&browser, &account.user_id)
        .await
        .unwrap();
    assert!(matches!(
        handed,
        Some(Handoff::Transferred(TransferState::Completed { .. }))
    ));
    assert!(sessions.get().unwrap().is_none());

    let outcome = poller.run(&browser).await.unwrap();
    match outcome {
        Some(ReconcileOutcome::Confirmed(summary)) => {
            assert!(summary.owns(&ProductId::new("diet_42")));
            assert_eq!(summary.total_purchases, 1);
            assert_eq!(summary.total_spent, Decimal::new(99, 0));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(
        poller.location().current().as_str(),
        "http://shop.test/account?tab=plans"
    );
    assert!(storage.get(PENDING_CHECKOUT_KEY).unwrap().is_none());

    // A reload does nothing
    assert!(poller.run(&browser).await.unwrap().is_none());
}

#[tokio::test]
async fn test_guest_checkout_requires_email() {
    let ctx = TestContext::new();
    let base = ctx.serve().await;
    let browser = TestContext::browser(&base);

    let err = browser
        .start_checkout(&StartCheckout {
            product_id: ProductId::new("diet_42"),
            expected_price: None,
            guest_email: None,
        })
        .await
        .unwrap_err();

    assert!(matches!(err, ClientError::Status { status: 400, .. }));
    assert_eq!(ctx.processor.opened(), 0);
}

#[tokio::test]
async fn test_sign_up_under_another_email_ends_hand_off() {
    let ctx = TestContext::new();
    let base = ctx.serve().await;
    let browser = TestContext::browser(&base);
    let sessions = GuestSessionManager::new(MemoryStorage::new());

    sessions.create(&diet_42(), Some(email("a@x.com"))).unwrap();
    let redirect = browser
        .start_checkout(&guest_start(&diet_42(), "a@x.com"))
        .await
        .unwrap();
    let status = ctx
        .post_callback(&base, ctx.paid_event(&redirect.checkout_session_id), true)
        .await;
    assert_eq!(status, 200);

    let account = browser.register("other@x.com", PASSWORD).await.unwrap();
    let handed = sessions
        .transfer_purchases_to_user(&browser, &account.user_id)
        .await
        .unwrap();

    assert_eq!(
        handed,
        Some(Handoff::EmailMismatch {
            guest_email: Some(email("a@x.com"))
        })
    );
    assert!(sessions.get().unwrap().is_none());
    // The purchase waits for an account under the guest email
    assert_eq!(
        ctx.store
            .pending_for_email(&email("a@x.com"))
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn test_checkout_price_mismatch_is_rejected() {
    let ctx = TestContext::new();
    let base = ctx.serve().await;
    let browser = TestContext::browser(&base);

    let err = browser
        .start_checkout(&StartCheckout {
            expected_price: Some(Decimal::new(1, 0)),
            ..guest_start(&diet_42(), "a@x.com")
        })
        .await
        .unwrap_err();

    assert!(matches!(err, ClientError::Status { status: 400, .. }));
    assert_eq!(ctx.processor.opened(), 0);
}

#[tokio::test]
async fn test_unknown_product_is_not_found() {
    let ctx = TestContext::new();
    let base = ctx.serve().await;
    let browser = TestContext::browser(&base);

    let err = browser
        .start_checkout(&StartCheckout {
            product_id: ProductId::new("diet_404"),
            expected_price: None,
            guest_email: Some(email("a@x.com")),
        })
        .await
        .unwrap_err();

    assert!(matches!(err, ClientError::Status { status: 404, .. }));
}

#[tokio::test]
async fn test_processor_outage_is_service_unavailable() {
    let ctx = TestContext::new();
    let base = ctx.serve().await;
    let browser = TestContext::browser(&base);
    ctx.processor.set_unavailable(true);

    let err = browser
        .start_checkout(&guest_start(&diet_42(), "a@x.com"))
        .await
        .unwrap_err();

    assert!(matches!(err, ClientError::Status { status: 503, .. }));
    assert!(err.is_transient());
}

// =============================================================================
// Signed-In Purchase
// =============================================================================

#[tokio::test]
async fn test_signed_in_purchase_survives_redelivery() {
    let ctx = TestContext::new();
    let base = ctx.serve().await;
    let browser = TestContext::browser(&base);
    let account = browser.register("b@x.com", PASSWORD).await.unwrap();

    // guest_email is ignored for a signed-in shopper
    let redirect = browser
        .start_checkout(&guest_start(&course_7(), "someone-else@x.com"))
        .await
        .unwrap();
    let params = ctx.processor.params(&redirect.checkout_session_id).unwrap();
    assert_eq!(params.metadata.buyer_user_id, Some(account.user_id.clone()));
    assert_eq!(params.metadata.buyer_email, email("b@x.com"));

    for _ in 0..2 {
        let status = ctx
            .post_callback(&base, ctx.paid_event(&redirect.checkout_session_id), true)
            .await;
        assert_eq!(status, 200);
    }

    let summary = browser.entitlements().await.unwrap();
    assert_eq!(summary.purchased_product_ids, vec![ProductId::new("course_7")]);
    assert_eq!(summary.total_purchases, 1);
    assert_eq!(summary.total_spent, Decimal::new(49, 0));
}

#[tokio::test]
async fn test_poller_reports_still_processing_before_callback() {
    let ctx = TestContext::new();
    let base = ctx.serve().await;
    let browser = TestContext::browser(&base);
    browser.register("b@x.com", PASSWORD).await.unwrap();

    let redirect = browser
        .start_checkout(&guest_start(&course_7(), "b@x.com"))
        .await
        .unwrap();
    let poller = ReconciliationPoller::new(
        MemoryStorage::new(),
        MemoryLocation::new(Url::parse("http://shop.test/account").unwrap()),
        poll_policy(),
    );
    poller
        .arm(&ProductId::new("course_7"), Some(&redirect.checkout_session_id))
        .unwrap();

    let outcome = poller.run(&browser).await.unwrap();

    match outcome {
        Some(ReconcileOutcome::StillProcessing { last: Some(summary) }) => {
            assert!(!summary.owns(&ProductId::new("course_7")));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

// =============================================================================
// Callback Authentication
// =============================================================================

#[tokio::test]
async fn test_unsigned_callback_is_rejected() {
    let ctx = TestContext::new();
    let base = ctx.serve().await;
    let redirect = ctx.guest_checkout(&diet_42(), "a@x.com").await.unwrap();

    let status = ctx
        .post_callback(&base, ctx.paid_event(&redirect.checkout_session_id), false)
        .await;

    assert_eq!(status, 400);
    assert!(
        ctx.store
            .pending_for_email(&email("a@x.com"))
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_unpersisted_grant_asks_for_redelivery() {
    let ctx = TestContext::new();
    let base = ctx.serve().await;
    let redirect = ctx.guest_checkout(&diet_42(), "a@x.com").await.unwrap();
    ctx.store.fail_next_grants(2);

    let status = ctx
        .post_callback(&base, ctx.paid_event(&redirect.checkout_session_id), true)
        .await;
    assert_eq!(status, 500);

    let status = ctx
        .post_callback(&base, ctx.paid_event(&redirect.checkout_session_id), true)
        .await;
    assert_eq!(status, 200);
    assert_eq!(
        ctx.store
            .pending_for_email(&email("a@x.com"))
            .await
            .unwrap()
            .len(),
        1
    );
}

// =============================================================================
// Account Routes
// =============================================================================

#[tokio::test]
async fn test_entitlements_require_sign_in() {
    let ctx = TestContext::new();
    let base = ctx.serve().await;
    let browser = TestContext::browser(&base);

    assert!(matches!(
        browser.entitlements().await,
        Err(ClientError::Unauthorized)
    ));

    browser.register("a@x.com", PASSWORD).await.unwrap();
    let summary = browser.entitlements().await.unwrap();
    assert!(summary.purchased_product_ids.is_empty());

    browser.logout().await.unwrap();
    assert!(matches!(
        browser.entitlements().await,
        Err(ClientError::Unauthorized)
    ));
}

#[tokio::test]
async fn test_login_rejects_bad_password() {
    let ctx = TestContext::new();
    let base = ctx.serve().await;
    let browser = TestContext::browser(&base);
    browser.register("a@x.com", PASSWORD).await.unwrap();
    browser.logout().await.unwrap();

    assert!(matches!(
        browser.login("a@x.com", "wrong-password").await,
        Err(ClientError::Unauthorized)
    ));
    assert!(browser.login("a@x.com", PASSWORD).await.is_ok());
}

#[tokio::test]
async fn test_transfer_for_another_email_is_forbidden() {
    let ctx = TestContext::new();
    let base = ctx.serve().await;
    let browser = TestContext::browser(&base);
    browser.register("a@x.com", PASSWORD).await.unwrap();

    let err = browser
        .transfer_guest_purchase(Some(email("victim@x.com")))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Status { status: 403, .. }));

    let own = browser
        .transfer_guest_purchase(Some(email("a@x.com")))
        .await
        .unwrap();
    assert!(matches!(own.transfer, TransferState::Completed { .. }));
}

#[tokio::test]
async fn test_queued_transfer_is_accepted() {
    let ctx = TestContext::new();
    let base = ctx.serve().await;
    let browser = TestContext::browser(&base);
    browser.register("a@x.com", PASSWORD).await.unwrap();
    ctx.store.fail_next_merges(2);

    let response = browser.transfer_guest_purchase(None).await.unwrap();

    assert!(matches!(response.transfer, TransferState::Queued { .. }));
    assert_eq!(
        ctx.state.reconciliation().open_tasks(10).await.unwrap().len(),
        1
    );
}
