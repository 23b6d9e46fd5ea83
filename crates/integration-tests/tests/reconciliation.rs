//! Integration tests for the reconciliation queue.
//!
//! A paid purchase whose grant cannot be written is never dropped: it is
//! queued and replayed later, by the background worker or by hand.

#![allow(clippy::unwrap_used)]

use std::time::Duration;

use rust_decimal::Decimal;

use dietshop_core::{CheckoutStatus, GrantOutcome, ProductId, UserId};
use dietshop_integration_tests::{TestContext, course_7, diet_42, email};
use dietshop_storefront::db::{AccountStore, CheckoutStore, EntitlementStore};
use dietshop_storefront::models::{EntitlementOwner, ReconciliationTask};
use dietshop_storefront::services::confirmation::ConfirmationError;
use dietshop_storefront::worker::run_reconcile_worker;

#[tokio::test]
async fn test_failed_grant_is_queued_then_replayed() {
    let ctx = TestContext::new();
    let user = UserId::new("u2");
    let redirect = ctx
        .customer_checkout(&course_7(), &user, "b@x.com")
        .await
        .unwrap();
    ctx.store.fail_next_grants(2);

    let err = ctx
        .deliver(&ctx.paid_event(&redirect.checkout_session_id))
        .await
        .unwrap_err();

    match err {
        ConfirmationError::GrantFailed { task_id, .. } => assert!(task_id.is_some()),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(ctx.store.get_customer(&user).await.unwrap().is_none());

    let tasks = ctx.state.reconciliation().open_tasks(10).await.unwrap();
    assert_eq!(tasks.len(), 1);
    match &tasks.first().unwrap().task {
        ReconciliationTask::Grant { owner, grant } => {
            assert_eq!(owner, &EntitlementOwner::Customer(user.clone()));
            assert_eq!(grant.product_id, ProductId::new("course_7"));
            assert_eq!(grant.price, Decimal::new(49, 0));
        }
        other => panic!("unexpected task: {other:?}"),
    }

    let summary = ctx.state.reconciliation().replay_open(10).await.unwrap();
    assert_eq!(summary.resolved, 1);
    assert_eq!(summary.failed, 0);

    let owned = ctx.store.get_customer(&user).await.unwrap().unwrap().summary();
    assert!(owned.owns(&ProductId::new("course_7")));
    let record = ctx
        .store
        .get_checkout(&redirect.checkout_session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, CheckoutStatus::Granted);
}

#[tokio::test]
async fn test_replay_and_redelivery_grant_once() {
    let ctx = TestContext::new();
    let user = UserId::new("u2");
    let redirect = ctx
        .customer_checkout(&course_7(), &user, "b@x.com")
        .await
        .unwrap();
    ctx.store.fail_next_grants(2);
    ctx.deliver(&ctx.paid_event(&redirect.checkout_session_id))
        .await
        .unwrap_err();

    // The processor redelivers before the queue is drained
    ctx.deliver(&ctx.paid_event(&redirect.checkout_session_id))
        .await
        .unwrap();
    ctx.state.reconciliation().replay_open(10).await.unwrap();

    let owned = ctx.store.get_customer(&user).await.unwrap().unwrap().summary();
    assert_eq!(owned.total_purchases, 1);
    assert_eq!(owned.total_spent, Decimal::new(49, 0));
}

#[tokio::test]
async fn test_queued_guest_grant_follows_later_link() {
    let ctx = TestContext::new();
    let redirect = ctx.guest_checkout(&diet_42(), "a@x.com").await.unwrap();
    ctx.store.fail_next_grants(2);
    ctx.deliver(&ctx.paid_event(&redirect.checkout_session_id))
        .await
        .unwrap_err();

    let onboarding = ctx
        .state
        .linking()
        .register(ctx.state.auth(), "a@x.com", "correct-horse-battery")
        .await
        .unwrap();
    ctx.state.reconciliation().replay_open(10).await.unwrap();

    let owned = ctx
        .store
        .get_customer(&onboarding.identity.user_id)
        .await
        .unwrap()
        .unwrap()
        .summary();
    assert!(owned.owns(&ProductId::new("diet_42")));
    assert!(
        ctx.store
            .pending_for_email(&email("a@x.com"))
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_still_failing_task_stays_open() {
    let ctx = TestContext::new();
    let redirect = ctx
        .customer_checkout(&course_7(), &UserId::new("u2"), "b@x.com")
        .await
        .unwrap();
    ctx.store.fail_next_grants(3);
    ctx.deliver(&ctx.paid_event(&redirect.checkout_session_id))
        .await
        .unwrap_err();

    let summary = ctx.state.reconciliation().replay_open(10).await.unwrap();

    assert_eq!(summary.failed, 1);
    let tasks = ctx.state.reconciliation().open_tasks(10).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks.first().unwrap().attempts, 2);
}

#[tokio::test]
async fn test_worker_drains_queue() {
    let ctx = TestContext::new();
    let user = UserId::new("u2");
    let redirect = ctx
        .customer_checkout(&course_7(), &user, "b@x.com")
        .await
        .unwrap();
    ctx.store.fail_next_grants(2);
    ctx.deliver(&ctx.paid_event(&redirect.checkout_session_id))
        .await
        .unwrap_err();

    let worker = tokio::spawn(run_reconcile_worker(
        ctx.state.clone(),
        Duration::from_millis(10),
    ));
    let mut drained = false;
    for _ in 0..100 {
        if ctx.state.reconciliation().open_tasks(10).await.unwrap().is_empty() {
            drained = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    worker.abort();

    assert!(drained);
    assert!(
        ctx.store
            .get_customer(&user)
            .await
            .unwrap()
            .unwrap()
            .entitlements
            .contains(&ProductId::new("course_7"))
    );
}

#[tokio::test]
async fn test_manual_grant_is_idempotent() {
    let ctx = TestContext::new();
    let user = UserId::new("u1");
    let buyer = email("a@x.com");
    let product = ProductId::new("diet_42");

    let first = ctx
        .state
        .reconciliation()
        .manual_grant(&user, &buyer, &product, Decimal::new(99, 0))
        .await
        .unwrap();
    let second = ctx
        .state
        .reconciliation()
        .manual_grant(&user, &buyer, &product, Decimal::new(99, 0))
        .await
        .unwrap();

    assert_eq!(first, GrantOutcome::Granted);
    assert_eq!(second, GrantOutcome::AlreadyOwned);
    let owned = ctx.store.get_customer(&user).await.unwrap().unwrap().summary();
    assert_eq!(owned.total_purchases, 1);
}
