mod common;

use chrono::Duration;
use common::TestApp;
use payment_lifecycle_engine::{
    error::AppError,
    models::{
        audit::AuditSource,
        events::EventKind,
        order::OrderStatus,
        payment::{PaymentFlow, PaymentStatus, StartCashierPaymentRequest, StartPaymentRequest},
    },
    providers::{CanonicalStatus, ProviderError, ProviderErrorCode},
    store::PaymentRepository,
};
use uuid::Uuid;

#[tokio::test]
async fn start_payment_creates_pending_intent_with_expiry() {
    let app = TestApp::new().await;
    let order = app.create_order(1000).await;

    let payment = app.start_payment(&order, "card").await;

    assert_eq!(payment.status, PaymentStatus::Pending);
    assert_eq!(payment.flow, PaymentFlow::Provider);
    assert_eq!(payment.amount, 1000);
    assert_eq!(payment.actor_id, order.actor_id);
    assert_eq!(payment.provider_ref, Some(format!("card_{}", payment.id.simple())));
    assert!(payment.client_secret.is_some());
    assert_eq!(payment.expires_at, Some(common::start_time() + Duration::minutes(15)));
    assert_eq!(app.card.intent_calls(), 1);
    assert_eq!(app.order_status(order.id).await, OrderStatus::PendingPayment);
    assert_eq!(app.count_events_for(EventKind::PaymentIntentCreated, payment.id).await, 1);
}

#[tokio::test]
async fn open_intent_is_returned_instead_of_a_second_payment() {
    let app = TestApp::new().await;
    let order = app.create_order(1000).await;
    let first = app.start_payment(&order, "card").await;

    let (second, created) = app
        .state
        .payments
        .start_payment(
            app.tenant_id,
            StartPaymentRequest {
                order_id: order.id,
                provider: "card".into(),
                actor_id: order.actor_id,
            },
        )
        .await
        .unwrap();

    assert!(!created);
    assert_eq!(second.id, first.id);
    assert_eq!(app.card.intent_calls(), 1);
    assert_eq!(app.store.payments_for_order(order.id).await.len(), 1);
}

#[tokio::test]
async fn expired_intent_is_superseded_by_a_new_payment() {
    let app = TestApp::new().await;
    let order = app.create_order(1000).await;
    let first = app.start_payment(&order, "card").await;

    app.advance(Duration::minutes(16));
    let second = app.start_payment(&order, "card").await;

    assert_ne!(second.id, first.id);
    let payments = app.store.payments_for_order(order.id).await;
    assert_eq!(payments.len(), 2);
    assert_eq!(payments[0].status, PaymentStatus::Failed);
    assert_eq!(payments[1].status, PaymentStatus::Pending);
}

#[tokio::test]
async fn permanent_provider_rejection_leaves_a_failed_payment() {
    let app = TestApp::new().await;
    let order = app.create_order(1000).await;
    app.card
        .fail_next_intent(ProviderError::new(ProviderErrorCode::CardDeclined, "do not honor"));

    let err = app
        .state
        .payments
        .start_payment(
            app.tenant_id,
            StartPaymentRequest {
                order_id: order.id,
                provider: "card".into(),
                actor_id: order.actor_id,
            },
        )
        .await
        .unwrap_err();

    assert_eq!(err.code(), "CARD_DECLINED");
    let payments = app.store.payments_for_order(order.id).await;
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].status, PaymentStatus::Failed);
    assert_eq!(payments[0].failure_code.as_deref(), Some("CARD_DECLINED"));
    assert_eq!(app.order_status(order.id).await, OrderStatus::PaymentFailed);
}

#[tokio::test]
async fn transient_provider_failure_persists_nothing() {
    let app = TestApp::new().await;
    let order = app.create_order(1000).await;
    app.card
        .fail_next_intent(ProviderError::new(ProviderErrorCode::ProviderTimeout, "gateway timeout"));

    let err = app
        .state
        .payments
        .start_payment(
            app.tenant_id,
            StartPaymentRequest {
                order_id: order.id,
                provider: "card".into(),
                actor_id: order.actor_id,
            },
        )
        .await
        .unwrap_err();

    assert_eq!(err.code(), "PROVIDER_TIMEOUT");
    assert!(app.store.payments_for_order(order.id).await.is_empty());
}

#[tokio::test]
async fn unknown_provider_fails_fast() {
    let app = TestApp::new().await;
    let order = app.create_order(1000).await;

    let err = app
        .state
        .payments
        .start_payment(
            app.tenant_id,
            StartPaymentRequest {
                order_id: order.id,
                provider: "barter".into(),
                actor_id: order.actor_id,
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::UnsupportedProvider(_)));
}

#[tokio::test]
async fn offline_store_only_accepts_wallet_payments() {
    let app = TestApp::new().await;
    app.store.set_store_online(app.store_id, false).await;
    let order = app.create_order(1000).await;

    let err = app
        .state
        .payments
        .start_payment(
            app.tenant_id,
            StartPaymentRequest {
                order_id: order.id,
                provider: "card".into(),
                actor_id: order.actor_id,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::PaymentDisabledOffline));
    assert_eq!(app.card.intent_calls(), 0);

    let payment = app.start_payment(&order, "wallet").await;
    assert_eq!(payment.provider, "wallet");
}

#[tokio::test]
async fn confirm_applies_the_provider_status() {
    let app = TestApp::new().await;
    let payment = app.paid_payment(1000).await;

    assert_eq!(payment.status, PaymentStatus::Paid);
    assert!(payment.paid_at.is_some());
    assert_eq!(app.order_status(payment.order_id).await, OrderStatus::Paid);
    assert_eq!(app.count_events_for(EventKind::PaymentConfirmed, payment.id).await, 1);

    // Confirming again is a no-op
    let again = app
        .state
        .payments
        .confirm_payment(app.tenant_id, payment.id, "test")
        .await
        .unwrap();
    assert_eq!(again.status, PaymentStatus::Paid);
    assert_eq!(app.count_events_for(EventKind::PaymentConfirmed, payment.id).await, 1);
}

#[tokio::test]
async fn cashier_payment_is_confirmed_without_a_provider() {
    let app = TestApp::new().await;
    let order = app.create_order(2500).await;

    let (payment, created) = app
        .state
        .payments
        .start_cashier_payment(
            app.tenant_id,
            StartCashierPaymentRequest {
                order_id: order.id,
                actor_id: order.actor_id,
            },
        )
        .await
        .unwrap();
    assert!(created);
    assert_eq!(payment.flow, PaymentFlow::Cashier);
    assert_eq!(payment.expires_at, None);

    let paid = app
        .state
        .payments
        .confirm_payment(app.tenant_id, payment.id, "cashier-7")
        .await
        .unwrap();

    assert_eq!(paid.status, PaymentStatus::Paid);
    assert_eq!(app.card.intent_calls() + app.card.lookup_calls(), 0);
    let trail = app.state.payments.audit_trail(app.tenant_id, payment.id).await.unwrap();
    let last = trail.last().unwrap();
    assert_eq!(last.source, AuditSource::Cashier);
    assert_eq!(last.operator.as_deref(), Some("cashier-7"));
}

#[tokio::test]
async fn retry_is_refused_after_max_retries_without_calling_the_provider() {
    let app = TestApp::new().await;
    let order = app.create_order(1000).await;
    let payment = app.start_payment(&order, "card").await;
    let provider_ref = payment.provider_ref.clone().unwrap();
    app.card
        .set_lookup(&provider_ref, CanonicalStatus::Failed, Some(ProviderErrorCode::CardDeclined));

    let failed = app
        .state
        .payments
        .confirm_payment(app.tenant_id, payment.id, "test")
        .await
        .unwrap();
    assert_eq!(failed.status, PaymentStatus::Failed);

    for attempt in 1..=3 {
        app.advance(Duration::minutes(6));
        let retried = app
            .state
            .payments
            .retry_failed_payment(app.tenant_id, payment.id, "test")
            .await
            .unwrap();
        assert_eq!(retried.status, PaymentStatus::Failed);
        assert_eq!(retried.retries, attempt);
    }

    let lookups = app.card.lookup_calls();
    app.advance(Duration::minutes(6));
    let err = app
        .state
        .payments
        .retry_failed_payment(app.tenant_id, payment.id, "test")
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::MaxRetriesExceeded));
    assert_eq!(app.card.lookup_calls(), lookups);
}

#[tokio::test]
async fn retry_within_cooldown_is_refused() {
    let app = TestApp::new().await;
    let order = app.create_order(1000).await;
    let payment = app.start_payment(&order, "card").await;
    let provider_ref = payment.provider_ref.clone().unwrap();
    app.card
        .set_lookup(&provider_ref, CanonicalStatus::Failed, Some(ProviderErrorCode::InsufficientFunds));
    app.state
        .payments
        .confirm_payment(app.tenant_id, payment.id, "test")
        .await
        .unwrap();

    app.state
        .payments
        .retry_failed_payment(app.tenant_id, payment.id, "test")
        .await
        .unwrap();
    let retried_at = common::start_time();

    app.advance(Duration::minutes(2));
    let err = app
        .state
        .payments
        .retry_failed_payment(app.tenant_id, payment.id, "test")
        .await
        .unwrap_err();

    match err {
        AppError::RetryCooldownActive { retry_after } => {
            assert_eq!(retry_after, retried_at + Duration::minutes(5));
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn retry_that_succeeds_at_the_provider_pays_the_order() {
    let app = TestApp::new().await;
    let order = app.create_order(1000).await;
    let payment = app.start_payment(&order, "card").await;
    let provider_ref = payment.provider_ref.clone().unwrap();
    app.card
        .set_lookup(&provider_ref, CanonicalStatus::Failed, Some(ProviderErrorCode::InsufficientFunds));
    app.state
        .payments
        .confirm_payment(app.tenant_id, payment.id, "test")
        .await
        .unwrap();

    app.card.set_lookup(&provider_ref, CanonicalStatus::Paid, None);
    let paid = app
        .state
        .payments
        .retry_failed_payment(app.tenant_id, payment.id, "test")
        .await
        .unwrap();

    assert_eq!(paid.status, PaymentStatus::Paid);
    assert_eq!(paid.retries, 1);
    assert_eq!(app.order_status(order.id).await, OrderStatus::Paid);
}

#[tokio::test]
async fn fraud_flagged_payment_is_not_retryable() {
    let app = TestApp::new().await;
    let order = app.create_order(1000).await;
    let payment = app.start_payment(&order, "card").await;
    let provider_ref = payment.provider_ref.clone().unwrap();
    app.card
        .set_lookup(&provider_ref, CanonicalStatus::Failed, Some(ProviderErrorCode::FraudSuspected));
    app.state
        .payments
        .confirm_payment(app.tenant_id, payment.id, "test")
        .await
        .unwrap();

    let err = app
        .state
        .payments
        .retry_failed_payment(app.tenant_id, payment.id, "test")
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::PaymentNotRetryable(_)));
}

#[tokio::test]
async fn void_cancels_the_order_and_releases_inventory() {
    let app = TestApp::new().await;
    let order = app.create_order(1000).await;
    let payment = app.start_payment(&order, "card").await;

    let voided = app
        .state
        .payments
        .void_payment(app.tenant_id, payment.id, "customer left", "pos-terminal")
        .await
        .unwrap();

    assert_eq!(voided.status, PaymentStatus::Cancelled);
    assert!(voided.voided_at.is_some());
    assert_eq!(app.order_status(order.id).await, OrderStatus::Cancelled);
    assert_eq!(app.count_events_for(EventKind::InventoryReleaseRequested, payment.id).await, 1);

    let err = app
        .state
        .payments
        .void_payment(app.tenant_id, payment.id, "again", "pos-terminal")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidPaymentTransition { .. }));
}

#[tokio::test]
async fn admin_override_is_checked_and_audited() {
    let app = TestApp::new().await;
    let payment = app.paid_payment(1000).await;

    let corrected = app
        .state
        .payments
        .correct_payment(
            app.tenant_id,
            payment.id,
            PaymentStatus::Failed,
            "chargeback confirmed by acquirer",
            "ops-admin",
        )
        .await
        .unwrap();
    assert_eq!(corrected.status, PaymentStatus::Failed);
    assert!(corrected.corrected_at.is_some());

    let trail = app.state.payments.audit_trail(app.tenant_id, payment.id).await.unwrap();
    let last = trail.last().unwrap();
    assert_eq!(last.source, AuditSource::Admin);
    assert_eq!(last.reason.as_deref(), Some("chargeback confirmed by acquirer"));
    assert_eq!(last.before_status.as_deref(), Some("PAID"));
    assert_eq!(last.after_status, "FAILED");

    let err = app
        .state
        .payments
        .correct_payment(app.tenant_id, payment.id, PaymentStatus::Refunded, "typo", "ops-admin")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidPaymentTransition { .. }));

    let err = app
        .state
        .payments
        .correct_payment(app.tenant_id, payment.id, PaymentStatus::Paid, "  ", "ops-admin")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidRequest(_)));
}

#[tokio::test]
async fn other_tenants_payments_are_not_found() {
    let app = TestApp::new().await;
    let order = app.create_order(1000).await;
    let payment = app.start_payment(&order, "card").await;

    let err = app
        .state
        .payments
        .get_payment(Uuid::new_v4(), payment.id)
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::PaymentNotFound));
}

#[tokio::test]
async fn confirmation_waits_for_the_payment_lock() {
    let app = TestApp::new().await;
    let order = app.create_order(1000).await;
    let payment = app.start_payment(&order, "card").await;
    app.card
        .set_lookup(payment.provider_ref.as_deref().unwrap(), CanonicalStatus::Paid, None);

    // Another confirmation holds the lock
    let now = common::start_time();
    assert!(app.store.try_lock_payment(payment.id, now, now - Duration::seconds(60)).await.unwrap());

    let err = app
        .state
        .payments
        .confirm_payment(app.tenant_id, payment.id, "test")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::PaymentInProgress));
    assert_eq!(err.code(), "PAYMENT_IN_PROGRESS");
    assert_eq!(app.card.lookup_calls(), 0);

    app.store.release_payment_lock(payment.id).await.unwrap();
    let paid = app
        .state
        .payments
        .confirm_payment(app.tenant_id, payment.id, "test")
        .await
        .unwrap();
    assert_eq!(paid.status, PaymentStatus::Paid);

    let stored = app.state.payments.get_payment(app.tenant_id, payment.id).await.unwrap();
    assert_eq!(stored.locked_at, None);
}

#[tokio::test]
async fn stale_payment_lock_is_taken_over() {
    let app = TestApp::new().await;
    let order = app.create_order(1000).await;
    let payment = app.start_payment(&order, "card").await;
    app.card
        .set_lookup(payment.provider_ref.as_deref().unwrap(), CanonicalStatus::Paid, None);
    let now = common::start_time();
    app.store
        .try_lock_payment(payment.id, now, now - Duration::seconds(60))
        .await
        .unwrap();

    app.advance(Duration::seconds(61));
    let paid = app
        .state
        .payments
        .confirm_payment(app.tenant_id, payment.id, "test")
        .await
        .unwrap();

    assert_eq!(paid.status, PaymentStatus::Paid);
    assert_eq!(app.card.lookup_calls(), 1);
}
