mod common;

use axum::http::StatusCode;
use common::{ADMIN_KEY, CLIENT_KEY, TestApp, get, post_json, send, webhook_body};
use payment_lifecycle_engine::{
    error::AppError,
    models::{
        audit::{AuditContext, AuditSource},
        events::EventKind,
        payment::PaymentStatus,
        refund::{CreateRefundRequest, RefundStatus},
        risk::FraudSignal,
        webhook::WebhookAckStatus,
    },
    providers::{ProviderError, ProviderErrorCode},
};
use serde_json::json;
use uuid::Uuid;

fn refund_request(amount: i64) -> CreateRefundRequest {
    CreateRefundRequest {
        amount,
        reason: "damaged in transit".into(),
        requested_by: "pos-terminal".into(),
    }
}

async fn payment_status(app: &TestApp, payment_id: Uuid) -> PaymentStatus {
    app.state
        .payments
        .get_payment(app.tenant_id, payment_id)
        .await
        .unwrap()
        .status
}

#[tokio::test]
async fn partial_then_full_refund() {
    let app = TestApp::new().await;
    let payment = app.paid_payment(1000).await;

    let first = app
        .state
        .refunds
        .request_refund(app.tenant_id, payment.id, refund_request(400))
        .await
        .unwrap();
    assert_eq!(first.status, RefundStatus::Completed);
    assert_eq!(first.provider_ref, Some(format!("card_rf_{}", first.id.simple())));
    assert_eq!(payment_status(&app, payment.id).await, PaymentStatus::PartiallyRefunded);

    let err = app
        .state
        .refunds
        .request_refund(app.tenant_id, payment.id, refund_request(700))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::RefundExceedsPayment));

    let second = app
        .state
        .refunds
        .request_refund(app.tenant_id, payment.id, refund_request(600))
        .await
        .unwrap();
    assert_eq!(second.status, RefundStatus::Completed);
    assert_eq!(payment_status(&app, payment.id).await, PaymentStatus::Refunded);
    assert_eq!(app.card.refund_calls(), 2);

    let err = app
        .state
        .refunds
        .request_refund(app.tenant_id, payment.id, refund_request(1))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::PaymentNotRefundable(_)));
}

#[tokio::test]
async fn unpaid_payment_cannot_be_refunded() {
    let app = TestApp::new().await;
    let order = app.create_order(1000).await;
    let payment = app.start_payment(&order, "card").await;

    let err = app
        .state
        .refunds
        .request_refund(app.tenant_id, payment.id, refund_request(100))
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::PaymentNotRefundable(_)));
    assert_eq!(app.card.refund_calls(), 0);
}

#[tokio::test]
async fn invalid_amounts_and_reasons_are_refused() {
    let app = TestApp::new().await;
    let payment = app.paid_payment(1000).await;

    for request in [
        refund_request(0),
        refund_request(-5),
        CreateRefundRequest {
            reason: "   ".into(),
            ..refund_request(100)
        },
    ] {
        let err = app
            .state
            .refunds
            .request_refund(app.tenant_id, payment.id, request)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidRequest(_)));
    }
}

#[tokio::test]
async fn provider_refusal_fails_the_refund_and_frees_the_balance() {
    let app = TestApp::new().await;
    let payment = app.paid_payment(1000).await;
    app.card
        .fail_next_refund(ProviderError::new(ProviderErrorCode::CardDeclined, "refund window closed"));

    let failed = app
        .state
        .refunds
        .request_refund(app.tenant_id, payment.id, refund_request(1000))
        .await
        .unwrap();
    assert_eq!(failed.status, RefundStatus::Failed);
    assert!(failed.failure_reason.is_some());
    assert_eq!(payment_status(&app, payment.id).await, PaymentStatus::Paid);

    let retried = app
        .state
        .refunds
        .request_refund(app.tenant_id, payment.id, refund_request(1000))
        .await
        .unwrap();
    assert_eq!(retried.status, RefundStatus::Completed);
    assert_eq!(payment_status(&app, payment.id).await, PaymentStatus::Refunded);
}

#[tokio::test]
async fn asynchronous_refund_completes_from_the_provider_webhook() {
    let app = TestApp::new().await;
    let payment = app.paid_payment(1000).await;
    app.card.defer_refunds();

    let refund = app
        .state
        .refunds
        .request_refund(app.tenant_id, payment.id, refund_request(300))
        .await
        .unwrap();
    assert_eq!(refund.status, RefundStatus::Processing);
    assert_eq!(payment_status(&app, payment.id).await, PaymentStatus::Paid);

    let body = webhook_body("evt_rf_1", "refund.succeeded", refund.provider_ref.as_deref().unwrap(), 300, "USD");
    let signature = app.card.sign(&body);
    let ack = app.state.webhooks.ingest("card", Some(&signature), &body).await.unwrap();
    assert_eq!(ack.status, WebhookAckStatus::Processed);

    let completed = app.state.refunds.get_refund(app.tenant_id, refund.id).await.unwrap();
    assert_eq!(completed.status, RefundStatus::Completed);
    assert!(completed.completed_at.is_some());
    assert_eq!(payment_status(&app, payment.id).await, PaymentStatus::PartiallyRefunded);
}

#[tokio::test]
async fn completion_refused_by_the_payment_leaves_the_refund_processing() {
    let app = TestApp::new().await;
    let payment = app.paid_payment(1000).await;
    app.card.defer_refunds();
    let refund = app
        .state
        .refunds
        .request_refund(app.tenant_id, payment.id, refund_request(300))
        .await
        .unwrap();
    app.state
        .payments
        .correct_payment(app.tenant_id, payment.id, PaymentStatus::Failed, "chargeback", "ops-admin")
        .await
        .unwrap();

    let err = app
        .state
        .refunds
        .complete_from_provider(refund.id, None, AuditContext::new(AuditSource::Webhook))
        .await
        .unwrap_err();

    assert_eq!(err.code(), "INVALID_PAYMENT_TRANSITION");
    let stored = app.state.refunds.get_refund(app.tenant_id, refund.id).await.unwrap();
    assert_eq!(stored.status, RefundStatus::Processing);
    assert_eq!(stored.completed_at, None);
    assert_eq!(app.count_events_for(EventKind::RefundCompleted, refund.id).await, 0);
    assert_eq!(payment_status(&app, payment.id).await, PaymentStatus::Failed);
}

#[tokio::test]
async fn refund_for_an_actor_under_review_waits_for_admin_approval() {
    let app = TestApp::new().await;
    let payment = app.paid_payment(1000).await;

    // 50 + 30 - 4 x 2 = 72
    let risk = &app.state.risk;
    for signal in [FraudSignal::ProviderFraudFlag, FraudSignal::HighRiskIp] {
        risk.evaluate(app.tenant_id, payment.actor_id, signal, json!({})).await.unwrap();
    }
    for _ in 0..4 {
        risk.evaluate(app.tenant_id, payment.actor_id, FraudSignal::PaymentSucceeded, json!({}))
            .await
            .unwrap();
    }
    let profile = risk.profile(app.tenant_id, payment.actor_id).await.unwrap();
    assert_eq!(profile.risk.score, 72);

    let held = app
        .state
        .refunds
        .request_refund(app.tenant_id, payment.id, refund_request(500))
        .await
        .unwrap();
    assert!(held.requires_approval);
    assert_eq!(held.status, RefundStatus::Requested);
    assert_eq!(app.card.refund_calls(), 0);

    let router = app.router();
    let (status, approved) = send(
        &router,
        post_json(&format!("/api/v1/admin/refunds/{}/approve", held.id), ADMIN_KEY, None, json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(approved["status"], "COMPLETED");
    assert_eq!(approved["approved_by"], "ops-admin");
    assert_eq!(app.card.refund_calls(), 1);

    let err = app
        .state
        .refunds
        .approve_refund(app.tenant_id, held.id, "ops-admin")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidRefundTransition { .. }));
}

#[tokio::test]
async fn rejected_refund_never_reaches_the_provider() {
    let app = TestApp::new().await;
    let payment = app.paid_payment(1000).await;
    for signal in [FraudSignal::ProviderFraudFlag, FraudSignal::HighRiskIp] {
        app.state
            .risk
            .evaluate(app.tenant_id, payment.actor_id, signal, json!({}))
            .await
            .unwrap();
    }

    let held = app
        .state
        .refunds
        .request_refund(app.tenant_id, payment.id, refund_request(500))
        .await
        .unwrap();
    let rejected = app
        .state
        .refunds
        .reject_refund(app.tenant_id, held.id, "customer kept the goods", "ops-admin")
        .await
        .unwrap();

    assert_eq!(rejected.status, RefundStatus::Cancelled);
    assert_eq!(app.card.refund_calls(), 0);
    assert_eq!(payment_status(&app, payment.id).await, PaymentStatus::Paid);
}

#[tokio::test]
async fn locked_actor_cannot_request_refunds() {
    let app = TestApp::new().await;
    let payment = app.paid_payment(1000).await;
    for signal in [FraudSignal::ProviderFraudFlag, FraudSignal::MultiFailureVelocity] {
        app.state
            .risk
            .evaluate(app.tenant_id, payment.actor_id, signal, json!({}))
            .await
            .unwrap();
    }

    let err = app
        .state
        .refunds
        .request_refund(app.tenant_id, payment.id, refund_request(100))
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::PaymentLockedByRiskPolicy));
}

#[tokio::test]
async fn refunds_over_http() {
    let app = TestApp::new().await;
    let payment = app.paid_payment(1000).await;
    let router = app.router();
    let uri = format!("/api/v1/payments/{}/refunds", payment.id);
    let body = json!({ "amount": 250, "reason": "wrong size", "requested_by": "clerk-3" });

    let (status, created) = send(&router, post_json(&uri, CLIENT_KEY, Some("refund-1"), body)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["status"], "COMPLETED");
    assert_eq!(created["amount"], 250);

    let (status, listed) = send(&router, get(&uri, CLIENT_KEY)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let refund_id = created["id"].as_str().unwrap();
    let (status, fetched) = send(&router, get(&format!("/api/v1/refunds/{refund_id}"), CLIENT_KEY)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["id"], created["id"]);

    let (status, error) = send(
        &router,
        post_json(&uri, CLIENT_KEY, Some("refund-2"), json!({ "amount": 5000, "reason": "x", "requested_by": "clerk-3" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(error["error"]["code"], "REFUND_EXCEEDS_PAYMENT");
}
