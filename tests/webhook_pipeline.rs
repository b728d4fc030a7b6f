mod common;

use axum::http::StatusCode;
use chrono::Duration;
use common::{ADMIN_KEY, CLIENT_KEY, TestApp, get, post_json, send, webhook_body, webhook_request};
use payment_lifecycle_engine::{
    error::AppError,
    models::{
        events::{AlertKind, EventKind},
        order::OrderStatus,
        payment::PaymentStatus,
        webhook::{DeadLetterStatus, WebhookAckStatus},
    },
    store::WebhookRepository,
};
use serde_json::json;

const HEADER: &str = "X-Mock-Signature";

#[tokio::test]
async fn repeated_deliveries_confirm_the_payment_once() {
    let app = TestApp::new().await;
    let order = app.create_order(1000).await;
    let payment = app.start_payment(&order, "card").await;
    let provider_ref = payment.provider_ref.clone().unwrap();
    let router = app.router();

    let body = webhook_body("evt_1001", "payment.succeeded", &provider_ref, 1000, "usd");
    let signature = app.card.sign(&body);

    let mut statuses = Vec::new();
    for _ in 0..4 {
        let (status, ack) = send(&router, webhook_request("card", HEADER, &signature, body.clone())).await;
        assert_eq!(status, StatusCode::OK);
        statuses.push(ack["status"].as_str().unwrap().to_string());
    }

    assert_eq!(statuses, ["processed", "duplicate", "duplicate", "duplicate"]);
    assert_eq!(app.store.webhook_event_count().await, 1);
    assert_eq!(app.count_events_for(EventKind::PaymentConfirmed, payment.id).await, 1);

    let paid = app.state.payments.get_payment(app.tenant_id, payment.id).await.unwrap();
    assert_eq!(paid.status, PaymentStatus::Paid);
    assert_eq!(app.order_status(order.id).await, OrderStatus::Paid);
}

#[tokio::test]
async fn applied_event_is_acknowledged_when_marking_it_processed_fails() {
    let app = TestApp::new().await;
    let order = app.create_order(1000).await;
    let payment = app.start_payment(&order, "card").await;
    let router = app.router();
    let body = webhook_body("evt_1002", "payment.succeeded", payment.provider_ref.as_deref().unwrap(), 1000, "USD");
    let signature = app.card.sign(&body);
    app.store.fail_next_webhook_mark();

    let (status, ack) = send(&router, webhook_request("card", HEADER, &signature, body.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["status"], "processed");
    assert_eq!(app.order_status(order.id).await, OrderStatus::Paid);

    let (status, ack) = send(&router, webhook_request("card", HEADER, &signature, body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["status"], "duplicate");
    assert_eq!(app.count_events_for(EventKind::PaymentConfirmed, payment.id).await, 1);
}

#[tokio::test]
async fn bad_signature_is_refused_and_nothing_is_recorded() {
    let app = TestApp::new().await;
    let order = app.create_order(1000).await;
    let payment = app.start_payment(&order, "card").await;
    let body = webhook_body("evt_2001", "payment.succeeded", payment.provider_ref.as_deref().unwrap(), 1000, "USD");

    let (status, error) = send(&app.router(), webhook_request("card", HEADER, "sha256=deadbeef", body)).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(error["error"]["code"], "WEBHOOK_SIGNATURE_INVALID");
    assert_eq!(app.store.webhook_event_count().await, 0);
    assert_eq!(app.count_alerts(AlertKind::WebhookIntegrity).await, 1);
    assert_eq!(
        app.state.payments.get_payment(app.tenant_id, payment.id).await.unwrap().status,
        PaymentStatus::Pending
    );
}

#[tokio::test]
async fn amount_mismatch_is_rejected_and_abandoned() {
    let app = TestApp::new().await;
    let order = app.create_order(1000).await;
    let payment = app.start_payment(&order, "card").await;
    let body = webhook_body("evt_3001", "payment.succeeded", payment.provider_ref.as_deref().unwrap(), 999, "USD");
    let signature = app.card.sign(&body);

    let ack = app.state.webhooks.ingest("card", Some(&signature), &body).await.unwrap();

    assert_eq!(ack.status, WebhookAckStatus::Rejected);
    assert_eq!(ack.code.as_deref(), Some("PAYMENT_AMOUNT_MISMATCH"));
    let letters = app.state.webhooks.list_dead_letters(None).await.unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].status, DeadLetterStatus::Abandoned);
    assert_eq!(letters[0].next_retry_at, None);
    assert_eq!(app.count_alerts(AlertKind::WebhookIntegrity).await, 1);
    assert_eq!(
        app.state.payments.get_payment(app.tenant_id, payment.id).await.unwrap().status,
        PaymentStatus::Pending
    );
}

#[tokio::test]
async fn unknown_reference_is_rejected() {
    let app = TestApp::new().await;
    let body = webhook_body("evt_3101", "payment.succeeded", "card_doesnotexist", 1000, "USD");
    let signature = app.card.sign(&body);

    let ack = app.state.webhooks.ingest("card", Some(&signature), &body).await.unwrap();

    assert_eq!(ack.status, WebhookAckStatus::Rejected);
    assert_eq!(ack.code.as_deref(), Some("UNKNOWN_PROVIDER_REFERENCE"));
}

#[tokio::test]
async fn unhandled_event_types_are_recorded_and_ignored() {
    let app = TestApp::new().await;
    let body = webhook_body("evt_3201", "customer.updated", "cus_1", 0, "USD");
    let signature = app.card.sign(&body);

    let ack = app.state.webhooks.ingest("card", Some(&signature), &body).await.unwrap();

    assert_eq!(ack.status, WebhookAckStatus::Ignored);
    assert_eq!(app.store.webhook_event_count().await, 1);
    assert!(app.state.webhooks.list_dead_letters(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn malformed_body_is_a_bad_request() {
    let app = TestApp::new().await;
    let body = b"{not json".to_vec();
    let signature = app.card.sign(&body);

    let err = app.state.webhooks.ingest("card", Some(&signature), &body).await.unwrap_err();

    assert!(matches!(err, AppError::MalformedWebhook(_)));
    assert_eq!(app.store.webhook_event_count().await, 0);
}

#[tokio::test]
async fn concurrent_duplicates_are_processed_once() {
    let app = TestApp::new().await;
    let order = app.create_order(1000).await;
    let payment = app.start_payment(&order, "card").await;
    let body = webhook_body("evt_4001", "payment.succeeded", payment.provider_ref.as_deref().unwrap(), 1000, "USD");
    let signature = app.card.sign(&body);

    let (a, b) = tokio::join!(
        app.state.webhooks.ingest("card", Some(&signature), &body),
        app.state.webhooks.ingest("card", Some(&signature), &body),
    );

    let mut statuses = [a.unwrap().status, b.unwrap().status];
    statuses.sort_by_key(|s| *s == WebhookAckStatus::Duplicate);
    assert_eq!(statuses, [WebhookAckStatus::Processed, WebhookAckStatus::Duplicate]);
    assert_eq!(app.store.webhook_event_count().await, 1);
    assert_eq!(app.count_events_for(EventKind::PaymentConfirmed, payment.id).await, 1);
}

#[tokio::test]
async fn late_failure_is_queued_and_resolved_after_correction() {
    let app = TestApp::new().await;
    let payment = app.paid_payment(1000).await;
    let body = webhook_body("evt_5001", "payment.failed", payment.provider_ref.as_deref().unwrap(), 1000, "USD");
    let signature = app.card.sign(&body);

    let ack = app.state.webhooks.ingest("card", Some(&signature), &body).await.unwrap();
    assert_eq!(ack.status, WebhookAckStatus::Queued);

    let letters = app.state.webhooks.list_dead_letters(Some(DeadLetterStatus::Failed)).await.unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].attempt_count, 1);
    assert_eq!(letters[0].next_retry_at, Some(common::start_time() + Duration::minutes(1)));

    // Not due yet
    assert_eq!(app.state.webhooks.retry_due_dead_letters(100).await.unwrap(), 0);
    assert_eq!(
        app.state.webhooks.list_dead_letters(None).await.unwrap()[0].attempt_count,
        1
    );

    app.state
        .payments
        .correct_payment(app.tenant_id, payment.id, PaymentStatus::Failed, "acquirer reversal", "ops-admin")
        .await
        .unwrap();
    app.advance(Duration::minutes(2));

    assert_eq!(app.state.webhooks.retry_due_dead_letters(100).await.unwrap(), 1);
    let letters = app.state.webhooks.list_dead_letters(None).await.unwrap();
    assert_eq!(letters[0].status, DeadLetterStatus::Resolved);
}

#[tokio::test]
async fn dead_letter_backs_off_then_abandons() {
    let app = TestApp::new().await;
    let payment = app.paid_payment(1000).await;
    let body = webhook_body("evt_5101", "payment.failed", payment.provider_ref.as_deref().unwrap(), 1000, "USD");
    let signature = app.card.sign(&body);
    app.state.webhooks.ingest("card", Some(&signature), &body).await.unwrap();

    // Attempts 2..=5 at 1, 2, 4 and 8 minute backoffs
    for minutes in [1, 2, 4, 8] {
        app.advance(Duration::minutes(minutes));
        assert_eq!(app.state.webhooks.retry_due_dead_letters(100).await.unwrap(), 0);
    }

    let letters = app.state.webhooks.list_dead_letters(None).await.unwrap();
    assert_eq!(letters[0].attempt_count, 5);
    assert_eq!(letters[0].status, DeadLetterStatus::Abandoned);
    assert_eq!(app.count_alerts(AlertKind::DeadLetterAbandoned).await, 1);
}

#[tokio::test]
async fn replay_reprocesses_a_stored_event_and_is_logged() {
    let app = TestApp::new().await;
    let order = app.create_order(1000).await;
    let payment = app.start_payment(&order, "card").await;
    let body = webhook_body("evt_6001", "payment.succeeded", payment.provider_ref.as_deref().unwrap(), 1000, "USD");
    let signature = app.card.sign(&body);
    let ack = app.state.webhooks.ingest("card", Some(&signature), &body).await.unwrap();
    let event_id = ack.event_id.unwrap();

    let router = app.router();
    let (status, replayed) = send(
        &router,
        post_json(&format!("/api/v1/admin/webhooks/{event_id}/replay"), ADMIN_KEY, None, json!({})),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(replayed["status"], "processed");
    assert_eq!(app.count_events_for(EventKind::PaymentConfirmed, payment.id).await, 1);

    let replays = app.store.list_webhook_replays(event_id).await.unwrap();
    assert_eq!(replays.len(), 1);
    assert_eq!(replays[0].requested_by, "ops-admin");
    assert_eq!(replays[0].outcome, "processed");

    let summary = app
        .state
        .webhooks
        .replay_range(
            common::start_time() - Duration::hours(1),
            common::start_time() + Duration::hours(1),
            Some("card"),
            "ops-admin",
        )
        .await
        .unwrap();
    assert_eq!(summary.events, 1);
    assert_eq!(summary.processed, 1);
    assert_eq!(app.store.list_webhook_replays(event_id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn admin_surface_requires_the_admin_flag() {
    let app = TestApp::new().await;
    let router = app.router();

    let (status, _) = send(&router, get("/api/v1/admin/dead-letters", CLIENT_KEY)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = send(&router, get("/api/v1/admin/dead-letters", ADMIN_KEY)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));

    let (status, _) = send(&router, get("/api/v1/admin/dead-letters", "nope")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}
