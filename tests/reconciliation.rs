mod common;

use axum::http::StatusCode;
use chrono::{DateTime, Duration, Utc};
use common::{ADMIN_KEY, TestApp, get, post_json, send};
use payment_lifecycle_engine::{
    clock::Clock,
    models::{
        audit::{AuditContext, AuditSource},
        events::{AlertKind, EventKind},
        order::OrderStatus,
        payment::PaymentStatus,
        reconciliation::{SettlementLine, SettlementReport},
        refund::{CreateRefundRequest, RefundStatus},
        risk::FraudSignal,
    },
    providers::{CanonicalStatus, ProviderError, ProviderErrorCode},
    store::{RefundRepository, RefundTransition},
};
use serde_json::json;

fn day(date: &str) -> DateTime<Utc> {
    format!("{date}T00:00:00Z").parse().unwrap()
}

fn line(provider_ref: &str, amount: i64) -> SettlementLine {
    SettlementLine {
        provider_ref: provider_ref.to_string(),
        amount,
        currency: "USD".into(),
    }
}

fn refund_request(amount: i64) -> CreateRefundRequest {
    CreateRefundRequest {
        amount,
        reason: "returned".into(),
        requested_by: "pos-terminal".into(),
    }
}

fn report(payments: Vec<SettlementLine>) -> SettlementReport {
    SettlementReport {
        provider: "card".into(),
        period_start: day("2026-10-19"),
        period_end: day("2026-10-20"),
        payments,
        refunds: Vec::new(),
    }
}

#[tokio::test]
async fn polling_applies_a_missed_success() {
    let app = TestApp::new().await;
    let order = app.create_order(1000).await;
    let payment = app.start_payment(&order, "card").await;
    app.card
        .set_lookup(payment.provider_ref.as_deref().unwrap(), CanonicalStatus::Paid, None);

    // Fresh payments are left alone
    let summary = app.state.reconciliation.reconcile_stale_payments(100).await.unwrap();
    assert_eq!(summary.checked, 0);

    app.advance(Duration::minutes(6));
    app.state.scheduler.run_named("payment_reconciliation").await.unwrap();

    let paid = app.state.payments.get_payment(app.tenant_id, payment.id).await.unwrap();
    assert_eq!(paid.status, PaymentStatus::Paid);
    assert_eq!(app.order_status(order.id).await, OrderStatus::Paid);
    let trail = app.state.payments.audit_trail(app.tenant_id, payment.id).await.unwrap();
    assert_eq!(trail.last().unwrap().source, AuditSource::Reconciliation);
}

#[tokio::test]
async fn polling_counts_provider_outages_without_changing_anything() {
    let app = TestApp::new().await;
    let order = app.create_order(1000).await;
    let payment = app.start_payment(&order, "card").await;
    app.card.fail_next_lookup(ProviderError::unavailable("maintenance"));

    app.advance(Duration::minutes(6));
    let summary = app.state.reconciliation.reconcile_stale_payments(100).await.unwrap();

    assert_eq!(summary.checked, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.updated, 0);
    assert_eq!(
        app.state.payments.get_payment(app.tenant_id, payment.id).await.unwrap().status,
        PaymentStatus::Pending
    );
}

#[tokio::test]
async fn polling_completes_a_refund_whose_settlement_event_was_missed() {
    let app = TestApp::new().await;
    let payment = app.paid_payment(1000).await;
    app.card.defer_refunds();
    let refund = app
        .state
        .refunds
        .request_refund(app.tenant_id, payment.id, refund_request(400))
        .await
        .unwrap();
    let refund_ref = refund.provider_ref.clone().unwrap();
    assert_eq!(refund.status, RefundStatus::Processing);

    // Still pending at the provider
    app.advance(Duration::minutes(6));
    let summary = app.state.reconciliation.reconcile_stale_refunds(100).await.unwrap();
    assert_eq!(summary.checked, 1);
    assert_eq!(summary.updated, 0);

    app.card.set_lookup(&refund_ref, CanonicalStatus::Paid, None);
    app.advance(Duration::minutes(6));
    app.state.scheduler.run_named("payment_reconciliation").await.unwrap();

    let completed = app.state.refunds.get_refund(app.tenant_id, refund.id).await.unwrap();
    assert_eq!(completed.status, RefundStatus::Completed);
    assert_eq!(
        app.state.payments.get_payment(app.tenant_id, payment.id).await.unwrap().status,
        PaymentStatus::PartiallyRefunded
    );
    assert_eq!(app.count_events_for(EventKind::RefundCompleted, refund.id).await, 1);
}

#[tokio::test]
async fn polling_recovers_the_reference_of_an_interrupted_refund_submission() {
    let app = TestApp::new().await;
    let payment = app.paid_payment(1000).await;

    // Hold the refund for approval so it can be moved to PROCESSING without a provider call
    let risk = &app.state.risk;
    for signal in [FraudSignal::ProviderFraudFlag, FraudSignal::HighRiskIp] {
        risk.evaluate(app.tenant_id, payment.actor_id, signal, json!({})).await.unwrap();
    }
    for _ in 0..4 {
        risk.evaluate(app.tenant_id, payment.actor_id, FraudSignal::PaymentSucceeded, json!({}))
            .await
            .unwrap();
    }
    let held = app
        .state
        .refunds
        .request_refund(app.tenant_id, payment.id, refund_request(1000))
        .await
        .unwrap();
    assert_eq!(held.status, RefundStatus::Requested);
    app.store
        .apply_refund_transition(RefundTransition::new(
            held.id,
            RefundStatus::Processing,
            AuditContext::new(AuditSource::Admin).operator("ops-admin"),
            app.clock.now(),
        ))
        .await
        .unwrap();

    app.advance(Duration::minutes(6));
    let summary = app.state.reconciliation.reconcile_stale_refunds(100).await.unwrap();

    assert_eq!(summary.updated, 1);
    assert_eq!(app.card.refund_calls(), 1);
    let completed = app.state.refunds.get_refund(app.tenant_id, held.id).await.unwrap();
    assert_eq!(completed.status, RefundStatus::Completed);
    assert_eq!(
        completed.provider_ref.as_deref(),
        Some(format!("card_rf_{}", held.id.simple()).as_str())
    );
    assert_eq!(
        app.state.payments.get_payment(app.tenant_id, payment.id).await.unwrap().status,
        PaymentStatus::Refunded
    );
}

#[tokio::test]
async fn abandoned_intent_times_out_and_releases_inventory() {
    let app = TestApp::new().await;
    let order = app.create_order(1000).await;
    let payment = app.start_payment(&order, "card").await;

    app.advance(Duration::minutes(10));
    app.state.scheduler.run_named("payment_timeout").await.unwrap();
    assert_eq!(
        app.state.payments.get_payment(app.tenant_id, payment.id).await.unwrap().status,
        PaymentStatus::Pending
    );

    app.advance(Duration::minutes(6));
    app.state.scheduler.run_named("payment_timeout").await.unwrap();

    let expired = app.state.payments.get_payment(app.tenant_id, payment.id).await.unwrap();
    assert_eq!(expired.status, PaymentStatus::Failed);
    assert_eq!(expired.failure_code.as_deref(), Some(ProviderErrorCode::ProviderTimeout.as_str()));
    assert_eq!(app.order_status(order.id).await, OrderStatus::Cancelled);
    assert_eq!(app.count_events_for(EventKind::PaymentFailed, payment.id).await, 1);
    assert_eq!(app.count_events_for(EventKind::InventoryReleaseRequested, payment.id).await, 1);
    let trail = app.state.payments.audit_trail(app.tenant_id, payment.id).await.unwrap();
    assert_eq!(trail.last().unwrap().source, AuditSource::Timeout);

    // A second pass finds nothing left to expire
    assert_eq!(app.state.reconciliation.expire_intents(100).await.unwrap(), 0);
}

#[tokio::test]
async fn expiry_defers_to_a_provider_success() {
    let app = TestApp::new().await;
    let order = app.create_order(1000).await;
    let payment = app.start_payment(&order, "card").await;
    app.card
        .set_lookup(payment.provider_ref.as_deref().unwrap(), CanonicalStatus::Paid, None);

    app.advance(Duration::minutes(16));
    assert_eq!(app.state.reconciliation.expire_intents(100).await.unwrap(), 1);

    let paid = app.state.payments.get_payment(app.tenant_id, payment.id).await.unwrap();
    assert_eq!(paid.status, PaymentStatus::Paid);
    assert_eq!(app.order_status(order.id).await, OrderStatus::Paid);
}

#[tokio::test]
async fn matching_statement_records_a_clean_reconciliation() {
    let app = TestApp::new().await;
    let payment = app.paid_payment(1000).await;

    let result = app
        .state
        .reconciliation
        .reconcile_settlement(report(vec![line(payment.provider_ref.as_deref().unwrap(), 1000)]))
        .await
        .unwrap();

    assert!(!result.has_discrepancy);
    assert_eq!(result.local_payment_count, 1);
    assert_eq!(result.net_variance, 0);
    assert_eq!(app.count_alerts(AlertKind::SettlementDiscrepancy).await, 0);
}

#[tokio::test]
async fn statement_with_an_unknown_line_raises_a_discrepancy() {
    let app = TestApp::new().await;
    let payment = app.paid_payment(1000).await;
    let router = app.router();

    let body = serde_json::to_value(report(vec![
        line(payment.provider_ref.as_deref().unwrap(), 1000),
        line("card_unknown", 500),
    ]))
    .unwrap();
    let (status, result) = send(&router, post_json("/api/v1/admin/settlements", ADMIN_KEY, None, body)).await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(result["has_discrepancy"], true);
    assert_eq!(result["payment_amount_variance"], -500);
    assert_eq!(result["net_variance"], -500);
    assert_eq!(result["missing_locally"], json!(["card_unknown"]));
    assert_eq!(result["missing_at_provider"], json!([]));
    assert_eq!(app.count_alerts(AlertKind::SettlementDiscrepancy).await, 1);

    let (status, listed) = send(&router, get("/api/v1/admin/settlements?provider=card", ADMIN_KEY)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn inverted_statement_period_is_refused() {
    let app = TestApp::new().await;
    let mut statement = report(Vec::new());
    std::mem::swap(&mut statement.period_start, &mut statement.period_end);

    let err = app.state.reconciliation.reconcile_settlement(statement).await.unwrap_err();

    assert_eq!(err.code(), "INVALID_REQUEST");
}

#[tokio::test]
async fn nightly_settlement_covers_the_previous_day() {
    let app = TestApp::new().await;
    app.paid_payment(1000).await;
    app.card.set_settlement(report(Vec::new()));

    app.advance(Duration::hours(17));
    let reconciled = app.state.reconciliation.reconcile_previous_day().await.unwrap();

    // The wallet mock publishes no statement
    assert_eq!(reconciled, 1);
    let stored = app.state.reconciliation.list_reconciliations(Some("card"), 10).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].period_start, day("2026-10-19"));
    assert_eq!(stored[0].local_payment_total, 1000);
    assert!(stored[0].has_discrepancy);
}
