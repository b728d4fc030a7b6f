//! Payment & refund lifecycle engine.
//!
//! Drives payments from intent creation through confirmation, failure, retry,
//! timeout, cancellation and refunds against external providers, with
//! idempotent commands, a verified and deduplicated webhook pipeline,
//! reconciliation against provider state and a risk policy that gates money moves.
//!
//! # Architecture
//!
//! - **Web Framework**: Axum (async HTTP server)
//! - **Database**: PostgreSQL with sqlx, or an in-memory store for tests
//! - **Authentication**: API key with SHA-256 hashing
//! - **Background work**: interval jobs on the tokio runtime

#[macro_use]
pub mod models;

pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod jobs;
pub mod middleware;
pub mod providers;
pub mod services;
pub mod state_machine;
pub mod store;

use std::sync::Arc;

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::clock::Clock;
use crate::config::{JobIntervals, PaymentSettings, RetryPolicy};
use crate::jobs::{
    DeadLetterRetryJob, IdempotencyPurgeJob, OutboxRelayJob, PaymentReconciliationJob,
    PaymentTimeoutJob, RiskDecayJob, Scheduler, SettlementJob,
};
use crate::middleware::{auth, idempotency::idempotency_middleware};
use crate::providers::ProviderRegistry;
use crate::services::{
    events::{EventBus, OutboxRelay},
    idempotency_service::IdempotencyService,
    payment_service::PaymentService,
    reconciliation_service::ReconciliationService,
    refund_service::RefundService,
    risk::RiskEngine,
    webhook_service::WebhookService,
};
use crate::store::Store;

/// Shared state handed to every handler and middleware.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub clock: Arc<dyn Clock>,
    pub payments: PaymentService,
    pub refunds: RefundService,
    pub webhooks: WebhookService,
    pub reconciliation: ReconciliationService,
    pub risk: RiskEngine,
    pub idempotency: IdempotencyService,
    pub events: EventBus,
    pub scheduler: Scheduler,
}

impl AppState {
    /// Wire every service and register the scheduled jobs (not started).
    pub fn new(
        store: Arc<dyn Store>,
        providers: ProviderRegistry,
        clock: Arc<dyn Clock>,
        settings: PaymentSettings,
        retry: RetryPolicy,
        intervals: JobIntervals,
    ) -> Self {
        let risk = RiskEngine::new(store.clone(), clock.clone());
        let payments = PaymentService::new(
            store.clone(),
            providers.clone(),
            risk.clone(),
            clock.clone(),
            settings.clone(),
            retry,
        );
        let refunds = RefundService::new(store.clone(), providers.clone(), risk.clone(), clock.clone(), retry);
        let webhooks = WebhookService::new(
            store.clone(),
            providers.clone(),
            payments.clone(),
            refunds.clone(),
            clock.clone(),
            settings.dead_letter_max_attempts,
        );
        let reconciliation = ReconciliationService::new(
            store.clone(),
            providers,
            payments.clone(),
            refunds.clone(),
            clock.clone(),
            settings.clone(),
        );
        let idempotency = IdempotencyService::new(store.clone(), clock.clone(), settings.clone());
        let events = EventBus::new();

        let scheduler = Scheduler::new(store.clone(), clock.clone())
            .register(PaymentTimeoutJob::new(reconciliation.clone(), intervals.timeout))
            .register(PaymentReconciliationJob::new(reconciliation.clone(), intervals.reconciliation))
            .register(DeadLetterRetryJob::new(webhooks.clone(), intervals.dead_letter))
            .register(RiskDecayJob::new(risk.clone(), settings.risk_decay_amount, intervals.risk_decay))
            .register(IdempotencyPurgeJob::new(idempotency.clone(), intervals.idempotency_purge))
            .register(SettlementJob::new(reconciliation.clone(), intervals.settlement))
            .register(OutboxRelayJob::new(
                OutboxRelay::new(store.clone(), events.clone(), clock.clone()),
                intervals.outbox,
            ));

        Self {
            store,
            clock,
            payments,
            refunds,
            webhooks,
            reconciliation,
            risk,
            idempotency,
            events,
            scheduler,
        }
    }
}

/// Build the HTTP router.
///
/// - Public: `/health`, `/webhooks/{provider}` (signature-authenticated)
/// - Client: `/api/v1/payments`, `/api/v1/refunds` behind API key auth
/// - Admin: `/api/v1/admin` behind API key auth plus the admin flag
///
/// Money-moving POSTs additionally require an `Idempotency-Key`.
pub fn build_router(state: AppState) -> Router {
    let idempotent = || axum_middleware::from_fn_with_state(state.clone(), idempotency_middleware);

    let client_routes = Router::new()
        .route(
            "/api/v1/payments",
            post(handlers::payments::start_payment).layer(idempotent()),
        )
        .route(
            "/api/v1/payments/cashier",
            post(handlers::payments::start_cashier_payment).layer(idempotent()),
        )
        .route("/api/v1/payments/{id}", get(handlers::payments::get_payment))
        .route(
            "/api/v1/payments/{id}/confirm",
            post(handlers::payments::confirm_payment).layer(idempotent()),
        )
        .route(
            "/api/v1/payments/{id}/retry",
            post(handlers::payments::retry_payment).layer(idempotent()),
        )
        .route(
            "/api/v1/payments/{id}/void",
            post(handlers::payments::void_payment).layer(idempotent()),
        )
        // The layer only wraps the POST added before it
        .route(
            "/api/v1/payments/{id}/refunds",
            post(handlers::refunds::request_refund)
                .layer(idempotent())
                .get(handlers::refunds::list_refunds),
        )
        .route("/api/v1/refunds/{id}", get(handlers::refunds::get_refund));

    let admin_routes = Router::new()
        .route("/api/v1/admin/dead-letters", get(handlers::admin::list_dead_letters))
        .route(
            "/api/v1/admin/dead-letters/{id}/retry",
            post(handlers::admin::retry_dead_letter),
        )
        .route("/api/v1/admin/webhooks/replay", post(handlers::admin::replay_range))
        .route("/api/v1/admin/webhooks/{id}/replay", post(handlers::admin::replay_event))
        .route(
            "/api/v1/admin/payments/{id}/override",
            post(handlers::admin::override_payment).layer(idempotent()),
        )
        .route("/api/v1/admin/payments/{id}/audit", get(handlers::admin::payment_audit))
        .route("/api/v1/admin/refunds/{id}/approve", post(handlers::admin::approve_refund))
        .route("/api/v1/admin/refunds/{id}/reject", post(handlers::admin::reject_refund))
        .route(
            "/api/v1/admin/settlements",
            post(handlers::admin::submit_settlement).get(handlers::admin::list_settlements),
        )
        .route("/api/v1/admin/risk/{actor_id}", get(handlers::admin::risk_profile))
        .route(
            "/api/v1/admin/risk/{actor_id}/signals",
            post(handlers::admin::submit_risk_signal),
        )
        .route("/api/v1/admin/jobs", get(handlers::admin::job_heartbeats))
        .route("/api/v1/admin/jobs/{name}/run", post(handlers::admin::run_job))
        .route_layer(axum_middleware::from_fn(auth::require_admin));

    // Layers run outermost-last, so auth wraps require_admin and the idempotency layers
    let authenticated_routes = client_routes
        .merge(admin_routes)
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            auth::auth_middleware,
        ));

    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/webhooks/{provider}", post(handlers::webhooks::receive_webhook))
        .merge(authenticated_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
