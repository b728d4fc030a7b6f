//! Admin / operations HTTP handlers.
//!
//! Every route here requires an admin API key. Actions that change state are
//! attributed to the key name in audit snapshots and replay records.
//!
//! - GET /api/v1/admin/dead-letters - List dead letters, optionally by status
//! - POST /api/v1/admin/dead-letters/{id}/retry - Redeliver one dead letter
//! - POST /api/v1/admin/webhooks/{id}/replay - Replay one stored event
//! - POST /api/v1/admin/webhooks/replay - Replay a time range
//! - POST /api/v1/admin/payments/{id}/override - Force a payment state (idempotent)
//! - GET /api/v1/admin/payments/{id}/audit - Audit trail of a payment
//! - POST /api/v1/admin/refunds/{id}/approve | /reject
//! - POST /api/v1/admin/settlements - Reconcile a settlement report
//! - GET /api/v1/admin/settlements - Past reconciliations
//! - GET /api/v1/admin/risk/{actor_id} - Risk profile
//! - POST /api/v1/admin/risk/{actor_id}/signals - Submit an external risk signal
//! - GET /api/v1/admin/jobs - Job heartbeats
//! - POST /api/v1/admin/jobs/{name}/run - Run a job now

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use crate::{
    AppState,
    error::AppError,
    middleware::auth::AuthContext,
    models::{
        audit::PaymentAuditSnapshot,
        job::JobHeartbeat,
        payment::{OverridePaymentRequest, PaymentResponse},
        reconciliation::{ReconciliationQuery, SettlementReconciliation, SettlementReport},
        refund::{RejectRefundRequest, Refund},
        risk::{RiskProfile, SubmitRiskSignalRequest},
        webhook::{DeadLetterQuery, ReplayRangeRequest, WebhookAck, WebhookDeadLetter},
    },
    services::webhook_service::ReplaySummary,
};

const DEFAULT_LIST_LIMIT: i64 = 50;
const MAX_LIST_LIMIT: i64 = 500;

pub async fn list_dead_letters(
    State(state): State<AppState>,
    Query(query): Query<DeadLetterQuery>,
) -> Result<Json<Vec<WebhookDeadLetter>>, AppError> {
    Ok(Json(state.webhooks.list_dead_letters(query.status).await?))
}

pub async fn retry_dead_letter(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<WebhookAck>, AppError> {
    Ok(Json(state.webhooks.retry_dead_letter(id, &auth.key_name).await?))
}

pub async fn replay_event(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<WebhookAck>, AppError> {
    Ok(Json(state.webhooks.replay_event(id, &auth.key_name).await?))
}

/// Replay every stored event received in a time range.
///
/// # Request Body
///
/// ```json
/// {
///   "from": "2026-10-18T00:00:00Z",
///   "to": "2026-10-18T06:00:00Z",
///   "provider": "card"
/// }
/// ```
pub async fn replay_range(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(request): Json<ReplayRangeRequest>,
) -> Result<Json<ReplaySummary>, AppError> {
    let summary = state
        .webhooks
        .replay_range(request.from, request.to, request.provider.as_deref(), &auth.key_name)
        .await?;
    Ok(Json(summary))
}

/// Force a payment into another state.
///
/// The move is checked against the override table and audited with the reason and
/// the admin key as operator.
///
/// # Request Body
///
/// ```json
/// { "status": "PAID", "reason": "confirmed with the acquirer by phone" }
/// ```
pub async fn override_payment(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
    Json(request): Json<OverridePaymentRequest>,
) -> Result<Json<PaymentResponse>, AppError> {
    let payment = state
        .payments
        .correct_payment(auth.tenant_id, id, request.status, &request.reason, &auth.key_name)
        .await?;
    Ok(Json(payment.into()))
}

pub async fn payment_audit(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<PaymentAuditSnapshot>>, AppError> {
    Ok(Json(state.payments.audit_trail(auth.tenant_id, id).await?))
}

pub async fn approve_refund(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<Refund>, AppError> {
    Ok(Json(
        state
            .refunds
            .approve_refund(auth.tenant_id, id, &auth.key_name)
            .await?,
    ))
}

pub async fn reject_refund(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
    Json(request): Json<RejectRefundRequest>,
) -> Result<Json<Refund>, AppError> {
    Ok(Json(
        state
            .refunds
            .reject_refund(auth.tenant_id, id, &request.reason, &auth.key_name)
            .await?,
    ))
}

/// Reconcile a provider settlement statement against local records.
///
/// # Response (201)
///
/// The persisted reconciliation; `has_discrepancy` is also raised as an alert.
pub async fn submit_settlement(
    State(state): State<AppState>,
    Json(report): Json<SettlementReport>,
) -> Result<impl IntoResponse, AppError> {
    let reconciliation = state.reconciliation.reconcile_settlement(report).await?;
    Ok((StatusCode::CREATED, Json(reconciliation)))
}

pub async fn list_settlements(
    State(state): State<AppState>,
    Query(query): Query<ReconciliationQuery>,
) -> Result<Json<Vec<SettlementReconciliation>>, AppError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
    Ok(Json(
        state
            .reconciliation
            .list_reconciliations(query.provider.as_deref(), limit)
            .await?,
    ))
}

pub async fn risk_profile(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(actor_id): Path<Uuid>,
) -> Result<Json<RiskProfile>, AppError> {
    Ok(Json(state.risk.profile(auth.tenant_id, actor_id).await?))
}

/// Feed a signal detected outside the engine, then return the updated profile.
pub async fn submit_risk_signal(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(actor_id): Path<Uuid>,
    Json(request): Json<SubmitRiskSignalRequest>,
) -> Result<Json<RiskProfile>, AppError> {
    tracing::info!(actor_id = %actor_id, signal = %request.signal, submitted_by = %auth.key_name, "external risk signal");
    state
        .risk
        .evaluate(auth.tenant_id, actor_id, request.signal, request.payload)
        .await?;
    Ok(Json(state.risk.profile(auth.tenant_id, actor_id).await?))
}

pub async fn job_heartbeats(State(state): State<AppState>) -> Result<Json<Vec<JobHeartbeat>>, AppError> {
    Ok(Json(state.scheduler.heartbeats().await?))
}

pub async fn run_job(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(name): Path<String>,
) -> Result<Json<JobHeartbeat>, AppError> {
    tracing::info!(job = %name, requested_by = %auth.key_name, "manual job run");
    Ok(Json(state.scheduler.run_named(&name).await?))
}
