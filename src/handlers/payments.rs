//! Payment command HTTP handlers.
//!
//! This module implements the client payment endpoints:
//! - POST /api/v1/payments - Start a provider payment for an order
//! - POST /api/v1/payments/cashier - Open a cashier payment
//! - GET /api/v1/payments/{id} - Get payment details
//! - POST /api/v1/payments/{id}/confirm - Confirm against the provider
//! - POST /api/v1/payments/{id}/retry - Retry a failed payment
//! - POST /api/v1/payments/{id}/void - Void a pending payment
//!
//! Every POST here sits behind the idempotency middleware.

use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use crate::{
    AppState,
    error::AppError,
    middleware::auth::AuthContext,
    models::payment::{
        PaymentResponse, StartCashierPaymentRequest, StartPaymentRequest, VoidPaymentRequest,
    },
};

fn created_or_ok(created: bool) -> StatusCode {
    if created { StatusCode::CREATED } else { StatusCode::OK }
}

/// Start a provider payment.
///
/// # Request Body
///
/// ```json
/// {
///   "order_id": "550e8400-...",
///   "provider": "card",
///   "actor_id": "660e8400-..."
/// }
/// ```
///
/// # Response
///
/// 201 with the new `PENDING` payment, or 200 with the order's still-open intent.
/// `client_secret` is present for card intents.
pub async fn start_payment(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(request): Json<StartPaymentRequest>,
) -> Result<impl IntoResponse, AppError> {
    let (payment, created) = state.payments.start_payment(auth.tenant_id, request).await?;
    Ok((created_or_ok(created), Json(PaymentResponse::from(payment))))
}

/// Open a cashier payment, confirmed later by the operator.
pub async fn start_cashier_payment(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(request): Json<StartCashierPaymentRequest>,
) -> Result<impl IntoResponse, AppError> {
    let (payment, created) = state
        .payments
        .start_cashier_payment(auth.tenant_id, request)
        .await?;
    Ok((created_or_ok(created), Json(PaymentResponse::from(payment))))
}

/// Get payment details.
///
/// # Errors
///
/// Returns 404 `PAYMENT_NOT_FOUND` for unknown ids and for another tenant's payments.
pub async fn get_payment(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<PaymentResponse>, AppError> {
    let payment = state.payments.get_payment(auth.tenant_id, id).await?;
    Ok(Json(payment.into()))
}

pub async fn confirm_payment(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<PaymentResponse>, AppError> {
    let payment = state
        .payments
        .confirm_payment(auth.tenant_id, id, &auth.key_name)
        .await?;
    Ok(Json(payment.into()))
}

/// Retry a failed payment.
///
/// # Errors
///
/// - 422 `MAX_RETRIES_EXCEEDED`: retry budget spent, the provider is not called
/// - 429 `RETRY_COOLDOWN_ACTIVE`: the previous retry was too recent
/// - 423 `PAYMENT_LOCKED_BY_RISK_POLICY`
pub async fn retry_payment(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<PaymentResponse>, AppError> {
    let payment = state
        .payments
        .retry_failed_payment(auth.tenant_id, id, &auth.key_name)
        .await?;
    Ok(Json(payment.into()))
}

pub async fn void_payment(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
    Json(request): Json<VoidPaymentRequest>,
) -> Result<Json<PaymentResponse>, AppError> {
    let payment = state
        .payments
        .void_payment(auth.tenant_id, id, &request.reason, &auth.key_name)
        .await?;
    Ok(Json(payment.into()))
}
