//! Refund HTTP handlers.
//!
//! - POST /api/v1/payments/{id}/refunds - Request a refund (idempotent)
//! - GET /api/v1/payments/{id}/refunds - List a payment's refunds
//! - GET /api/v1/refunds/{id} - Get refund details

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
    models::refund::{CreateRefundRequest, Refund},
};

/// Request a refund.
///
/// # Request Body
///
/// ```json
/// {
///   "amount": 400,
///   "reason": "item missing",
///   "requested_by": "support:alice"
/// }
/// ```
///
/// # Response (201)
///
/// The refund as stored. When the customer is under manual review it stays
/// `REQUESTED` with `requires_approval: true` until an admin approves it.
pub async fn request_refund(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(payment_id): Path<Uuid>,
    Json(request): Json<CreateRefundRequest>,
) -> Result<impl IntoResponse, AppError> {
    let refund = state
        .refunds
        .request_refund(auth.tenant_id, payment_id, request)
        .await?;
    Ok((StatusCode::CREATED, Json(refund)))
}

pub async fn list_refunds(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(payment_id): Path<Uuid>,
) -> Result<Json<Vec<Refund>>, AppError> {
    Ok(Json(state.refunds.list_refunds(auth.tenant_id, payment_id).await?))
}

pub async fn get_refund(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<Refund>, AppError> {
    Ok(Json(state.refunds.get_refund(auth.tenant_id, id).await?))
}
