//! Inbound provider webhook endpoint.
//!
//! `POST /webhooks/{provider}` takes the raw body so the signature is checked over the
//! exact bytes the provider signed. It is not behind API key authentication; the
//! provider signature is the credential.

use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
};

use crate::{AppState, error::AppError, models::webhook::WebhookAck};

/// Receive one provider delivery.
///
/// # Response
///
/// 200 once the event is durably recorded, whatever processing concluded:
///
/// ```json
/// { "status": "processed", "event_id": "9b2f..." }
/// ```
///
/// `status` is one of `processed`, `duplicate`, `ignored`, `queued` (dead-lettered for
/// retry) or `rejected` (integrity failure, alerted).
///
/// # Errors
///
/// - 401 `WEBHOOK_SIGNATURE_INVALID`: missing or bad signature, nothing is recorded
/// - 400 `MALFORMED_WEBHOOK` / `UNSUPPORTED_PROVIDER`
pub async fn receive_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, AppError> {
    let header = state.webhooks.signature_header(&provider)?;
    let signature = headers.get(header).and_then(|value| value.to_str().ok());

    let ack = state.webhooks.ingest(&provider, signature, &body).await?;
    Ok(Json(ack))
}
