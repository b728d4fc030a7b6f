//! Idempotency-Key enforcement for money-moving commands.
//!
//! Runs after authentication on every command route:
//! 1. Require the `Idempotency-Key` header
//! 2. Claim `(tenant, key, "METHOD path")` bound to the body hash
//! 3. Replay a stored response verbatim with `Idempotent-Replayed: true`
//! 4. Otherwise run the handler and store its response (< 500); release the claim on 5xx
//!    or when the response cannot be stored
//!
//! An unfinished claim is a short lease (`IDEMPOTENCY_LOCK_SECONDS`), so a request that
//! never finishes (dropped connection, panic) blocks its key only until the lease lapses.

use axum::{
    body::{Body, to_bytes},
    extract::{Request, State},
    http::{HeaderValue, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use uuid::Uuid;

use crate::{
    AppState, error::AppError, middleware::auth::AuthContext, models::idempotency::IdempotencyClaim,
};

pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";
pub const REPLAYED_HEADER: &str = "Idempotent-Replayed";

const MAX_BODY_BYTES: usize = 1024 * 1024;

fn entity_id(body: &[u8]) -> Option<Uuid> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    value.get("id")?.as_str()?.parse().ok()
}

pub async fn idempotency_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let tenant_id = request
        .extensions()
        .get::<AuthContext>()
        .map(|auth| auth.tenant_id)
        .ok_or(AppError::InvalidApiKey)?;
    let key = request
        .headers()
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .ok_or(AppError::MissingIdempotencyKey)?;
    let route = format!("{} {}", request.method(), request.uri().path());

    let (parts, body) = request.into_parts();
    let body = to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|err| AppError::InvalidRequest(format!("unreadable request body: {err}")))?;

    match state.idempotency.claim(tenant_id, &key, &route, &body).await? {
        IdempotencyClaim::Claimed => {}
        IdempotencyClaim::Completed(record) => {
            tracing::info!(route = %route, "replaying stored command response");
            let status = record
                .status_code
                .and_then(|code| u16::try_from(code).ok())
                .and_then(|code| StatusCode::from_u16(code).ok())
                .unwrap_or(StatusCode::OK);
            let mut response = (status, record.response_body.unwrap_or_default()).into_response();
            let headers = response.headers_mut();
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
            headers.insert(REPLAYED_HEADER, HeaderValue::from_static("true"));
            return Ok(response);
        }
        IdempotencyClaim::InProgress => return Err(AppError::IdempotencyKeyInUse),
        IdempotencyClaim::PayloadMismatch => return Err(AppError::IdempotencyKeyReused),
    }

    let response = next.run(Request::from_parts(parts, Body::from(body))).await;
    let status = response.status();

    if status.is_server_error() {
        state.idempotency.release(tenant_id, &key, &route).await?;
        return Ok(response);
    }

    let (parts, body) = response.into_parts();
    let body = to_bytes(body, usize::MAX)
        .await
        .map_err(|err| AppError::Internal(format!("unreadable response body: {err}")))?;
    let stored = state
        .idempotency
        .complete(
            tenant_id,
            &key,
            &route,
            status.as_u16(),
            String::from_utf8_lossy(&body).into_owned(),
            entity_id(&body),
        )
        .await;
    if let Err(err) = stored {
        tracing::error!(route = %route, error = %err, "failed to store command response, releasing key");
        if let Err(err) = state.idempotency.release(tenant_id, &key, &route).await {
            tracing::error!(route = %route, error = %err, "failed to release idempotency key");
        }
    }
    Ok(Response::from_parts(parts, Body::from(body)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_id_reads_top_level_id() {
        let id = Uuid::new_v4();
        let body = serde_json::json!({ "id": id, "status": "PENDING" }).to_string();
        assert_eq!(entity_id(body.as_bytes()), Some(id));
        assert_eq!(entity_id(br#"{"error":{"code":"X"}}"#), None);
    }
}
