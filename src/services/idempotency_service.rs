//! Client command idempotency.
//!
//! A key is scoped to `(tenant, key, route)` and bound to the SHA-256 of the request
//! body. The storage claim is a unique-constraint insert, so two concurrent requests
//! with the same key can never both execute.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::PaymentSettings;
use crate::error::AppError;
use crate::models::idempotency::{IdempotencyClaim, IdempotencyCompletion, NewIdempotencyClaim};
use crate::store::Store;

/// Longest key accepted from a client.
pub const MAX_KEY_LEN: usize = 255;

/// Hex SHA-256 of a request body.
pub fn request_hash(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

#[derive(Clone)]
pub struct IdempotencyService {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    settings: PaymentSettings,
}

impl IdempotencyService {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, settings: PaymentSettings) -> Self {
        Self { store, clock, settings }
    }

    /// Claim a key for one request.
    ///
    /// # Errors
    ///
    /// - `INVALID_REQUEST`: empty or oversized key
    pub async fn claim(
        &self,
        tenant_id: Uuid,
        key: &str,
        route: &str,
        body: &[u8],
    ) -> Result<IdempotencyClaim, AppError> {
        if key.trim().is_empty() || key.len() > MAX_KEY_LEN {
            return Err(AppError::InvalidRequest(format!(
                "Idempotency-Key must be 1 to {MAX_KEY_LEN} characters"
            )));
        }

        let now = self.clock.now();
        self.store
            .claim_idempotency_key(NewIdempotencyClaim {
                tenant_id,
                key: key.to_string(),
                route: route.to_string(),
                request_hash: request_hash(body),
                now,
                expires_at: now + self.settings.idempotency_lock_ttl,
            })
            .await
    }

    pub async fn complete(
        &self,
        tenant_id: Uuid,
        key: &str,
        route: &str,
        status_code: u16,
        response_body: String,
        entity_id: Option<Uuid>,
    ) -> Result<(), AppError> {
        let now = self.clock.now();
        self.store
            .complete_idempotency_key(
                tenant_id,
                key,
                route,
                IdempotencyCompletion {
                    status_code: i32::from(status_code),
                    response_body,
                    entity_id,
                    at: now,
                    expires_at: now + self.settings.idempotency_ttl,
                },
            )
            .await
    }

    pub async fn release(&self, tenant_id: Uuid, key: &str, route: &str) -> Result<(), AppError> {
        self.store.release_idempotency_key(tenant_id, key, route).await
    }

    /// Delete expired records. Returns how many were removed.
    pub async fn purge_expired(&self) -> Result<u64, AppError> {
        self.store.purge_idempotency_keys(self.clock.now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_hash_is_stable_hex() {
        let a = request_hash(br#"{"order_id":"1"}"#);
        assert_eq!(a.len(), 64);
        assert_eq!(a, request_hash(br#"{"order_id":"1"}"#));
        assert_ne!(a, request_hash(br#"{"order_id":"2"}"#));
    }
}
