//! Client command idempotency records.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Stored outcome of a command, unique per `(tenant_id, key, route)`.
///
/// `status_code` is `None` while the first request is still executing. Until then
/// `expires_at` is a short lease; completion extends it to the retention period.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize)]
pub struct IdempotencyRecord {
    pub tenant_id: Uuid,
    pub key: String,
    pub route: String,
    pub request_hash: String,
    pub status_code: Option<i32>,
    pub response_body: Option<String>,
    pub entity_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewIdempotencyClaim {
    pub tenant_id: Uuid,
    pub key: String,
    pub route: String,
    pub request_hash: String,
    pub now: DateTime<Utc>,
    /// End of the in-progress lease.
    pub expires_at: DateTime<Utc>,
}

/// Result of trying to claim a key.
#[derive(Debug, Clone, PartialEq)]
pub enum IdempotencyClaim {
    /// First use, or the previous record or lease had expired: execute the command.
    Claimed,
    /// Replay: return the stored response verbatim.
    Completed(IdempotencyRecord),
    /// The first request with this key has not finished yet.
    InProgress,
    /// Same key, different request body.
    PayloadMismatch,
}

/// Response to store against a claimed key.
#[derive(Debug, Clone)]
pub struct IdempotencyCompletion {
    pub status_code: i32,
    pub response_body: String,
    pub entity_id: Option<Uuid>,
    pub at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}
