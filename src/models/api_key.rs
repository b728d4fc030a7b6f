//! API Key model for authentication.
//!
//! API keys authenticate tenants calling the payment API. They are stored as SHA-256
//! hashes; the plaintext key is never persisted.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Represents an API key record from the database.
///
/// # Database Table
///
/// Maps to the `api_keys` table with columns:
/// - `id`: Unique identifier (UUID)
/// - `tenant_id`: Tenant every request made with this key is scoped to
/// - `key_hash`: SHA-256 hash of the actual API key
/// - `key_name`: Human-readable label, recorded as the operator in audit trails
/// - `is_admin`: Whether the key may use the admin surface
/// - `is_active`: Whether the key is currently valid
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ApiKey {
    pub id: Uuid,
    pub tenant_id: Uuid,

    /// SHA-256 hash of the actual API key (64 hex characters)
    pub key_hash: String,

    pub key_name: String,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,

    /// Inactive keys are rejected during authentication.
    pub is_active: bool,
}
