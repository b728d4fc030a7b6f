//! Payment data models and API request/response types.
//!
//! This module defines:
//! - `Payment`: database entity representing one payment attempt for an order
//! - `PaymentStatus` / `PaymentFlow`: the lifecycle vocabulary
//! - request and response bodies for the payment command endpoints

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

text_enum! {
    /// Payment lifecycle states. Legal moves live in [`crate::state_machine`].
    pub enum PaymentStatus {
        Pending => "PENDING",
        Paid => "PAID",
        Failed => "FAILED",
        Retrying => "RETRYING",
        PartiallyRefunded => "PARTIALLY_REFUNDED",
        Refunded => "REFUNDED",
        Cancelled => "CANCELLED",
    }
}

impl PaymentStatus {
    /// A live payment blocks creation of another payment for the same order.
    pub fn is_live(self) -> bool {
        matches!(self, PaymentStatus::Pending | PaymentStatus::Retrying)
    }

    pub fn is_terminal(self) -> bool {
        crate::state_machine::payment_targets(self).is_empty()
    }

    pub fn is_refundable(self) -> bool {
        matches!(self, PaymentStatus::Paid | PaymentStatus::PartiallyRefunded)
    }
}

text_enum! {
    /// How the money moves: through an external provider, or handed to a cashier.
    pub enum PaymentFlow {
        Provider => "PROVIDER",
        Cashier => "CASHIER",
    }
}

/// Provider name recorded on cashier payments.
pub const CASH_PROVIDER: &str = "cash";

/// Represents a payment record from the database.
///
/// # Database Table
///
/// Maps to the `payments` table. Amounts are stored in minor units (cents) as `i64`.
/// At most one payment per order may be live (`PENDING`/`RETRYING`) at a time; the
/// table enforces this with a partial unique index.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub store_id: Uuid,
    pub order_id: Uuid,

    /// The paying customer; subject of the risk policy.
    pub actor_id: Uuid,

    pub amount: i64,
    pub currency: String,
    pub flow: PaymentFlow,
    pub provider: String,

    /// External transaction / intent identifier at the provider.
    pub provider_ref: Option<String>,

    /// Resumable handshake token handed to the client (card intents only).
    pub client_secret: Option<String>,

    pub status: PaymentStatus,
    pub failure_code: Option<String>,
    pub failure_reason: Option<String>,
    pub retries: i32,
    pub max_retries: i32,
    pub last_retry_at: Option<DateTime<Utc>>,

    /// Only set for the PROVIDER flow.
    pub expires_at: Option<DateTime<Utc>>,

    /// Confirm-in-progress lock. A stale lock (older than the lock TTL) is free to take.
    pub locked_at: Option<DateTime<Utc>>,

    /// Last raw provider payload.
    pub snapshot: Option<serde_json::Value>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub voided_at: Option<DateTime<Utc>>,
    pub corrected_at: Option<DateTime<Utc>>,
}

impl Payment {
    /// True once a PROVIDER-flow intent has passed its expiry.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    /// A live payment that has not expired yet.
    pub fn is_open_intent(&self, now: DateTime<Utc>) -> bool {
        self.status.is_live() && !self.is_expired(now)
    }
}

/// Request to start a provider payment for an order.
///
/// # JSON Example
///
/// ```json
/// {
///   "order_id": "550e8400-e29b-41d4-a716-446655440000",
///   "provider": "card",
///   "actor_id": "660e8400-e29b-41d4-a716-446655440001"
/// }
/// ```
#[derive(Debug, Deserialize)]
pub struct StartPaymentRequest {
    pub order_id: Uuid,
    pub provider: String,
    pub actor_id: Uuid,
}

/// Request to open a cashier (cash-drawer) payment.
#[derive(Debug, Deserialize)]
pub struct StartCashierPaymentRequest {
    pub order_id: Uuid,
    pub actor_id: Uuid,
}

/// Request to void a pending payment.
#[derive(Debug, Deserialize)]
pub struct VoidPaymentRequest {
    pub reason: String,
}

/// Admin request to force a payment into a different state.
#[derive(Debug, Deserialize)]
pub struct OverridePaymentRequest {
    pub status: PaymentStatus,
    pub reason: String,
}

/// Response body for payment endpoints.
///
/// The provider snapshot and lock timestamp are internal and never returned.
#[derive(Debug, Serialize, Deserialize)]
pub struct PaymentResponse {
    pub id: Uuid,
    pub order_id: Uuid,
    pub amount: i64,
    pub currency: String,
    pub flow: PaymentFlow,
    pub provider: String,
    pub provider_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    pub status: PaymentStatus,
    pub failure_code: Option<String>,
    pub failure_reason: Option<String>,
    pub retries: i32,
    pub max_retries: i32,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Payment> for PaymentResponse {
    fn from(payment: Payment) -> Self {
        // The handshake token is only useful while the intent can still be completed
        let client_secret = if payment.status == PaymentStatus::Pending {
            payment.client_secret
        } else {
            None
        };

        Self {
            id: payment.id,
            order_id: payment.order_id,
            amount: payment.amount,
            currency: payment.currency,
            flow: payment.flow,
            provider: payment.provider,
            provider_ref: payment.provider_ref,
            client_secret,
            status: payment.status,
            failure_code: payment.failure_code,
            failure_reason: payment.failure_reason,
            retries: payment.retries,
            max_retries: payment.max_retries,
            expires_at: payment.expires_at,
            created_at: payment.created_at,
            updated_at: payment.updated_at,
        }
    }
}
