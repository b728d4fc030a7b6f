//! Refund data models and API request types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

text_enum! {
    pub enum RefundStatus {
        Requested => "REQUESTED",
        Processing => "PROCESSING",
        Completed => "COMPLETED",
        Failed => "FAILED",
        Cancelled => "CANCELLED",
    }
}

impl RefundStatus {
    /// Refunds in these states count against the refundable balance of the payment.
    pub fn holds_balance(self) -> bool {
        matches!(
            self,
            RefundStatus::Requested | RefundStatus::Processing | RefundStatus::Completed
        )
    }
}

/// Represents a refund record from the database.
///
/// # Invariant
///
/// The sum of `COMPLETED` refunds for a payment never exceeds the payment amount.
/// Creation already refuses any refund that would push outstanding refunds past it.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize, Deserialize)]
pub struct Refund {
    pub id: Uuid,
    pub payment_id: Uuid,
    pub order_id: Uuid,
    pub tenant_id: Uuid,
    pub store_id: Uuid,
    pub actor_id: Uuid,
    pub amount: i64,
    pub currency: String,
    pub status: RefundStatus,
    pub reason: String,
    pub requested_by: String,

    /// Set when the actor was under manual review at request time.
    pub requires_approval: bool,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,

    pub provider: String,
    pub provider_ref: Option<String>,
    pub failure_reason: Option<String>,
    pub snapshot: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

/// Request to refund (part of) a payment.
///
/// # JSON Example
///
/// ```json
/// {
///   "amount": 400,
///   "reason": "item missing",
///   "requested_by": "support:alice"
/// }
/// ```
#[derive(Debug, Deserialize)]
pub struct CreateRefundRequest {
    pub amount: i64,
    pub reason: String,
    pub requested_by: String,
}

/// Admin request to reject a refund waiting for approval.
#[derive(Debug, Deserialize)]
pub struct RejectRefundRequest {
    pub reason: String,
}
