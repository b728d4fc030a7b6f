//! Orders and store locations.
//!
//! Both are owned by order management. The payment engine reads them and writes
//! only `orders.status`, always inside the same transaction as the payment change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::payment::PaymentStatus;

text_enum! {
    pub enum OrderStatus {
        PendingPayment => "PENDING_PAYMENT",
        Paid => "PAID",
        PaymentFailed => "PAYMENT_FAILED",
        Cancelled => "CANCELLED",
        PartiallyRefunded => "PARTIALLY_REFUNDED",
        Refunded => "REFUNDED",
    }
}

impl OrderStatus {
    pub fn is_payable(self) -> bool {
        matches!(self, OrderStatus::PendingPayment | OrderStatus::PaymentFailed)
    }

    /// Order status that mirrors a payment status after a successful transition.
    pub fn mirroring(status: PaymentStatus) -> OrderStatus {
        match status {
            PaymentStatus::Pending | PaymentStatus::Retrying => OrderStatus::PendingPayment,
            PaymentStatus::Paid => OrderStatus::Paid,
            PaymentStatus::Failed => OrderStatus::PaymentFailed,
            PaymentStatus::PartiallyRefunded => OrderStatus::PartiallyRefunded,
            PaymentStatus::Refunded => OrderStatus::Refunded,
            PaymentStatus::Cancelled => OrderStatus::Cancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub store_id: Uuid,
    pub actor_id: Uuid,
    pub total_amount: i64,
    pub currency: String,
    pub status: OrderStatus,

    /// Priced line items as resolved by order management; copied into the audit trail.
    pub pricing: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize, Deserialize)]
pub struct StoreLocation {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub is_online: bool,
}
