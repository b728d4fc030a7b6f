//! Domain events written to the transactional outbox.
//!
//! Events are appended in the same transaction as the state change that caused
//! them, so each fact is emitted exactly once. The outbox relay publishes them to
//! in-process subscribers (notifications, metrics, inventory, ledger).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

text_enum! {
    pub enum EventKind {
        PaymentIntentCreated => "PAYMENT_INTENT_CREATED",
        PaymentConfirmed => "PAYMENT_CONFIRMED",
        PaymentFailed => "PAYMENT_FAILED",
        PaymentCancelled => "PAYMENT_CANCELLED",
        PaymentRetrying => "PAYMENT_RETRYING",
        PaymentCorrected => "PAYMENT_CORRECTED",
        PaymentRefundStatusChanged => "PAYMENT_REFUND_STATUS_CHANGED",
        RefundRequested => "REFUND_REQUESTED",
        RefundCompleted => "REFUND_COMPLETED",
        RefundFailed => "REFUND_FAILED",
        RefundCancelled => "REFUND_CANCELLED",
        InventoryReleaseRequested => "INVENTORY_RELEASE_REQUESTED",
        AlertRaised => "ALERT_RAISED",
    }
}

text_enum! {
    pub enum AlertSeverity {
        Warning => "WARNING",
        Critical => "CRITICAL",
    }
}

text_enum! {
    pub enum AlertKind {
        DeadLetterAbandoned => "DEAD_LETTER_ABANDONED",
        WebhookIntegrity => "WEBHOOK_INTEGRITY",
        SettlementDiscrepancy => "SETTLEMENT_DISCREPANCY",
        RiskThresholdCrossed => "RISK_THRESHOLD_CROSSED",
        JobFailing => "JOB_FAILING",
    }
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize, Deserialize)]
pub struct DomainEvent {
    pub id: Uuid,
    pub kind: EventKind,
    pub tenant_id: Option<Uuid>,
    pub aggregate_id: Option<Uuid>,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

/// Event waiting to be appended by a unit of work.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDomainEvent {
    pub kind: EventKind,
    pub tenant_id: Option<Uuid>,
    pub aggregate_id: Option<Uuid>,
    pub payload: serde_json::Value,
}

impl NewDomainEvent {
    pub fn new(kind: EventKind, tenant_id: Uuid, aggregate_id: Uuid, payload: serde_json::Value) -> Self {
        Self {
            kind,
            tenant_id: Some(tenant_id),
            aggregate_id: Some(aggregate_id),
            payload,
        }
    }

    /// An alert-worthy fact for operators. Rendering and delivery happen elsewhere.
    pub fn alert(
        severity: AlertSeverity,
        kind: AlertKind,
        message: impl Into<String>,
        context: serde_json::Value,
    ) -> Self {
        Self {
            kind: EventKind::AlertRaised,
            tenant_id: None,
            aggregate_id: None,
            payload: json!({
                "severity": severity,
                "alert": kind,
                "message": message.into(),
                "context": context,
            }),
        }
    }

    pub fn into_event(self, at: DateTime<Utc>) -> DomainEvent {
        DomainEvent {
            id: Uuid::new_v4(),
            kind: self.kind,
            tenant_id: self.tenant_id,
            aggregate_id: self.aggregate_id,
            payload: self.payload,
            created_at: at,
            published_at: None,
        }
    }
}
