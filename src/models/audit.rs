//! Forensic trail: an immutable before/after record for every Payment or Refund change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

text_enum! {
    /// What caused a state change.
    pub enum AuditSource {
        Command => "COMMAND",
        Cashier => "CASHIER",
        Webhook => "WEBHOOK",
        Reconciliation => "RECONCILIATION",
        Timeout => "TIMEOUT",
        Admin => "ADMIN",
    }
}

text_enum! {
    pub enum AuditEntity {
        Payment => "PAYMENT",
        Refund => "REFUND",
    }
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize, Deserialize)]
pub struct PaymentAuditSnapshot {
    pub id: Uuid,
    pub entity_type: AuditEntity,
    pub entity_id: Uuid,
    pub payment_id: Uuid,
    pub tenant_id: Uuid,
    pub before_status: Option<String>,
    pub after_status: String,
    pub before_snapshot: Option<serde_json::Value>,
    pub after_snapshot: serde_json::Value,
    pub source: AuditSource,
    pub operator: Option<String>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Who and why, attached to a unit of work.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditContext {
    pub source: AuditSource,
    pub operator: Option<String>,
    pub reason: Option<String>,
}

impl AuditContext {
    pub fn new(source: AuditSource) -> Self {
        Self {
            source,
            operator: None,
            reason: None,
        }
    }

    pub fn operator(mut self, operator: impl Into<String>) -> Self {
        self.operator = Some(operator.into());
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

impl PaymentAuditSnapshot {
    /// Build a snapshot from serialisable before/after entities.
    #[allow(clippy::too_many_arguments)]
    pub fn record<T: Serialize>(
        entity_type: AuditEntity,
        entity_id: Uuid,
        payment_id: Uuid,
        tenant_id: Uuid,
        before: Option<(&str, &T)>,
        after: (&str, &T),
        audit: &AuditContext,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_type,
            entity_id,
            payment_id,
            tenant_id,
            before_status: before.map(|(status, _)| status.to_string()),
            after_status: after.0.to_string(),
            before_snapshot: before.map(|(_, entity)| to_json(entity)),
            after_snapshot: to_json(after.1),
            source: audit.source,
            operator: audit.operator.clone(),
            reason: audit.reason.clone(),
            created_at: at,
        }
    }
}

fn to_json<T: Serialize>(entity: &T) -> serde_json::Value {
    serde_json::to_value(entity).unwrap_or(serde_json::Value::Null)
}
