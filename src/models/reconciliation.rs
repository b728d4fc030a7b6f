//! Settlement-report reconciliation models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One transaction line of a provider settlement statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementLine {
    pub provider_ref: String,
    pub amount: i64,
    pub currency: String,
}

/// Statement supplied by a provider for a closed period.
///
/// # JSON Example
///
/// ```json
/// {
///   "provider": "card",
///   "period_start": "2026-10-18T00:00:00Z",
///   "period_end": "2026-10-19T00:00:00Z",
///   "payments": [{"provider_ref": "pi_1", "amount": 1000, "currency": "USD"}],
///   "refunds": []
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementReport {
    pub provider: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    #[serde(default)]
    pub payments: Vec<SettlementLine>,
    #[serde(default)]
    pub refunds: Vec<SettlementLine>,
}

/// Persisted result of comparing local totals with a settlement statement.
///
/// Variances are `local - provider`.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize, Deserialize)]
pub struct SettlementReconciliation {
    pub id: Uuid,
    pub provider: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub local_payment_count: i64,
    pub local_payment_total: i64,
    pub provider_payment_count: i64,
    pub provider_payment_total: i64,
    pub payment_count_variance: i64,
    pub payment_amount_variance: i64,
    pub local_refund_count: i64,
    pub local_refund_total: i64,
    pub provider_refund_count: i64,
    pub provider_refund_total: i64,
    pub refund_count_variance: i64,
    pub refund_amount_variance: i64,
    pub net_variance: i64,
    pub missing_locally: Vec<String>,
    pub missing_at_provider: Vec<String>,
    pub has_discrepancy: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct ReconciliationQuery {
    pub provider: Option<String>,
    pub limit: Option<i64>,
}
