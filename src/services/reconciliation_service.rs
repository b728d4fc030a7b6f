//! Reconciliation against provider-held state.
//!
//! - Polling: live payments that went quiet are looked up one by one and moved exactly
//!   as a webhook would move them, audited as reconciliation-sourced. Refunds stuck in
//!   `PROCESSING` are polled the same way.
//! - Expiry: intents past their deadline are settled or timed out.
//! - Settlement: local totals for a closed period are compared with the provider's
//!   statement and the result is persisted.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde_json::json;
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::PaymentSettings;
use crate::error::AppError;
use crate::models::events::{AlertKind, AlertSeverity, NewDomainEvent};
use crate::models::payment::Payment;
use crate::models::reconciliation::{SettlementReconciliation, SettlementReport};
use crate::models::refund::Refund;
use crate::providers::{ProviderErrorCode, ProviderRegistry};
use crate::services::payment_service::PaymentService;
use crate::services::refund_service::RefundService;
use crate::store::Store;

/// Result of one polling pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub checked: usize,
    pub updated: usize,
    pub failed: usize,
}

/// The UTC day before the one containing `now`, as `[start, end)`.
pub fn previous_day(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let end = now.date_naive().and_time(NaiveTime::MIN).and_utc();
    (end - Duration::days(1), end)
}

/// Compare local settled payments and completed refunds with a provider statement.
///
/// Variances are `local - provider`. A discrepancy is any amount variance beyond
/// `tolerance`, or a provider reference present on only one side.
pub fn compare_settlement(
    report: &SettlementReport,
    payments: &[Payment],
    refunds: &[Refund],
    tolerance: i64,
    at: DateTime<Utc>,
) -> SettlementReconciliation {
    let local_payment_total: i64 = payments.iter().map(|p| p.amount).sum();
    let local_refund_total: i64 = refunds.iter().map(|r| r.amount).sum();
    let provider_payment_total: i64 = report.payments.iter().map(|l| l.amount).sum();
    let provider_refund_total: i64 = report.refunds.iter().map(|l| l.amount).sum();

    let local_refs: HashSet<&str> = payments
        .iter()
        .filter_map(|p| p.provider_ref.as_deref())
        .chain(refunds.iter().filter_map(|r| r.provider_ref.as_deref()))
        .collect();
    let provider_refs: HashSet<&str> = report
        .payments
        .iter()
        .chain(report.refunds.iter())
        .map(|l| l.provider_ref.as_str())
        .collect();

    let mut missing_locally: Vec<String> = provider_refs
        .difference(&local_refs)
        .map(|r| r.to_string())
        .collect();
    let mut missing_at_provider: Vec<String> = local_refs
        .difference(&provider_refs)
        .map(|r| r.to_string())
        .collect();
    missing_locally.sort();
    missing_at_provider.sort();

    let payment_amount_variance = local_payment_total - provider_payment_total;
    let refund_amount_variance = local_refund_total - provider_refund_total;
    let net_variance = payment_amount_variance - refund_amount_variance;

    let has_discrepancy = payment_amount_variance.abs() > tolerance
        || refund_amount_variance.abs() > tolerance
        || net_variance.abs() > tolerance
        || !missing_locally.is_empty()
        || !missing_at_provider.is_empty();

    SettlementReconciliation {
        id: Uuid::new_v4(),
        provider: report.provider.clone(),
        period_start: report.period_start,
        period_end: report.period_end,
        local_payment_count: payments.len() as i64,
        local_payment_total,
        provider_payment_count: report.payments.len() as i64,
        provider_payment_total,
        payment_count_variance: payments.len() as i64 - report.payments.len() as i64,
        payment_amount_variance,
        local_refund_count: refunds.len() as i64,
        local_refund_total,
        provider_refund_count: report.refunds.len() as i64,
        provider_refund_total,
        refund_count_variance: refunds.len() as i64 - report.refunds.len() as i64,
        refund_amount_variance,
        net_variance,
        missing_locally,
        missing_at_provider,
        has_discrepancy,
        created_at: at,
    }
}

#[derive(Clone)]
pub struct ReconciliationService {
    store: Arc<dyn Store>,
    providers: ProviderRegistry,
    payments: PaymentService,
    refunds: RefundService,
    clock: Arc<dyn Clock>,
    settings: PaymentSettings,
}

impl ReconciliationService {
    pub fn new(
        store: Arc<dyn Store>,
        providers: ProviderRegistry,
        payments: PaymentService,
        refunds: RefundService,
        clock: Arc<dyn Clock>,
        settings: PaymentSettings,
    ) -> Self {
        Self {
            store,
            providers,
            payments,
            refunds,
            clock,
            settings,
        }
    }

    /// Look up every live payment not updated within the staleness threshold.
    pub async fn reconcile_stale_payments(&self, limit: i64) -> Result<PollSummary, AppError> {
        let updated_before = self.clock.now() - self.settings.stale_after;
        let stale = self.store.list_stale_payments(updated_before, limit).await?;

        let mut summary = PollSummary {
            checked: stale.len(),
            ..PollSummary::default()
        };
        for payment in &stale {
            match self.payments.reconcile_payment(payment).await {
                Ok(true) => {
                    tracing::info!(payment_id = %payment.id, "payment reconciled from provider status");
                    summary.updated += 1;
                }
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(payment_id = %payment.id, error = %err, "payment reconciliation failed");
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }

    /// Look up every `PROCESSING` refund not updated within the staleness threshold.
    pub async fn reconcile_stale_refunds(&self, limit: i64) -> Result<PollSummary, AppError> {
        let updated_before = self.clock.now() - self.settings.stale_after;
        let stale = self.store.list_stale_refunds(updated_before, limit).await?;

        let mut summary = PollSummary {
            checked: stale.len(),
            ..PollSummary::default()
        };
        for refund in &stale {
            match self.refunds.reconcile_refund(refund).await {
                Ok(true) => summary.updated += 1,
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(refund_id = %refund.id, error = %err, "refund reconciliation failed");
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }

    /// Settle every intent whose expiry has passed. Returns how many were processed.
    pub async fn expire_intents(&self, limit: i64) -> Result<usize, AppError> {
        let expired = self.store.list_expired_intents(self.clock.now(), limit).await?;
        let mut processed = 0;
        for payment in &expired {
            match self.payments.expire_intent(payment).await {
                Ok(_) => processed += 1,
                Err(err) => {
                    tracing::warn!(payment_id = %payment.id, error = %err, "intent expiry failed");
                }
            }
        }
        Ok(processed)
    }

    /// Reconcile a supplied statement and persist the result.
    ///
    /// # Errors
    ///
    /// - `UNSUPPORTED_PROVIDER` for an unknown provider
    /// - `INVALID_REQUEST` for an empty or inverted period
    pub async fn reconcile_settlement(&self, report: SettlementReport) -> Result<SettlementReconciliation, AppError> {
        self.providers.get(&report.provider)?;
        if report.period_start >= report.period_end {
            return Err(AppError::InvalidRequest("period_start must be before period_end".to_string()));
        }

        let payments = self
            .store
            .list_settled_payments(&report.provider, report.period_start, report.period_end)
            .await?;
        let refunds = self
            .store
            .list_completed_refunds(&report.provider, report.period_start, report.period_end)
            .await?;

        let reconciliation = compare_settlement(
            &report,
            &payments,
            &refunds,
            self.settings.settlement_tolerance_minor,
            self.clock.now(),
        );

        let mut events = Vec::new();
        if reconciliation.has_discrepancy {
            tracing::error!(
                provider = %reconciliation.provider,
                net_variance = reconciliation.net_variance,
                missing_locally = reconciliation.missing_locally.len(),
                missing_at_provider = reconciliation.missing_at_provider.len(),
                "settlement discrepancy"
            );
            events.push(NewDomainEvent::alert(
                AlertSeverity::Warning,
                AlertKind::SettlementDiscrepancy,
                format!(
                    "{} settlement for {} differs by {}",
                    reconciliation.provider,
                    reconciliation.period_start.date_naive(),
                    reconciliation.net_variance
                ),
                json!({
                    "reconciliation_id": reconciliation.id,
                    "provider": reconciliation.provider,
                    "payment_amount_variance": reconciliation.payment_amount_variance,
                    "refund_amount_variance": reconciliation.refund_amount_variance,
                    "missing_locally": reconciliation.missing_locally,
                    "missing_at_provider": reconciliation.missing_at_provider,
                }),
            ));
        } else {
            tracing::info!(provider = %reconciliation.provider, "settlement reconciled");
        }

        self.store
            .record_reconciliation(reconciliation.clone(), events)
            .await?;
        Ok(reconciliation)
    }

    /// Fetch the provider's statement for a period and reconcile it.
    pub async fn reconcile_provider_settlement(
        &self,
        provider_name: &str,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<SettlementReconciliation, AppError> {
        let provider = self.providers.get(provider_name)?;
        let report = provider.settlement_report(period_start, period_end).await?;
        self.reconcile_settlement(SettlementReport {
            provider: provider_name.to_string(),
            ..report
        })
        .await
    }

    /// Reconcile the previous UTC day for every provider that publishes statements.
    pub async fn reconcile_previous_day(&self) -> Result<usize, AppError> {
        let (start, end) = previous_day(self.clock.now());
        let mut reconciled = 0;
        for name in self.providers.names() {
            match self.reconcile_provider_settlement(&name, start, end).await {
                Ok(_) => reconciled += 1,
                Err(AppError::Provider(err)) if err.code == ProviderErrorCode::ProviderUnavailable => {
                    tracing::debug!(provider = %name, "no settlement report available");
                }
                Err(err) => {
                    tracing::warn!(provider = %name, error = %err, "settlement reconciliation failed");
                }
            }
        }
        Ok(reconciled)
    }

    pub async fn list_reconciliations(
        &self,
        provider: Option<&str>,
        limit: i64,
    ) -> Result<Vec<SettlementReconciliation>, AppError> {
        self.store.list_reconciliations(provider, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::payment::{PaymentFlow, PaymentStatus};
    use crate::models::reconciliation::SettlementLine;

    fn paid(provider_ref: &str, amount: i64) -> Payment {
        let now = Utc::now();
        Payment {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            store_id: Uuid::new_v4(),
            order_id: Uuid::new_v4(),
            actor_id: Uuid::new_v4(),
            amount,
            currency: "USD".into(),
            flow: PaymentFlow::Provider,
            provider: "card".into(),
            provider_ref: Some(provider_ref.into()),
            client_secret: None,
            status: PaymentStatus::Paid,
            failure_code: None,
            failure_reason: None,
            retries: 0,
            max_retries: 3,
            last_retry_at: None,
            expires_at: None,
            locked_at: None,
            snapshot: None,
            created_at: now,
            updated_at: now,
            paid_at: Some(now),
            failed_at: None,
            cancelled_at: None,
            voided_at: None,
            corrected_at: None,
        }
    }

    fn line(provider_ref: &str, amount: i64) -> SettlementLine {
        SettlementLine {
            provider_ref: provider_ref.into(),
            amount,
            currency: "USD".into(),
        }
    }

    fn report(payments: Vec<SettlementLine>) -> SettlementReport {
        let (period_start, period_end) = previous_day(Utc::now());
        SettlementReport {
            provider: "card".into(),
            period_start,
            period_end,
            payments,
            refunds: vec![],
        }
    }

    #[test]
    fn matching_statement_has_no_discrepancy() {
        let payments = vec![paid("pi_1", 1000), paid("pi_2", 500)];
        let rec = compare_settlement(&report(vec![line("pi_1", 1000), line("pi_2", 500)]), &payments, &[], 100, Utc::now());
        assert!(!rec.has_discrepancy);
        assert_eq!(rec.net_variance, 0);
        assert_eq!(rec.payment_count_variance, 0);
    }

    #[test]
    fn variance_within_tolerance_is_accepted() {
        let payments = vec![paid("pi_1", 1000)];
        let rec = compare_settlement(&report(vec![line("pi_1", 950)]), &payments, &[], 100, Utc::now());
        assert_eq!(rec.payment_amount_variance, 50);
        assert!(!rec.has_discrepancy);
    }

    #[test]
    fn one_sided_references_are_discrepancies() {
        let payments = vec![paid("pi_1", 1000)];
        let rec = compare_settlement(&report(vec![line("pi_1", 1000), line("pi_9", 10)]), &payments, &[], 100, Utc::now());
        assert_eq!(rec.missing_locally, vec!["pi_9".to_string()]);
        assert!(rec.missing_at_provider.is_empty());
        assert!(rec.has_discrepancy);
    }

    #[test]
    fn previous_day_is_midnight_aligned() {
        let now = "2026-10-19T13:45:00Z".parse::<DateTime<Utc>>().unwrap();
        let (start, end) = previous_day(now);
        assert_eq!(start.to_rfc3339(), "2026-10-18T00:00:00+00:00");
        assert_eq!(end.to_rfc3339(), "2026-10-19T00:00:00+00:00");
    }
}
