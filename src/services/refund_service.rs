//! Refund workflow: request, approval, provider refund, completion.
//!
//! A refund holds part of the payment's balance from the moment it is requested.
//! Completion re-derives the payment's refunded status inside the same unit of work
//! (see [`crate::store::refunded_payment`]). Refunds left `PROCESSING` are settled by
//! [`RefundService::reconcile_refund`] from the provider's view.

use std::sync::Arc;

use chrono::Duration;
use serde_json::json;
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::RetryPolicy;
use crate::error::AppError;
use crate::models::audit::{AuditContext, AuditSource};
use crate::models::events::{EventKind, NewDomainEvent};
use crate::models::payment::{CASH_PROVIDER, Payment};
use crate::models::refund::{CreateRefundRequest, Refund, RefundStatus};
use crate::models::risk::FraudSignal;
use crate::providers::{CanonicalStatus, ProviderError, ProviderRegistry, RefundMetadata, RefundResult, with_retry};
use crate::services::risk::RiskEngine;
use crate::store::{RefundOutcome, RefundTransition, Store};

/// Refund requests per actor in this window before the velocity signal fires.
const REFUND_VELOCITY_WINDOW_HOURS: i64 = 24;
const REFUND_VELOCITY_THRESHOLD: i64 = 3;

/// Refunded share of paid volume, in percent, above which the ratio signal fires.
const HIGH_REFUND_RATIO_PERCENT: i64 = 50;

fn refund_event(kind: EventKind, refund: &Refund) -> NewDomainEvent {
    NewDomainEvent::new(
        kind,
        refund.tenant_id,
        refund.id,
        json!({
            "refund_id": refund.id,
            "payment_id": refund.payment_id,
            "order_id": refund.order_id,
            "amount": refund.amount,
            "currency": refund.currency,
            "provider": refund.provider,
        }),
    )
}

#[derive(Clone)]
pub struct RefundService {
    store: Arc<dyn Store>,
    providers: ProviderRegistry,
    risk: RiskEngine,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl RefundService {
    pub fn new(
        store: Arc<dyn Store>,
        providers: ProviderRegistry,
        risk: RiskEngine,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            providers,
            risk,
            clock,
            retry,
        }
    }

    /// Request a refund of (part of) a payment.
    ///
    /// # Process
    ///
    /// 1. Validate the amount and load the payment (tenant-scoped)
    /// 2. Risk gate: a locked actor is refused, an actor under manual review gets a
    ///    refund that waits for admin approval
    /// 3. Persist the `REQUESTED` refund (balance checked atomically)
    /// 4. Feed refund velocity / ratio signals
    /// 5. Process immediately unless approval is required
    ///
    /// # Errors
    ///
    /// - `INVALID_REQUEST`: non-positive amount or missing reason
    /// - `PAYMENT_NOT_FOUND`, `PAYMENT_NOT_REFUNDABLE`, `REFUND_EXCEEDS_PAYMENT`
    /// - `PAYMENT_LOCKED_BY_RISK_POLICY`
    pub async fn request_refund(
        &self,
        tenant_id: Uuid,
        payment_id: Uuid,
        request: CreateRefundRequest,
    ) -> Result<Refund, AppError> {
        if request.amount <= 0 {
            return Err(AppError::InvalidRequest("amount must be positive".to_string()));
        }
        if request.reason.trim().is_empty() {
            return Err(AppError::InvalidRequest("reason is required".to_string()));
        }

        let payment = self
            .store
            .get_payment(payment_id)
            .await?
            .filter(|p| p.tenant_id == tenant_id)
            .ok_or(AppError::PaymentNotFound)?;
        if !payment.status.is_refundable() {
            return Err(AppError::PaymentNotRefundable(payment.status.to_string()));
        }

        let requires_approval = self
            .risk
            .gate_refund(tenant_id, payment.actor_id)
            .await
            .inspect_err(|err| {
                tracing::info!(payment_id = %payment_id, code = err.code(), "refund refused by risk policy");
            })?;

        let now = self.clock.now();
        let refund = Refund {
            id: Uuid::new_v4(),
            payment_id: payment.id,
            order_id: payment.order_id,
            tenant_id: payment.tenant_id,
            store_id: payment.store_id,
            actor_id: payment.actor_id,
            amount: request.amount,
            currency: payment.currency.clone(),
            status: RefundStatus::Requested,
            reason: request.reason.clone(),
            requested_by: request.requested_by.clone(),
            requires_approval,
            approved_by: None,
            approved_at: None,
            provider: payment.provider.clone(),
            provider_ref: None,
            failure_reason: None,
            snapshot: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            failed_at: None,
            cancelled_at: None,
        };

        let events = vec![refund_event(EventKind::RefundRequested, &refund)];
        let audit = AuditContext::new(AuditSource::Command)
            .operator(&request.requested_by)
            .reason(&request.reason);
        let refund = self.store.create_refund(refund, audit, events).await?;

        tracing::info!(
            refund_id = %refund.id,
            payment_id = %payment.id,
            amount = refund.amount,
            requires_approval,
            "refund requested"
        );

        self.signal_activity(&refund).await;

        if requires_approval {
            return Ok(refund);
        }
        self.process_refund(&payment, refund, None, &request.requested_by).await
    }

    /// Admin approval of a refund held for manual review; processing starts right away.
    pub async fn approve_refund(
        &self,
        tenant_id: Uuid,
        refund_id: Uuid,
        operator: &str,
    ) -> Result<Refund, AppError> {
        let refund = self.get_refund(tenant_id, refund_id).await?;
        if refund.status != RefundStatus::Requested || !refund.requires_approval || refund.approved_by.is_some() {
            return Err(AppError::InvalidRefundTransition {
                from: refund.status.to_string(),
                to: RefundStatus::Processing.to_string(),
            });
        }
        let payment = self
            .store
            .get_payment(refund.payment_id)
            .await?
            .ok_or(AppError::PaymentNotFound)?;

        tracing::info!(refund_id = %refund_id, operator, "refund approved");
        self.process_refund(&payment, refund, Some(operator.to_string()), operator).await
    }

    pub async fn reject_refund(
        &self,
        tenant_id: Uuid,
        refund_id: Uuid,
        reason: &str,
        operator: &str,
    ) -> Result<Refund, AppError> {
        if reason.trim().is_empty() {
            return Err(AppError::InvalidRequest("reason is required".to_string()));
        }
        let refund = self.get_refund(tenant_id, refund_id).await?;

        let audit = AuditContext::new(AuditSource::Admin).operator(operator).reason(reason);
        let mut transition = RefundTransition::new(refund.id, RefundStatus::Cancelled, audit, self.clock.now());
        transition.changes.failure_reason = Some(reason.to_string());
        transition.events = vec![refund_event(EventKind::RefundCancelled, &refund)];

        let rejected = self.store.apply_refund_transition(transition).await?.into_refund();
        tracing::info!(refund_id = %refund_id, operator, "refund rejected");
        Ok(rejected)
    }

    /// Provider-reported refund settlement. Already-completed refunds are returned unchanged.
    pub async fn complete_from_provider(
        &self,
        refund_id: Uuid,
        snapshot: Option<serde_json::Value>,
        audit: AuditContext,
    ) -> Result<Refund, AppError> {
        let refund = self
            .store
            .get_refund(refund_id)
            .await?
            .ok_or(AppError::RefundNotFound)?;
        self.complete(&refund, snapshot, audit).await
    }

    pub async fn fail_from_provider(
        &self,
        refund_id: Uuid,
        reason: Option<String>,
        snapshot: Option<serde_json::Value>,
        audit: AuditContext,
    ) -> Result<Refund, AppError> {
        let refund = self
            .store
            .get_refund(refund_id)
            .await?
            .ok_or(AppError::RefundNotFound)?;

        let mut transition = RefundTransition::new(refund.id, RefundStatus::Failed, audit, self.clock.now());
        transition.unchanged_if = &[RefundStatus::Failed];
        transition.changes.failure_reason = reason.or_else(|| Some("refund failed at provider".to_string()));
        transition.changes.snapshot = snapshot;
        transition.events = vec![refund_event(EventKind::RefundFailed, &refund)];

        let outcome = self.store.apply_refund_transition(transition).await?;
        if matches!(outcome, RefundOutcome::Applied { .. }) {
            tracing::warn!(refund_id = %refund.id, payment_id = %refund.payment_id, "refund failed");
        }
        Ok(outcome.into_refund())
    }

    pub async fn get_refund(&self, tenant_id: Uuid, refund_id: Uuid) -> Result<Refund, AppError> {
        self.store
            .get_refund(refund_id)
            .await?
            .filter(|r| r.tenant_id == tenant_id)
            .ok_or(AppError::RefundNotFound)
    }

    pub async fn list_refunds(&self, tenant_id: Uuid, payment_id: Uuid) -> Result<Vec<Refund>, AppError> {
        let payment = self
            .store
            .get_payment(payment_id)
            .await?
            .filter(|p| p.tenant_id == tenant_id)
            .ok_or(AppError::PaymentNotFound)?;
        self.store.list_refunds_for_payment(payment.id).await
    }

    /// `REQUESTED -> PROCESSING`, provider refund outside any transaction, then settle.
    ///
    /// A provider that settles asynchronously leaves the refund `PROCESSING` until its
    /// refund event arrives.
    async fn process_refund(
        &self,
        payment: &Payment,
        refund: Refund,
        approved_by: Option<String>,
        operator: &str,
    ) -> Result<Refund, AppError> {
        let audit = AuditContext::new(if approved_by.is_some() {
            AuditSource::Admin
        } else {
            AuditSource::Command
        })
        .operator(operator);

        let mut transition =
            RefundTransition::new(refund.id, RefundStatus::Processing, audit.clone(), self.clock.now());
        transition.changes.approved_by = approved_by;
        let processing = self.store.apply_refund_transition(transition).await?.into_refund();

        if processing.provider == CASH_PROVIDER {
            return self
                .complete(&processing, None, AuditContext::new(AuditSource::Cashier).operator(operator))
                .await;
        }

        let Some(payment_ref) = payment.provider_ref.as_deref() else {
            return self
                .fail(&processing, "payment has no provider reference", audit)
                .await;
        };
        match self.submit(payment, payment_ref, &processing).await? {
            Ok(result) => self.settle(&processing, result, audit).await,
            Err(err) => {
                tracing::warn!(refund_id = %processing.id, code = %err.code, "provider refused refund");
                self.fail(&processing, &err.to_string(), audit).await
            }
        }
    }

    /// Settle a `PROCESSING` refund from the provider's view. Returns whether it moved.
    ///
    /// A refund without a provider reference had its submission interrupted; the refund
    /// call is repeated (providers dedupe it by refund id) to recover the reference.
    /// Transient provider failures leave the refund for the next pass.
    pub async fn reconcile_refund(&self, refund: &Refund) -> Result<bool, AppError> {
        if refund.status != RefundStatus::Processing || refund.provider == CASH_PROVIDER {
            return Ok(false);
        }
        let audit = AuditContext::new(AuditSource::Reconciliation);

        let Some(refund_ref) = refund.provider_ref.as_deref() else {
            let payment = self
                .store
                .get_payment(refund.payment_id)
                .await?
                .ok_or(AppError::PaymentNotFound)?;
            let Some(payment_ref) = payment.provider_ref.as_deref() else {
                self.fail(refund, "payment has no provider reference", audit).await?;
                return Ok(true);
            };
            return match self.submit(&payment, payment_ref, refund).await? {
                Ok(result) => {
                    tracing::info!(refund_id = %refund.id, provider_ref = %result.provider_ref, "refund reference recovered");
                    self.settle(refund, result, audit).await?;
                    Ok(true)
                }
                Err(err) if err.code.is_transient() => Ok(false),
                Err(err) => {
                    self.fail(refund, &err.to_string(), audit).await?;
                    Ok(true)
                }
            };
        };

        let provider = self.providers.get(&refund.provider)?;
        let provider = provider.as_ref();
        let lookup = match with_retry(self.retry, "refund lookup", move || provider.lookup_refund(refund_ref)).await {
            Ok(lookup) => lookup,
            Err(err) => {
                tracing::warn!(refund_id = %refund.id, code = %err.code, "refund lookup failed");
                return Ok(false);
            }
        };

        match lookup.status {
            CanonicalStatus::Paid => {
                self.complete(refund, Some(lookup.snapshot), audit).await?;
                Ok(true)
            }
            CanonicalStatus::Failed => {
                let reason = lookup
                    .failure_reason
                    .unwrap_or_else(|| "refund failed at provider".to_string());
                self.fail(refund, &reason, audit).await?;
                Ok(true)
            }
            CanonicalStatus::RequiresAction | CanonicalStatus::Pending => Ok(false),
        }
    }

    /// Provider refund call, idempotent by refund id. The outer error is local.
    async fn submit(
        &self,
        payment: &Payment,
        payment_ref: &str,
        refund: &Refund,
    ) -> Result<Result<RefundResult, ProviderError>, AppError> {
        let provider = self.providers.get(&refund.provider)?;
        let provider = provider.as_ref();
        let metadata = RefundMetadata {
            refund_id: refund.id,
            payment_id: payment.id,
            tenant_id: payment.tenant_id,
            actor_id: payment.actor_id,
            currency: refund.currency.clone(),
        };
        let metadata = &metadata;
        let amount = refund.amount;

        Ok(with_retry(self.retry, "refund", move || provider.refund(payment_ref, amount, metadata)).await)
    }

    async fn settle(&self, refund: &Refund, result: RefundResult, audit: AuditContext) -> Result<Refund, AppError> {
        let attached = self
            .store
            .attach_refund_reference(refund.id, &result.provider_ref, result.snapshot.clone(), self.clock.now())
            .await?;
        if result.settled {
            self.complete(&attached, Some(result.snapshot), audit).await
        } else {
            tracing::info!(refund_id = %attached.id, provider_ref = %result.provider_ref, "refund awaiting provider settlement");
            Ok(attached)
        }
    }

    async fn complete(
        &self,
        refund: &Refund,
        snapshot: Option<serde_json::Value>,
        audit: AuditContext,
    ) -> Result<Refund, AppError> {
        let mut transition = RefundTransition::new(refund.id, RefundStatus::Completed, audit, self.clock.now());
        transition.unchanged_if = &[RefundStatus::Completed];
        transition.changes.snapshot = snapshot;
        transition.events = vec![refund_event(EventKind::RefundCompleted, refund)];

        match self.store.apply_refund_transition(transition).await? {
            RefundOutcome::Applied { refund, payment } => {
                tracing::info!(refund_id = %refund.id, amount = refund.amount, "refund completed");
                if let Some(payment) = payment {
                    tracing::info!(payment_id = %payment.id, status = %payment.status, "payment refund status updated");
                }
                Ok(refund)
            }
            RefundOutcome::Unchanged(refund) => Ok(refund),
        }
    }

    async fn fail(&self, refund: &Refund, reason: &str, audit: AuditContext) -> Result<Refund, AppError> {
        let mut transition = RefundTransition::new(refund.id, RefundStatus::Failed, audit, self.clock.now());
        transition.changes.failure_reason = Some(reason.to_string());
        transition.events = vec![refund_event(EventKind::RefundFailed, refund)];
        Ok(self.store.apply_refund_transition(transition).await?.into_refund())
    }

    /// Velocity and ratio signals for the refunding actor. Never fails the request.
    async fn signal_activity(&self, refund: &Refund) {
        let since = self.clock.now() - Duration::hours(REFUND_VELOCITY_WINDOW_HOURS);
        let activity = match self
            .store
            .refund_activity(refund.tenant_id, refund.actor_id, since)
            .await
        {
            Ok(activity) => activity,
            Err(err) => {
                tracing::warn!(refund_id = %refund.id, error = %err, "refund activity unavailable");
                return;
            }
        };

        let mut signals = Vec::new();
        if activity.recent_refunds >= REFUND_VELOCITY_THRESHOLD {
            signals.push(FraudSignal::RefundVelocity);
        }
        let refunded = activity.refunded_total + refund.amount;
        if activity.paid_total > 0 && refunded * 100 > activity.paid_total * HIGH_REFUND_RATIO_PERCENT {
            signals.push(FraudSignal::HighRefundRatio);
        }

        for signal in signals {
            let payload = json!({
                "refund_id": refund.id,
                "payment_id": refund.payment_id,
                "recent_refunds": activity.recent_refunds,
                "refunded_total": refunded,
                "paid_total": activity.paid_total,
            });
            if let Err(err) = self
                .risk
                .evaluate(refund.tenant_id, refund.actor_id, signal, payload)
                .await
            {
                tracing::warn!(refund_id = %refund.id, signal = %signal, error = %err, "risk signal not recorded");
            }
        }
    }
}
