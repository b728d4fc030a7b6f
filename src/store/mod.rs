//! Persistence ports.
//!
//! Services talk to storage only through these traits. Every method that changes a
//! Payment, Refund or risk row is one atomic unit of work: it re-reads the current row
//! under a lock, asserts the state-machine guard, then writes the row, the dependent
//! Order status, the audit snapshot and the outbox events together.
//!
//! Two backends implement them:
//! - [`postgres::PgStore`]: production, `SELECT ... FOR UPDATE` inside `pool.begin()`
//! - [`memory::InMemoryStore`]: tests and local runs, one async mutex over all tables
//!
//! The status arithmetic both backends share lives in this module as plain functions.

use chrono::{DateTime, Utc};
use serde_json::json;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::api_key::ApiKey;
use crate::models::audit::{AuditContext, AuditEntity, PaymentAuditSnapshot};
use crate::models::events::{DomainEvent, NewDomainEvent};
use crate::models::idempotency::{IdempotencyClaim, IdempotencyCompletion, NewIdempotencyClaim};
use crate::models::job::{JobHeartbeat, JobRun};
use crate::models::order::{Order, OrderStatus, StoreLocation};
use crate::models::payment::{Payment, PaymentStatus};
use crate::models::reconciliation::SettlementReconciliation;
use crate::models::refund::{Refund, RefundStatus};
use crate::models::risk::{
    FraudEvent, PaymentRestriction, PaymentRisk, RestrictionChanges, RiskLevel, RiskSignal,
};
use crate::models::wallet::{WalletDebit, WalletEntry, WalletMovement};
use crate::models::webhook::{
    DeadLetterFailure, DeadLetterStatus, NewWebhookEvent, WebhookDeadLetter, WebhookEvent,
    WebhookReplay,
};
use crate::state_machine;

pub mod memory;
pub mod postgres;

/// A brand-new payment and the context needed to persist it.
#[derive(Debug, Clone)]
pub struct NewPaymentIntent {
    /// Fully built `PENDING` row.
    pub payment: Payment,
    pub audit: AuditContext,
    pub events: Vec<NewDomainEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionMode {
    Lifecycle,
    /// Operator correction, checked against the override table.
    Override,
}

/// Field updates carried along with a status change.
#[derive(Debug, Clone, Default)]
pub struct PaymentChanges {
    pub provider_ref: Option<String>,
    pub snapshot: Option<serde_json::Value>,
    pub failure_code: Option<String>,
    pub failure_reason: Option<String>,
    /// Counts a retry attempt and stamps `last_retry_at`.
    pub count_retry: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub voided: bool,
}

#[derive(Debug, Clone)]
pub struct PaymentTransition {
    pub payment_id: Uuid,
    pub to: PaymentStatus,
    pub mode: TransitionMode,

    /// Current statuses that make this transition a no-op instead of an error.
    pub unchanged_if: &'static [PaymentStatus],
    pub changes: PaymentChanges,

    /// Order status to write; `None` mirrors the new payment status.
    pub order_status: Option<OrderStatus>,
    pub audit: AuditContext,
    pub events: Vec<NewDomainEvent>,
    pub at: DateTime<Utc>,
}

impl PaymentTransition {
    pub fn new(payment_id: Uuid, to: PaymentStatus, audit: AuditContext, at: DateTime<Utc>) -> Self {
        Self {
            payment_id,
            to,
            mode: TransitionMode::Lifecycle,
            unchanged_if: &[],
            changes: PaymentChanges::default(),
            order_status: None,
            audit,
            events: Vec::new(),
            at,
        }
    }

    pub fn order_status(&self) -> OrderStatus {
        self.order_status.unwrap_or(OrderStatus::mirroring(self.to))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    Applied { before: Payment, after: Payment },
    Unchanged(Payment),
}

impl TransitionOutcome {
    pub fn payment(&self) -> &Payment {
        match self {
            TransitionOutcome::Applied { after, .. } => after,
            TransitionOutcome::Unchanged(payment) => payment,
        }
    }

    pub fn into_payment(self) -> Payment {
        match self {
            TransitionOutcome::Applied { after, .. } => after,
            TransitionOutcome::Unchanged(payment) => payment,
        }
    }

    pub fn was_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied { .. })
    }
}

#[derive(Debug, Clone, Default)]
pub struct RefundChanges {
    pub provider_ref: Option<String>,
    pub snapshot: Option<serde_json::Value>,
    pub failure_reason: Option<String>,
    pub approved_by: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RefundTransition {
    pub refund_id: Uuid,
    pub to: RefundStatus,
    pub unchanged_if: &'static [RefundStatus],
    pub changes: RefundChanges,
    pub audit: AuditContext,
    pub events: Vec<NewDomainEvent>,
    pub at: DateTime<Utc>,
}

impl RefundTransition {
    pub fn new(refund_id: Uuid, to: RefundStatus, audit: AuditContext, at: DateTime<Utc>) -> Self {
        Self {
            refund_id,
            to,
            unchanged_if: &[],
            changes: RefundChanges::default(),
            audit,
            events: Vec::new(),
            at,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RefundOutcome {
    /// `payment` is set when completion moved the payment to a refunded status.
    Applied {
        refund: Refund,
        payment: Option<Payment>,
    },
    Unchanged(Refund),
}

impl RefundOutcome {
    pub fn refund(&self) -> &Refund {
        match self {
            RefundOutcome::Applied { refund, .. } => refund,
            RefundOutcome::Unchanged(refund) => refund,
        }
    }

    pub fn into_refund(self) -> Refund {
        match self {
            RefundOutcome::Applied { refund, .. } => refund,
            RefundOutcome::Unchanged(refund) => refund,
        }
    }
}

/// Refund history of an actor, input to the refund velocity and ratio signals.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RefundActivity {
    pub recent_refunds: i64,
    pub refunded_total: i64,
    pub paid_total: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RiskUpdate {
    pub previous_level: RiskLevel,
    pub risk: PaymentRisk,
    pub event: FraudEvent,
}

#[async_trait::async_trait]
pub trait OrderRepository: Send + Sync {
    async fn get_order(&self, tenant_id: Uuid, order_id: Uuid) -> Result<Option<Order>, AppError>;

    async fn get_store_location(
        &self,
        tenant_id: Uuid,
        store_id: Uuid,
    ) -> Result<Option<StoreLocation>, AppError>;
}

#[async_trait::async_trait]
pub trait PaymentRepository: Send + Sync {
    async fn get_payment(&self, payment_id: Uuid) -> Result<Option<Payment>, AppError>;

    async fn find_payment_by_provider_ref(
        &self,
        provider: &str,
        provider_ref: &str,
    ) -> Result<Option<Payment>, AppError>;

    async fn find_live_payment_for_order(&self, order_id: Uuid) -> Result<Option<Payment>, AppError>;

    /// Persist a new `PENDING` payment.
    ///
    /// # Errors
    ///
    /// - `ORDER_NOT_FOUND` / `ORDER_NOT_PAYABLE`
    /// - `PAYMENT_ALREADY_EXISTS` if the order has a live intent that has not expired;
    ///   an expired one is failed with `PROVIDER_TIMEOUT` in the same unit of work
    async fn create_payment_intent(&self, intent: NewPaymentIntent) -> Result<Payment, AppError>;

    async fn apply_payment_transition(
        &self,
        transition: PaymentTransition,
    ) -> Result<TransitionOutcome, AppError>;

    /// Record the provider intent created for a payment that had none yet.
    async fn attach_provider_intent(
        &self,
        payment_id: Uuid,
        provider_ref: &str,
        client_secret: Option<String>,
        snapshot: serde_json::Value,
        at: DateTime<Utc>,
    ) -> Result<Payment, AppError>;

    /// Take the confirm-in-progress lock. A lock taken before `stale_before` is free.
    async fn try_lock_payment(
        &self,
        payment_id: Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, AppError>;

    async fn release_payment_lock(&self, payment_id: Uuid) -> Result<(), AppError>;

    /// Live PROVIDER-flow payments with a provider reference not updated since `updated_before`.
    async fn list_stale_payments(
        &self,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Payment>, AppError>;

    /// Live payments whose `expires_at` has passed.
    async fn list_expired_intents(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Payment>, AppError>;

    async fn count_recent_failures(
        &self,
        tenant_id: Uuid,
        actor_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<i64, AppError>;

    /// Payments of `provider` paid inside `[start, end)`, whatever refunds happened since.
    async fn list_settled_payments(
        &self,
        provider: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Payment>, AppError>;

    async fn list_audit_snapshots(&self, payment_id: Uuid) -> Result<Vec<PaymentAuditSnapshot>, AppError>;
}

#[async_trait::async_trait]
pub trait RefundRepository: Send + Sync {
    async fn get_refund(&self, refund_id: Uuid) -> Result<Option<Refund>, AppError>;

    async fn list_refunds_for_payment(&self, payment_id: Uuid) -> Result<Vec<Refund>, AppError>;

    async fn find_refund_by_provider_ref(
        &self,
        provider: &str,
        provider_ref: &str,
    ) -> Result<Option<Refund>, AppError>;

    /// Persist a `REQUESTED` refund.
    ///
    /// # Errors
    ///
    /// - `PAYMENT_NOT_REFUNDABLE` unless the payment is `PAID`/`PARTIALLY_REFUNDED`
    /// - `REFUND_EXCEEDS_PAYMENT` if outstanding refunds plus this one exceed the payment
    async fn create_refund(
        &self,
        refund: Refund,
        audit: AuditContext,
        events: Vec<NewDomainEvent>,
    ) -> Result<Refund, AppError>;

    /// Move a refund; on `COMPLETED` also re-derive the payment's refunded status.
    async fn apply_refund_transition(&self, transition: RefundTransition) -> Result<RefundOutcome, AppError>;

    async fn attach_refund_reference(
        &self,
        refund_id: Uuid,
        provider_ref: &str,
        snapshot: serde_json::Value,
        at: DateTime<Utc>,
    ) -> Result<Refund, AppError>;

    async fn refund_activity(
        &self,
        tenant_id: Uuid,
        actor_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<RefundActivity, AppError>;

    async fn list_completed_refunds(
        &self,
        provider: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Refund>, AppError>;

    /// `PROCESSING` refunds untouched since `updated_before`, oldest first.
    async fn list_stale_refunds(
        &self,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Refund>, AppError>;
}

#[async_trait::async_trait]
pub trait WebhookRepository: Send + Sync {
    async fn find_webhook_event(
        &self,
        provider: &str,
        event_uuid: &str,
    ) -> Result<Option<WebhookEvent>, AppError>;

    /// Insert the event once per `(provider, event_uuid)`. `None` means duplicate.
    async fn record_webhook_event(&self, event: NewWebhookEvent) -> Result<Option<WebhookEvent>, AppError>;

    async fn get_webhook_event(&self, event_id: Uuid) -> Result<Option<WebhookEvent>, AppError>;

    /// Stamp `processed_at` unless already stamped.
    async fn mark_webhook_processed(&self, event_id: Uuid, at: DateTime<Utc>) -> Result<(), AppError>;

    async fn list_webhook_events_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        provider: Option<&str>,
    ) -> Result<Vec<WebhookEvent>, AppError>;

    /// Create the event's dead letter or count another failed attempt on it.
    async fn record_dead_letter_failure(
        &self,
        failure: DeadLetterFailure,
        events: Vec<NewDomainEvent>,
    ) -> Result<WebhookDeadLetter, AppError>;

    async fn get_dead_letter(&self, dead_letter_id: Uuid) -> Result<Option<WebhookDeadLetter>, AppError>;

    async fn find_dead_letter_for_event(&self, event_id: Uuid) -> Result<Option<WebhookDeadLetter>, AppError>;

    async fn list_dead_letters(&self, status: Option<DeadLetterStatus>) -> Result<Vec<WebhookDeadLetter>, AppError>;

    /// `FAILED` dead letters whose `next_retry_at` has passed.
    async fn list_due_dead_letters(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<WebhookDeadLetter>, AppError>;

    async fn resolve_dead_letter(&self, dead_letter_id: Uuid, at: DateTime<Utc>) -> Result<(), AppError>;

    async fn record_webhook_replay(&self, replay: WebhookReplay) -> Result<(), AppError>;

    async fn list_webhook_replays(&self, event_id: Uuid) -> Result<Vec<WebhookReplay>, AppError>;
}

#[async_trait::async_trait]
pub trait IdempotencyRepository: Send + Sync {
    /// Race-safe claim of `(tenant, key, route)`; an expired record may be taken over.
    async fn claim_idempotency_key(&self, claim: NewIdempotencyClaim) -> Result<IdempotencyClaim, AppError>;

    async fn complete_idempotency_key(
        &self,
        tenant_id: Uuid,
        key: &str,
        route: &str,
        completion: IdempotencyCompletion,
    ) -> Result<(), AppError>;

    /// Drop an unfinished claim so the client may retry.
    async fn release_idempotency_key(&self, tenant_id: Uuid, key: &str, route: &str) -> Result<(), AppError>;

    async fn purge_idempotency_keys(&self, now: DateTime<Utc>) -> Result<u64, AppError>;
}

#[async_trait::async_trait]
pub trait RiskRepository: Send + Sync {
    async fn get_risk(&self, tenant_id: Uuid, actor_id: Uuid) -> Result<Option<PaymentRisk>, AppError>;

    /// Upsert the score by the signal's delta (floored at zero) and log the fraud event.
    async fn apply_risk_signal(&self, signal: RiskSignal) -> Result<RiskUpdate, AppError>;

    async fn active_restrictions(
        &self,
        tenant_id: Uuid,
        actor_id: Uuid,
    ) -> Result<Vec<PaymentRestriction>, AppError>;

    /// Lock the actor's risk row and make the active restriction set exactly what its
    /// current score calls for. An actor without a risk row has score 0.
    async fn sync_restrictions(
        &self,
        tenant_id: Uuid,
        actor_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<RestrictionChanges, AppError>;

    /// Subtract `amount` from every positive score, floored at zero. Returns changed rows.
    async fn decay_risk_scores(&self, amount: i32, at: DateTime<Utc>) -> Result<Vec<PaymentRisk>, AppError>;

    async fn list_fraud_events(
        &self,
        tenant_id: Uuid,
        actor_id: Uuid,
        limit: i64,
    ) -> Result<Vec<FraudEvent>, AppError>;
}

#[async_trait::async_trait]
pub trait WalletRepository: Send + Sync {
    /// Debit unless the balance is short. Replaying a reference returns the original entry.
    async fn wallet_debit(&self, movement: WalletMovement) -> Result<WalletDebit, AppError>;

    async fn wallet_credit(&self, movement: WalletMovement) -> Result<WalletEntry, AppError>;

    async fn wallet_entry(&self, reference: &str) -> Result<Option<WalletEntry>, AppError>;
}

#[async_trait::async_trait]
pub trait OpsRepository: Send + Sync {
    async fn ping(&self) -> Result<(), AppError>;

    async fn find_api_key(&self, key_hash: &str) -> Result<Option<ApiKey>, AppError>;

    async fn append_domain_events(&self, events: Vec<NewDomainEvent>, at: DateTime<Utc>) -> Result<(), AppError>;

    async fn pending_domain_events(&self, limit: i64) -> Result<Vec<DomainEvent>, AppError>;

    async fn mark_events_published(&self, event_ids: &[Uuid], at: DateTime<Utc>) -> Result<(), AppError>;

    async fn record_reconciliation(
        &self,
        reconciliation: SettlementReconciliation,
        events: Vec<NewDomainEvent>,
    ) -> Result<(), AppError>;

    async fn list_reconciliations(
        &self,
        provider: Option<&str>,
        limit: i64,
    ) -> Result<Vec<SettlementReconciliation>, AppError>;

    async fn record_job_run(&self, run: JobRun) -> Result<JobHeartbeat, AppError>;

    async fn list_job_heartbeats(&self) -> Result<Vec<JobHeartbeat>, AppError>;
}

/// Everything the engine persists.
pub trait Store:
    OrderRepository
    + PaymentRepository
    + RefundRepository
    + WebhookRepository
    + IdempotencyRepository
    + RiskRepository
    + WalletRepository
    + OpsRepository
{
}

impl<T> Store for T where
    T: OrderRepository
        + PaymentRepository
        + RefundRepository
        + WebhookRepository
        + IdempotencyRepository
        + RiskRepository
        + WalletRepository
        + OpsRepository
{
}

/// Compute the row a transition would write, or `None` if it is a no-op.
///
/// # Errors
///
/// `INVALID_PAYMENT_TRANSITION` when the move is not in the applicable table.
pub fn next_payment(current: &Payment, t: &PaymentTransition) -> Result<Option<Payment>, AppError> {
    if t.unchanged_if.contains(&current.status) {
        return Ok(None);
    }
    match t.mode {
        TransitionMode::Lifecycle => state_machine::assert_payment_transition(current.status, t.to)?,
        TransitionMode::Override => state_machine::assert_payment_override(current.status, t.to)?,
    }

    let mut next = current.clone();
    next.status = t.to;
    next.updated_at = t.at;
    match t.to {
        PaymentStatus::Paid => next.paid_at = Some(t.at),
        PaymentStatus::Failed => next.failed_at = Some(t.at),
        PaymentStatus::Cancelled => next.cancelled_at = Some(t.at),
        _ => {}
    }

    let changes = &t.changes;
    if let Some(provider_ref) = &changes.provider_ref {
        next.provider_ref = Some(provider_ref.clone());
    }
    if let Some(snapshot) = &changes.snapshot {
        next.snapshot = Some(snapshot.clone());
    }
    if changes.failure_code.is_some() {
        next.failure_code = changes.failure_code.clone();
        next.failure_reason = changes.failure_reason.clone();
    }
    if changes.count_retry {
        next.retries += 1;
        next.last_retry_at = Some(t.at);
    }
    if changes.expires_at.is_some() {
        next.expires_at = changes.expires_at;
    }
    if changes.voided {
        next.voided_at = Some(t.at);
    }
    if t.mode == TransitionMode::Override {
        next.corrected_at = Some(t.at);
    }
    Ok(Some(next))
}

pub fn next_refund(current: &Refund, t: &RefundTransition) -> Result<Option<Refund>, AppError> {
    if t.unchanged_if.contains(&current.status) {
        return Ok(None);
    }
    state_machine::assert_refund_transition(current.status, t.to)?;

    let mut next = current.clone();
    next.status = t.to;
    next.updated_at = t.at;
    match t.to {
        RefundStatus::Completed => next.completed_at = Some(t.at),
        RefundStatus::Failed => next.failed_at = Some(t.at),
        RefundStatus::Cancelled => next.cancelled_at = Some(t.at),
        _ => {}
    }

    let changes = &t.changes;
    if let Some(provider_ref) = &changes.provider_ref {
        next.provider_ref = Some(provider_ref.clone());
    }
    if let Some(snapshot) = &changes.snapshot {
        next.snapshot = Some(snapshot.clone());
    }
    if changes.failure_reason.is_some() {
        next.failure_reason = changes.failure_reason.clone();
    }
    if let Some(approved_by) = &changes.approved_by {
        next.approved_by = Some(approved_by.clone());
        next.approved_at = Some(t.at);
    }
    Ok(Some(next))
}

/// Payment status implied by the sum of its completed refunds.
pub fn refund_aggregate_status(payment_amount: i64, completed_total: i64) -> Option<PaymentStatus> {
    if completed_total <= 0 {
        None
    } else if completed_total < payment_amount {
        Some(PaymentStatus::PartiallyRefunded)
    } else {
        Some(PaymentStatus::Refunded)
    }
}

/// Payment row after a refund completion, with the audit snapshot and event it needs.
///
/// `None` when the payment already reflects the completed total.
pub fn refunded_payment(
    payment: &Payment,
    completed_total: i64,
    audit: &AuditContext,
    at: DateTime<Utc>,
) -> Result<Option<(Payment, PaymentAuditSnapshot, NewDomainEvent)>, AppError> {
    let Some(target) = refund_aggregate_status(payment.amount, completed_total) else {
        return Ok(None);
    };
    if target == payment.status {
        return Ok(None);
    }
    state_machine::assert_payment_transition(payment.status, target)?;

    let mut next = payment.clone();
    next.status = target;
    next.updated_at = at;
    let snapshot = payment_audit(payment, &next, audit, at);
    let event = NewDomainEvent::new(
        crate::models::events::EventKind::PaymentRefundStatusChanged,
        payment.tenant_id,
        payment.id,
        json!({
            "payment_id": payment.id,
            "order_id": payment.order_id,
            "status": target,
            "refunded_total": completed_total,
        }),
    );
    Ok(Some((next, snapshot, event)))
}

pub fn payment_audit(
    before: &Payment,
    after: &Payment,
    audit: &AuditContext,
    at: DateTime<Utc>,
) -> PaymentAuditSnapshot {
    PaymentAuditSnapshot::record(
        AuditEntity::Payment,
        after.id,
        after.id,
        after.tenant_id,
        Some((before.status.as_str(), before)),
        (after.status.as_str(), after),
        audit,
        at,
    )
}

/// Audit snapshot for a newly created payment, carrying the order pricing it was created against.
pub fn payment_created_audit(payment: &Payment, order: &Order, audit: &AuditContext) -> PaymentAuditSnapshot {
    let after = json!({ "payment": payment, "order_pricing": order.pricing });
    PaymentAuditSnapshot::record(
        AuditEntity::Payment,
        payment.id,
        payment.id,
        payment.tenant_id,
        None::<(&str, &serde_json::Value)>,
        (payment.status.as_str(), &after),
        audit,
        payment.created_at,
    )
}

pub fn refund_audit(
    before: Option<&Refund>,
    after: &Refund,
    audit: &AuditContext,
    at: DateTime<Utc>,
) -> PaymentAuditSnapshot {
    PaymentAuditSnapshot::record(
        AuditEntity::Refund,
        after.id,
        after.payment_id,
        after.tenant_id,
        before.map(|b| (b.status.as_str(), b)),
        (after.status.as_str(), after),
        audit,
        at,
    )
}

/// Failed row for an expired intent superseded by a new one.
pub fn superseded_intent(
    expired: &Payment,
    at: DateTime<Utc>,
) -> Result<(Payment, PaymentAuditSnapshot, NewDomainEvent), AppError> {
    let mut transition = PaymentTransition::new(
        expired.id,
        PaymentStatus::Failed,
        AuditContext::new(crate::models::audit::AuditSource::Timeout)
            .reason("intent expired before a new one was created"),
        at,
    );
    transition.changes.failure_code = Some(crate::providers::ProviderErrorCode::ProviderTimeout.to_string());
    transition.changes.failure_reason = Some("payment intent expired".to_string());

    let next = next_payment(expired, &transition)?
        .ok_or_else(|| AppError::Internal("expired intent was not live".to_string()))?;
    let audit = payment_audit(expired, &next, &transition.audit, at);
    let event = NewDomainEvent::new(
        crate::models::events::EventKind::PaymentFailed,
        next.tenant_id,
        next.id,
        json!({
            "payment_id": next.id,
            "order_id": next.order_id,
            "failure_code": next.failure_code,
        }),
    );
    Ok((next, audit, event))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::audit::AuditSource;
    use crate::models::payment::PaymentFlow;

    fn pending_payment() -> Payment {
        let now = Utc::now();
        Payment {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            store_id: Uuid::new_v4(),
            order_id: Uuid::new_v4(),
            actor_id: Uuid::new_v4(),
            amount: 1000,
            currency: "USD".into(),
            flow: PaymentFlow::Provider,
            provider: "card".into(),
            provider_ref: Some("pi_1".into()),
            client_secret: None,
            status: PaymentStatus::Pending,
            failure_code: None,
            failure_reason: None,
            retries: 0,
            max_retries: 3,
            last_retry_at: None,
            expires_at: Some(now),
            locked_at: None,
            snapshot: None,
            created_at: now,
            updated_at: now,
            paid_at: None,
            failed_at: None,
            cancelled_at: None,
            voided_at: None,
            corrected_at: None,
        }
    }

    #[test]
    fn aggregate_status_follows_completed_total() {
        assert_eq!(refund_aggregate_status(1000, 0), None);
        assert_eq!(refund_aggregate_status(1000, 400), Some(PaymentStatus::PartiallyRefunded));
        assert_eq!(refund_aggregate_status(1000, 1000), Some(PaymentStatus::Refunded));
    }

    #[test]
    fn unchanged_statuses_short_circuit_the_guard() {
        let mut paid = pending_payment();
        paid.status = PaymentStatus::PartiallyRefunded;
        let mut t = PaymentTransition::new(paid.id, PaymentStatus::Paid, AuditContext::new(AuditSource::Webhook), Utc::now());
        assert!(next_payment(&paid, &t).is_err());

        t.unchanged_if = &[PaymentStatus::Paid, PaymentStatus::PartiallyRefunded];
        assert_eq!(next_payment(&paid, &t).unwrap(), None);
    }

    #[test]
    fn transition_stamps_lifecycle_fields() {
        let payment = pending_payment();
        let at = Utc::now();
        let mut t = PaymentTransition::new(payment.id, PaymentStatus::Failed, AuditContext::new(AuditSource::Webhook), at);
        t.changes.failure_code = Some("CARD_DECLINED".into());
        let next = next_payment(&payment, &t).unwrap().unwrap();
        assert_eq!(next.status, PaymentStatus::Failed);
        assert_eq!(next.failed_at, Some(at));
        assert_eq!(next.failure_code.as_deref(), Some("CARD_DECLINED"));
        assert_eq!(t.order_status(), OrderStatus::PaymentFailed);
    }

    #[test]
    fn partial_then_full_refund_moves_payment() {
        let mut payment = pending_payment();
        payment.status = PaymentStatus::Paid;
        let audit = AuditContext::new(AuditSource::Webhook);

        let (partial, _, _) = refunded_payment(&payment, 400, &audit, Utc::now()).unwrap().unwrap();
        assert_eq!(partial.status, PaymentStatus::PartiallyRefunded);

        let (full, snapshot, _) = refunded_payment(&partial, 1000, &audit, Utc::now()).unwrap().unwrap();
        assert_eq!(full.status, PaymentStatus::Refunded);
        assert_eq!(snapshot.before_status.as_deref(), Some("PARTIALLY_REFUNDED"));

        assert!(refunded_payment(&partial, 400, &audit, Utc::now()).unwrap().is_none());
    }
}
