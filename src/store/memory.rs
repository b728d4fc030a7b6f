//! In-memory backend for tests and local runs.
//!
//! All tables sit behind one async mutex, so every call is a single atomic unit of
//! work with the same observable semantics as the Postgres transactions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::api_key::ApiKey;
use crate::models::audit::{AuditContext, PaymentAuditSnapshot};
use crate::models::events::{DomainEvent, NewDomainEvent};
use crate::models::idempotency::{
    IdempotencyClaim, IdempotencyCompletion, IdempotencyRecord, NewIdempotencyClaim,
};
use crate::models::job::{JobHeartbeat, JobRun};
use crate::models::order::{Order, OrderStatus, StoreLocation};
use crate::models::payment::{Payment, PaymentFlow, PaymentStatus};
use crate::models::reconciliation::SettlementReconciliation;
use crate::models::refund::{Refund, RefundStatus};
use crate::models::risk::{
    FraudEvent, PaymentRestriction, PaymentRisk, RestrictionChanges, RestrictionKind, RiskSignal,
    restrictions_for_score,
};
use crate::models::wallet::{WalletDebit, WalletEntry, WalletMovement};
use crate::models::webhook::{
    DeadLetterFailure, DeadLetterStatus, NewWebhookEvent, WebhookDeadLetter, WebhookEvent,
    WebhookReplay,
};
use crate::store::{
    IdempotencyRepository, NewPaymentIntent, OpsRepository, OrderRepository, PaymentRepository,
    PaymentTransition, RefundActivity, RefundOutcome, RefundRepository, RefundTransition,
    RiskRepository, RiskUpdate, TransitionOutcome, WalletRepository, WebhookRepository,
    next_payment, next_refund, payment_audit, payment_created_audit, refund_audit,
    refunded_payment, superseded_intent,
};

#[derive(Default)]
struct Tables {
    api_keys: HashMap<String, ApiKey>,
    stores: HashMap<Uuid, StoreLocation>,
    orders: HashMap<Uuid, Order>,
    payments: HashMap<Uuid, Payment>,
    refunds: HashMap<Uuid, Refund>,
    audits: Vec<PaymentAuditSnapshot>,
    webhook_events: HashMap<Uuid, WebhookEvent>,
    dead_letters: HashMap<Uuid, WebhookDeadLetter>,
    replays: Vec<WebhookReplay>,
    idempotency: HashMap<(Uuid, String, String), IdempotencyRecord>,
    risks: HashMap<(Uuid, Uuid), PaymentRisk>,
    fraud_events: Vec<FraudEvent>,
    restrictions: HashMap<(Uuid, Uuid, RestrictionKind), PaymentRestriction>,
    wallet: Vec<WalletEntry>,
    events: Vec<DomainEvent>,
    reconciliations: Vec<SettlementReconciliation>,
    heartbeats: HashMap<String, JobHeartbeat>,
}

impl Tables {
    fn append_events(&mut self, events: Vec<NewDomainEvent>, at: DateTime<Utc>) {
        self.events
            .extend(events.into_iter().map(|event| event.into_event(at)));
    }

    fn set_order_status(&mut self, order_id: Uuid, status: OrderStatus, at: DateTime<Utc>) {
        if let Some(order) = self.orders.get_mut(&order_id) {
            order.status = status;
            order.updated_at = at;
        }
    }

    fn live_payment_for_order(&self, order_id: Uuid) -> Option<&Payment> {
        self.payments
            .values()
            .find(|p| p.order_id == order_id && p.status.is_live())
    }

    fn completed_refund_total(&self, payment_id: Uuid) -> i64 {
        self.refunds
            .values()
            .filter(|r| r.payment_id == payment_id && r.status == RefundStatus::Completed)
            .map(|r| r.amount)
            .sum()
    }

    fn wallet_balance(&self, tenant_id: Uuid, holder_id: Uuid, currency: &str) -> i64 {
        self.wallet
            .iter()
            .rev()
            .find(|e| e.tenant_id == tenant_id && e.holder_id == holder_id && e.currency == currency)
            .map(|e| e.balance_after)
            .unwrap_or(0)
    }

    fn push_wallet_entry(&mut self, movement: WalletMovement) -> WalletEntry {
        let balance = self.wallet_balance(movement.tenant_id, movement.holder_id, &movement.currency);
        let entry = WalletEntry {
            id: Uuid::new_v4(),
            tenant_id: movement.tenant_id,
            holder_id: movement.holder_id,
            amount: movement.amount,
            balance_after: balance + movement.amount,
            currency: movement.currency,
            reference: movement.reference,
            created_at: movement.at,
        };
        self.wallet.push(entry.clone());
        entry
    }
}

#[derive(Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
    fail_next_webhook_mark: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_store(&self, store: StoreLocation) {
        self.tables.lock().await.stores.insert(store.id, store);
    }

    pub async fn insert_order(&self, order: Order) {
        self.tables.lock().await.orders.insert(order.id, order);
    }

    pub async fn insert_api_key(&self, api_key: ApiKey) {
        self.tables
            .lock()
            .await
            .api_keys
            .insert(api_key.key_hash.clone(), api_key);
    }

    pub async fn set_store_online(&self, store_id: Uuid, online: bool) {
        if let Some(store) = self.tables.lock().await.stores.get_mut(&store_id) {
            store.is_online = online;
        }
    }

    /// Make the next `mark_webhook_processed` call fail, as a lost connection would.
    pub fn fail_next_webhook_mark(&self) {
        self.fail_next_webhook_mark.store(true, Ordering::SeqCst);
    }

    /// Order row without the tenant filter.
    pub async fn order(&self, order_id: Uuid) -> Option<Order> {
        self.tables.lock().await.orders.get(&order_id).cloned()
    }

    /// Every outbox event, published or not, in append order.
    pub async fn domain_events(&self) -> Vec<DomainEvent> {
        self.tables.lock().await.events.clone()
    }

    pub async fn webhook_event_count(&self) -> usize {
        self.tables.lock().await.webhook_events.len()
    }

    pub async fn payments_for_order(&self, order_id: Uuid) -> Vec<Payment> {
        let tables = self.tables.lock().await;
        let mut payments: Vec<Payment> = tables
            .payments
            .values()
            .filter(|p| p.order_id == order_id)
            .cloned()
            .collect();
        payments.sort_by_key(|p| p.created_at);
        payments
    }
}

#[async_trait::async_trait]
impl OrderRepository for InMemoryStore {
    async fn get_order(&self, tenant_id: Uuid, order_id: Uuid) -> Result<Option<Order>, AppError> {
        Ok(self
            .tables
            .lock()
            .await
            .orders
            .get(&order_id)
            .filter(|o| o.tenant_id == tenant_id)
            .cloned())
    }

    async fn get_store_location(
        &self,
        tenant_id: Uuid,
        store_id: Uuid,
    ) -> Result<Option<StoreLocation>, AppError> {
        Ok(self
            .tables
            .lock()
            .await
            .stores
            .get(&store_id)
            .filter(|s| s.tenant_id == tenant_id)
            .cloned())
    }
}

#[async_trait::async_trait]
impl PaymentRepository for InMemoryStore {
    async fn get_payment(&self, payment_id: Uuid) -> Result<Option<Payment>, AppError> {
        Ok(self.tables.lock().await.payments.get(&payment_id).cloned())
    }

    async fn find_payment_by_provider_ref(
        &self,
        provider: &str,
        provider_ref: &str,
    ) -> Result<Option<Payment>, AppError> {
        Ok(self
            .tables
            .lock()
            .await
            .payments
            .values()
            .find(|p| p.provider == provider && p.provider_ref.as_deref() == Some(provider_ref))
            .cloned())
    }

    async fn find_live_payment_for_order(&self, order_id: Uuid) -> Result<Option<Payment>, AppError> {
        Ok(self
            .tables
            .lock()
            .await
            .live_payment_for_order(order_id)
            .cloned())
    }

    async fn create_payment_intent(&self, intent: NewPaymentIntent) -> Result<Payment, AppError> {
        let mut tables = self.tables.lock().await;
        let payment = intent.payment;
        let now = payment.created_at;

        let order = tables
            .orders
            .get(&payment.order_id)
            .filter(|o| o.tenant_id == payment.tenant_id)
            .cloned()
            .ok_or(AppError::OrderNotFound)?;
        if !order.status.is_payable() {
            return Err(AppError::OrderNotPayable(order.status.to_string()));
        }

        if let Some(live) = tables.live_payment_for_order(order.id).cloned() {
            if live.is_open_intent(now) {
                return Err(AppError::PaymentAlreadyExists);
            }
            let (failed, audit, event) = superseded_intent(&live, now)?;
            tables.payments.insert(failed.id, failed);
            tables.audits.push(audit);
            tables.append_events(vec![event], now);
        }

        let audit = payment_created_audit(&payment, &order, &intent.audit);
        tables.payments.insert(payment.id, payment.clone());
        tables.set_order_status(order.id, OrderStatus::PendingPayment, now);
        tables.audits.push(audit);
        tables.append_events(intent.events, now);
        Ok(payment)
    }

    async fn apply_payment_transition(
        &self,
        transition: PaymentTransition,
    ) -> Result<TransitionOutcome, AppError> {
        let mut tables = self.tables.lock().await;
        let current = tables
            .payments
            .get(&transition.payment_id)
            .cloned()
            .ok_or(AppError::PaymentNotFound)?;

        let Some(next) = next_payment(&current, &transition)? else {
            return Ok(TransitionOutcome::Unchanged(current));
        };
        if next.status.is_live() && !current.status.is_live() {
            let other_live = tables
                .live_payment_for_order(current.order_id)
                .is_some_and(|p| p.id != current.id);
            if other_live {
                return Err(AppError::PaymentAlreadyExists);
            }
        }

        let at = transition.at;
        let audit = payment_audit(&current, &next, &transition.audit, at);
        tables.payments.insert(next.id, next.clone());
        tables.set_order_status(current.order_id, transition.order_status(), at);
        tables.audits.push(audit);
        tables.append_events(transition.events, at);
        Ok(TransitionOutcome::Applied {
            before: current,
            after: next,
        })
    }

    async fn attach_provider_intent(
        &self,
        payment_id: Uuid,
        provider_ref: &str,
        client_secret: Option<String>,
        snapshot: serde_json::Value,
        at: DateTime<Utc>,
    ) -> Result<Payment, AppError> {
        let mut tables = self.tables.lock().await;
        let payment = tables
            .payments
            .get_mut(&payment_id)
            .ok_or(AppError::PaymentNotFound)?;
        payment.provider_ref = Some(provider_ref.to_string());
        payment.client_secret = client_secret;
        payment.snapshot = Some(snapshot);
        payment.updated_at = at;
        Ok(payment.clone())
    }

    async fn try_lock_payment(
        &self,
        payment_id: Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let mut tables = self.tables.lock().await;
        let payment = tables
            .payments
            .get_mut(&payment_id)
            .ok_or(AppError::PaymentNotFound)?;
        match payment.locked_at {
            Some(locked_at) if locked_at >= stale_before => Ok(false),
            _ => {
                payment.locked_at = Some(now);
                Ok(true)
            }
        }
    }

    async fn release_payment_lock(&self, payment_id: Uuid) -> Result<(), AppError> {
        if let Some(payment) = self.tables.lock().await.payments.get_mut(&payment_id) {
            payment.locked_at = None;
        }
        Ok(())
    }

    async fn list_stale_payments(
        &self,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Payment>, AppError> {
        let tables = self.tables.lock().await;
        let mut stale: Vec<Payment> = tables
            .payments
            .values()
            .filter(|p| {
                p.flow == PaymentFlow::Provider
                    && p.status.is_live()
                    && p.provider_ref.is_some()
                    && p.updated_at < updated_before
            })
            .cloned()
            .collect();
        stale.sort_by_key(|p| p.updated_at);
        stale.truncate(limit.max(0) as usize);
        Ok(stale)
    }

    async fn list_expired_intents(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Payment>, AppError> {
        let tables = self.tables.lock().await;
        let mut expired: Vec<Payment> = tables
            .payments
            .values()
            .filter(|p| p.status.is_live() && p.is_expired(now))
            .cloned()
            .collect();
        expired.sort_by_key(|p| p.expires_at);
        expired.truncate(limit.max(0) as usize);
        Ok(expired)
    }

    async fn count_recent_failures(
        &self,
        tenant_id: Uuid,
        actor_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<i64, AppError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .payments
            .values()
            .filter(|p| {
                p.tenant_id == tenant_id
                    && p.actor_id == actor_id
                    && p.failed_at.is_some_and(|at| at >= since)
            })
            .count() as i64)
    }

    async fn list_settled_payments(
        &self,
        provider: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Payment>, AppError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .payments
            .values()
            .filter(|p| {
                p.provider == provider
                    && matches!(
                        p.status,
                        PaymentStatus::Paid | PaymentStatus::PartiallyRefunded | PaymentStatus::Refunded
                    )
            })
            .filter(|p| p.paid_at.is_some_and(|at| at >= start && at < end))
            .cloned()
            .collect())
    }

    async fn list_audit_snapshots(&self, payment_id: Uuid) -> Result<Vec<PaymentAuditSnapshot>, AppError> {
        Ok(self
            .tables
            .lock()
            .await
            .audits
            .iter()
            .filter(|a| a.payment_id == payment_id)
            .cloned()
            .collect())
    }
}

#[async_trait::async_trait]
impl RefundRepository for InMemoryStore {
    async fn get_refund(&self, refund_id: Uuid) -> Result<Option<Refund>, AppError> {
        Ok(self.tables.lock().await.refunds.get(&refund_id).cloned())
    }

    async fn list_refunds_for_payment(&self, payment_id: Uuid) -> Result<Vec<Refund>, AppError> {
        let tables = self.tables.lock().await;
        let mut refunds: Vec<Refund> = tables
            .refunds
            .values()
            .filter(|r| r.payment_id == payment_id)
            .cloned()
            .collect();
        refunds.sort_by_key(|r| r.created_at);
        Ok(refunds)
    }

    async fn find_refund_by_provider_ref(
        &self,
        provider: &str,
        provider_ref: &str,
    ) -> Result<Option<Refund>, AppError> {
        Ok(self
            .tables
            .lock()
            .await
            .refunds
            .values()
            .find(|r| r.provider == provider && r.provider_ref.as_deref() == Some(provider_ref))
            .cloned())
    }

    async fn create_refund(
        &self,
        refund: Refund,
        audit: AuditContext,
        events: Vec<NewDomainEvent>,
    ) -> Result<Refund, AppError> {
        let mut tables = self.tables.lock().await;
        let payment = tables
            .payments
            .get(&refund.payment_id)
            .cloned()
            .ok_or(AppError::PaymentNotFound)?;
        if !payment.status.is_refundable() {
            return Err(AppError::PaymentNotRefundable(payment.status.to_string()));
        }

        let outstanding: i64 = tables
            .refunds
            .values()
            .filter(|r| r.payment_id == payment.id && r.status.holds_balance())
            .map(|r| r.amount)
            .sum();
        if outstanding + refund.amount > payment.amount {
            return Err(AppError::RefundExceedsPayment);
        }

        let at = refund.created_at;
        tables.audits.push(refund_audit(None, &refund, &audit, at));
        tables.refunds.insert(refund.id, refund.clone());
        tables.append_events(events, at);
        Ok(refund)
    }

    async fn apply_refund_transition(&self, transition: RefundTransition) -> Result<RefundOutcome, AppError> {
        let mut tables = self.tables.lock().await;
        let current = tables
            .refunds
            .get(&transition.refund_id)
            .cloned()
            .ok_or(AppError::RefundNotFound)?;

        let Some(next) = next_refund(&current, &transition)? else {
            return Ok(RefundOutcome::Unchanged(current));
        };

        // Every fallible step runs before the first write.
        let at = transition.at;
        let payment_move = if next.status == RefundStatus::Completed {
            let payment = tables
                .payments
                .get(&next.payment_id)
                .cloned()
                .ok_or(AppError::PaymentNotFound)?;
            let completed_total = tables.completed_refund_total(payment.id) + next.amount;
            refunded_payment(&payment, completed_total, &transition.audit, at)?
        } else {
            None
        };

        tables
            .audits
            .push(refund_audit(Some(&current), &next, &transition.audit, at));
        tables.refunds.insert(next.id, next.clone());
        tables.append_events(transition.events, at);

        let mut moved = None;
        if let Some((refunded, audit, event)) = payment_move {
            tables.set_order_status(refunded.order_id, OrderStatus::mirroring(refunded.status), at);
            tables.payments.insert(refunded.id, refunded.clone());
            tables.audits.push(audit);
            tables.append_events(vec![event], at);
            moved = Some(refunded);
        }

        Ok(RefundOutcome::Applied {
            refund: next,
            payment: moved,
        })
    }

    async fn attach_refund_reference(
        &self,
        refund_id: Uuid,
        provider_ref: &str,
        snapshot: serde_json::Value,
        at: DateTime<Utc>,
    ) -> Result<Refund, AppError> {
        let mut tables = self.tables.lock().await;
        let refund = tables
            .refunds
            .get_mut(&refund_id)
            .ok_or(AppError::RefundNotFound)?;
        refund.provider_ref = Some(provider_ref.to_string());
        refund.snapshot = Some(snapshot);
        refund.updated_at = at;
        Ok(refund.clone())
    }

    async fn refund_activity(
        &self,
        tenant_id: Uuid,
        actor_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<RefundActivity, AppError> {
        let tables = self.tables.lock().await;
        let actor_refunds: Vec<&Refund> = tables
            .refunds
            .values()
            .filter(|r| r.tenant_id == tenant_id && r.actor_id == actor_id)
            .collect();

        Ok(RefundActivity {
            recent_refunds: actor_refunds.iter().filter(|r| r.created_at >= since).count() as i64,
            refunded_total: actor_refunds
                .iter()
                .filter(|r| r.status == RefundStatus::Completed)
                .map(|r| r.amount)
                .sum(),
            paid_total: tables
                .payments
                .values()
                .filter(|p| p.tenant_id == tenant_id && p.actor_id == actor_id && p.paid_at.is_some())
                .map(|p| p.amount)
                .sum(),
        })
    }

    async fn list_completed_refunds(
        &self,
        provider: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Refund>, AppError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .refunds
            .values()
            .filter(|r| {
                r.provider == provider
                    && r.status == RefundStatus::Completed
                    && r.completed_at.is_some_and(|at| at >= start && at < end)
            })
            .cloned()
            .collect())
    }

    async fn list_stale_refunds(
        &self,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Refund>, AppError> {
        let tables = self.tables.lock().await;
        let mut stale: Vec<Refund> = tables
            .refunds
            .values()
            .filter(|r| r.status == RefundStatus::Processing && r.updated_at < updated_before)
            .cloned()
            .collect();
        stale.sort_by_key(|r| r.updated_at);
        stale.truncate(limit.max(0) as usize);
        Ok(stale)
    }
}

#[async_trait::async_trait]
impl WebhookRepository for InMemoryStore {
    async fn find_webhook_event(
        &self,
        provider: &str,
        event_uuid: &str,
    ) -> Result<Option<WebhookEvent>, AppError> {
        Ok(self
            .tables
            .lock()
            .await
            .webhook_events
            .values()
            .find(|e| e.provider == provider && e.event_uuid == event_uuid)
            .cloned())
    }

    async fn record_webhook_event(&self, event: NewWebhookEvent) -> Result<Option<WebhookEvent>, AppError> {
        let mut tables = self.tables.lock().await;
        let duplicate = tables
            .webhook_events
            .values()
            .any(|e| e.provider == event.provider && e.event_uuid == event.event_uuid);
        if duplicate {
            return Ok(None);
        }

        let stored = WebhookEvent {
            id: Uuid::new_v4(),
            provider: event.provider,
            event_uuid: event.event_uuid,
            event_type: event.event_type,
            payload: event.payload,
            received_at: event.received_at,
            processed_at: None,
        };
        tables.webhook_events.insert(stored.id, stored.clone());
        Ok(Some(stored))
    }

    async fn get_webhook_event(&self, event_id: Uuid) -> Result<Option<WebhookEvent>, AppError> {
        Ok(self.tables.lock().await.webhook_events.get(&event_id).cloned())
    }

    async fn mark_webhook_processed(&self, event_id: Uuid, at: DateTime<Utc>) -> Result<(), AppError> {
        if self.fail_next_webhook_mark.swap(false, Ordering::SeqCst) {
            return Err(AppError::Internal("webhook event store unavailable".to_string()));
        }
        if let Some(event) = self.tables.lock().await.webhook_events.get_mut(&event_id) {
            event.processed_at.get_or_insert(at);
        }
        Ok(())
    }

    async fn list_webhook_events_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        provider: Option<&str>,
    ) -> Result<Vec<WebhookEvent>, AppError> {
        let tables = self.tables.lock().await;
        let mut events: Vec<WebhookEvent> = tables
            .webhook_events
            .values()
            .filter(|e| e.received_at >= from && e.received_at <= to)
            .filter(|e| provider.is_none_or(|name| e.provider == name))
            .cloned()
            .collect();
        events.sort_by_key(|e| e.received_at);
        Ok(events)
    }

    async fn record_dead_letter_failure(
        &self,
        failure: DeadLetterFailure,
        events: Vec<NewDomainEvent>,
    ) -> Result<WebhookDeadLetter, AppError> {
        let mut tables = self.tables.lock().await;
        let at = failure.at;
        let existing = tables
            .dead_letters
            .values_mut()
            .find(|d| d.webhook_event_id == failure.webhook_event_id);

        let dead_letter = match existing {
            Some(dead_letter) => {
                dead_letter.attempt_count += 1;
                dead_letter.status = failure.status;
                dead_letter.error_message = failure.error_message;
                dead_letter.next_retry_at = failure.next_retry_at;
                dead_letter.updated_at = at;
                dead_letter.clone()
            }
            None => {
                let dead_letter = WebhookDeadLetter {
                    id: Uuid::new_v4(),
                    webhook_event_id: failure.webhook_event_id,
                    provider: failure.provider,
                    event_type: failure.event_type,
                    attempt_count: 1,
                    status: failure.status,
                    error_message: failure.error_message,
                    next_retry_at: failure.next_retry_at,
                    created_at: at,
                    updated_at: at,
                };
                tables.dead_letters.insert(dead_letter.id, dead_letter.clone());
                dead_letter
            }
        };
        tables.append_events(events, at);
        Ok(dead_letter)
    }

    async fn get_dead_letter(&self, dead_letter_id: Uuid) -> Result<Option<WebhookDeadLetter>, AppError> {
        Ok(self.tables.lock().await.dead_letters.get(&dead_letter_id).cloned())
    }

    async fn find_dead_letter_for_event(&self, event_id: Uuid) -> Result<Option<WebhookDeadLetter>, AppError> {
        Ok(self
            .tables
            .lock()
            .await
            .dead_letters
            .values()
            .find(|d| d.webhook_event_id == event_id)
            .cloned())
    }

    async fn list_dead_letters(&self, status: Option<DeadLetterStatus>) -> Result<Vec<WebhookDeadLetter>, AppError> {
        let tables = self.tables.lock().await;
        let mut dead_letters: Vec<WebhookDeadLetter> = tables
            .dead_letters
            .values()
            .filter(|d| status.is_none_or(|s| d.status == s))
            .cloned()
            .collect();
        dead_letters.sort_by_key(|d| d.created_at);
        Ok(dead_letters)
    }

    async fn list_due_dead_letters(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<WebhookDeadLetter>, AppError> {
        let tables = self.tables.lock().await;
        let mut due: Vec<WebhookDeadLetter> = tables
            .dead_letters
            .values()
            .filter(|d| {
                d.status == DeadLetterStatus::Failed && d.next_retry_at.is_some_and(|at| at <= now)
            })
            .cloned()
            .collect();
        due.sort_by_key(|d| d.next_retry_at);
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn resolve_dead_letter(&self, dead_letter_id: Uuid, at: DateTime<Utc>) -> Result<(), AppError> {
        let mut tables = self.tables.lock().await;
        let dead_letter = tables
            .dead_letters
            .get_mut(&dead_letter_id)
            .ok_or(AppError::DeadLetterNotFound)?;
        dead_letter.status = DeadLetterStatus::Resolved;
        dead_letter.next_retry_at = None;
        dead_letter.updated_at = at;
        Ok(())
    }

    async fn record_webhook_replay(&self, replay: WebhookReplay) -> Result<(), AppError> {
        self.tables.lock().await.replays.push(replay);
        Ok(())
    }

    async fn list_webhook_replays(&self, event_id: Uuid) -> Result<Vec<WebhookReplay>, AppError> {
        Ok(self
            .tables
            .lock()
            .await
            .replays
            .iter()
            .filter(|r| r.webhook_event_id == event_id)
            .cloned()
            .collect())
    }
}

#[async_trait::async_trait]
impl IdempotencyRepository for InMemoryStore {
    async fn claim_idempotency_key(&self, claim: NewIdempotencyClaim) -> Result<IdempotencyClaim, AppError> {
        let mut tables = self.tables.lock().await;
        let id = (claim.tenant_id, claim.key.clone(), claim.route.clone());

        if let Some(existing) = tables.idempotency.get(&id).filter(|r| r.expires_at > claim.now) {
            return Ok(if existing.request_hash != claim.request_hash {
                IdempotencyClaim::PayloadMismatch
            } else if existing.status_code.is_some() {
                IdempotencyClaim::Completed(existing.clone())
            } else {
                IdempotencyClaim::InProgress
            });
        }

        tables.idempotency.insert(
            id,
            IdempotencyRecord {
                tenant_id: claim.tenant_id,
                key: claim.key,
                route: claim.route,
                request_hash: claim.request_hash,
                status_code: None,
                response_body: None,
                entity_id: None,
                created_at: claim.now,
                expires_at: claim.expires_at,
                completed_at: None,
            },
        );
        Ok(IdempotencyClaim::Claimed)
    }

    async fn complete_idempotency_key(
        &self,
        tenant_id: Uuid,
        key: &str,
        route: &str,
        completion: IdempotencyCompletion,
    ) -> Result<(), AppError> {
        let mut tables = self.tables.lock().await;
        if let Some(record) = tables
            .idempotency
            .get_mut(&(tenant_id, key.to_string(), route.to_string()))
        {
            record.status_code = Some(completion.status_code);
            record.response_body = Some(completion.response_body);
            record.entity_id = completion.entity_id;
            record.completed_at = Some(completion.at);
            record.expires_at = completion.expires_at;
        }
        Ok(())
    }

    async fn release_idempotency_key(&self, tenant_id: Uuid, key: &str, route: &str) -> Result<(), AppError> {
        let mut tables = self.tables.lock().await;
        let id = (tenant_id, key.to_string(), route.to_string());
        if tables
            .idempotency
            .get(&id)
            .is_some_and(|r| r.status_code.is_none())
        {
            tables.idempotency.remove(&id);
        }
        Ok(())
    }

    async fn purge_idempotency_keys(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        let mut tables = self.tables.lock().await;
        let before = tables.idempotency.len();
        tables.idempotency.retain(|_, r| r.expires_at > now);
        Ok((before - tables.idempotency.len()) as u64)
    }
}

#[async_trait::async_trait]
impl RiskRepository for InMemoryStore {
    async fn get_risk(&self, tenant_id: Uuid, actor_id: Uuid) -> Result<Option<PaymentRisk>, AppError> {
        Ok(self
            .tables
            .lock()
            .await
            .risks
            .get(&(tenant_id, actor_id))
            .cloned())
    }

    async fn apply_risk_signal(&self, signal: RiskSignal) -> Result<RiskUpdate, AppError> {
        let mut tables = self.tables.lock().await;
        let risk = tables
            .risks
            .entry((signal.tenant_id, signal.actor_id))
            .or_insert_with(|| PaymentRisk::clean(signal.tenant_id, signal.actor_id, signal.at));
        let previous_level = risk.level;
        risk.apply_delta(signal.delta, signal.at);
        let risk = risk.clone();

        let event = FraudEvent {
            id: Uuid::new_v4(),
            tenant_id: signal.tenant_id,
            actor_id: signal.actor_id,
            signal: signal.signal,
            delta: signal.delta,
            score_after: risk.score,
            payload: signal.payload,
            created_at: signal.at,
        };
        tables.fraud_events.push(event.clone());
        Ok(RiskUpdate {
            previous_level,
            risk,
            event,
        })
    }

    async fn active_restrictions(
        &self,
        tenant_id: Uuid,
        actor_id: Uuid,
    ) -> Result<Vec<PaymentRestriction>, AppError> {
        let tables = self.tables.lock().await;
        let mut active: Vec<PaymentRestriction> = tables
            .restrictions
            .values()
            .filter(|r| r.tenant_id == tenant_id && r.actor_id == actor_id && r.active)
            .cloned()
            .collect();
        active.sort_by_key(|r| r.kind.as_str());
        Ok(active)
    }

    async fn sync_restrictions(
        &self,
        tenant_id: Uuid,
        actor_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<RestrictionChanges, AppError> {
        let mut tables = self.tables.lock().await;
        let risk = tables
            .risks
            .get(&(tenant_id, actor_id))
            .cloned()
            .unwrap_or_else(|| PaymentRisk::clean(tenant_id, actor_id, at));
        let wanted = restrictions_for_score(risk.score);
        let reason = risk.restriction_reason();
        let mut changes = RestrictionChanges {
            score: risk.score,
            ..RestrictionChanges::default()
        };

        for &kind in RestrictionKind::ALL {
            let key = (tenant_id, actor_id, kind);
            let active = tables.restrictions.get(&key).is_some_and(|r| r.active);
            let want = wanted.contains(&kind);

            if want && !active {
                tables.restrictions.insert(
                    key,
                    PaymentRestriction {
                        tenant_id,
                        actor_id,
                        kind,
                        active: true,
                        reason: reason.clone(),
                        activated_at: at,
                        lifted_at: None,
                    },
                );
                changes.activated.push(kind);
            } else if !want && active {
                if let Some(restriction) = tables.restrictions.get_mut(&key) {
                    restriction.active = false;
                    restriction.lifted_at = Some(at);
                }
                changes.lifted.push(kind);
            }
        }
        Ok(changes)
    }

    async fn decay_risk_scores(&self, amount: i32, at: DateTime<Utc>) -> Result<Vec<PaymentRisk>, AppError> {
        let mut tables = self.tables.lock().await;
        let mut changed = Vec::new();
        for risk in tables.risks.values_mut().filter(|r| r.score > 0) {
            risk.apply_delta(-amount, at);
            changed.push(risk.clone());
        }
        Ok(changed)
    }

    async fn list_fraud_events(
        &self,
        tenant_id: Uuid,
        actor_id: Uuid,
        limit: i64,
    ) -> Result<Vec<FraudEvent>, AppError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .fraud_events
            .iter()
            .rev()
            .filter(|e| e.tenant_id == tenant_id && e.actor_id == actor_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}

#[async_trait::async_trait]
impl WalletRepository for InMemoryStore {
    async fn wallet_debit(&self, movement: WalletMovement) -> Result<WalletDebit, AppError> {
        let mut tables = self.tables.lock().await;
        if let Some(entry) = tables.wallet.iter().find(|e| e.reference == movement.reference) {
            return Ok(WalletDebit::Applied(entry.clone()));
        }

        let balance = tables.wallet_balance(movement.tenant_id, movement.holder_id, &movement.currency);
        if balance + movement.amount < 0 {
            return Ok(WalletDebit::InsufficientFunds { balance });
        }
        Ok(WalletDebit::Applied(tables.push_wallet_entry(movement)))
    }

    async fn wallet_credit(&self, movement: WalletMovement) -> Result<WalletEntry, AppError> {
        let mut tables = self.tables.lock().await;
        if let Some(entry) = tables.wallet.iter().find(|e| e.reference == movement.reference) {
            return Ok(entry.clone());
        }
        Ok(tables.push_wallet_entry(movement))
    }

    async fn wallet_entry(&self, reference: &str) -> Result<Option<WalletEntry>, AppError> {
        Ok(self
            .tables
            .lock()
            .await
            .wallet
            .iter()
            .find(|e| e.reference == reference)
            .cloned())
    }
}

#[async_trait::async_trait]
impl OpsRepository for InMemoryStore {
    async fn ping(&self) -> Result<(), AppError> {
        Ok(())
    }

    async fn find_api_key(&self, key_hash: &str) -> Result<Option<ApiKey>, AppError> {
        Ok(self
            .tables
            .lock()
            .await
            .api_keys
            .get(key_hash)
            .filter(|k| k.is_active)
            .cloned())
    }

    async fn append_domain_events(&self, events: Vec<NewDomainEvent>, at: DateTime<Utc>) -> Result<(), AppError> {
        self.tables.lock().await.append_events(events, at);
        Ok(())
    }

    async fn pending_domain_events(&self, limit: i64) -> Result<Vec<DomainEvent>, AppError> {
        Ok(self
            .tables
            .lock()
            .await
            .events
            .iter()
            .filter(|e| e.published_at.is_none())
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn mark_events_published(&self, event_ids: &[Uuid], at: DateTime<Utc>) -> Result<(), AppError> {
        let mut tables = self.tables.lock().await;
        for event in tables.events.iter_mut().filter(|e| event_ids.contains(&e.id)) {
            event.published_at.get_or_insert(at);
        }
        Ok(())
    }

    async fn record_reconciliation(
        &self,
        reconciliation: SettlementReconciliation,
        events: Vec<NewDomainEvent>,
    ) -> Result<(), AppError> {
        let mut tables = self.tables.lock().await;
        let at = reconciliation.created_at;
        tables.reconciliations.push(reconciliation);
        tables.append_events(events, at);
        Ok(())
    }

    async fn list_reconciliations(
        &self,
        provider: Option<&str>,
        limit: i64,
    ) -> Result<Vec<SettlementReconciliation>, AppError> {
        Ok(self
            .tables
            .lock()
            .await
            .reconciliations
            .iter()
            .rev()
            .filter(|r| provider.is_none_or(|name| r.provider == name))
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn record_job_run(&self, run: JobRun) -> Result<JobHeartbeat, AppError> {
        let mut tables = self.tables.lock().await;
        let heartbeat = tables
            .heartbeats
            .entry(run.job_name.clone())
            .and_modify(|h| h.fold(&run))
            .or_insert_with(|| JobHeartbeat::first(&run));
        Ok(heartbeat.clone())
    }

    async fn list_job_heartbeats(&self) -> Result<Vec<JobHeartbeat>, AppError> {
        let mut heartbeats: Vec<JobHeartbeat> = self
            .tables
            .lock()
            .await
            .heartbeats
            .values()
            .cloned()
            .collect();
        heartbeats.sort_by(|a, b| a.job_name.cmp(&b.job_name));
        Ok(heartbeats)
    }
}
