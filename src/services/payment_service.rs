//! Payment command service.
//!
//! Orchestrates intent creation, confirmation, failure, cancellation, retry, void and
//! admin correction. Provider calls always happen before (never inside) the unit of work
//! that commits their outcome; every status write goes through
//! [`PaymentRepository::apply_payment_transition`](crate::store::PaymentRepository::apply_payment_transition),
//! which re-reads and guards the row atomically.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::{PaymentSettings, RetryPolicy};
use crate::error::AppError;
use crate::models::audit::{AuditContext, AuditSource, PaymentAuditSnapshot};
use crate::models::events::{EventKind, NewDomainEvent};
use crate::models::order::{Order, OrderStatus};
use crate::models::payment::{
    CASH_PROVIDER, Payment, PaymentFlow, PaymentStatus, StartCashierPaymentRequest,
    StartPaymentRequest,
};
use crate::models::risk::FraudSignal;
use crate::providers::{
    CanonicalStatus, IntentMetadata, IntentResult, LookupResult, PaymentProvider, ProviderError,
    ProviderErrorCode, ProviderRegistry, wallet, with_retry,
};
use crate::services::risk::RiskEngine;
use crate::store::{NewPaymentIntent, PaymentTransition, Store, TransitionMode, TransitionOutcome};

/// Statuses at which a confirmation is already reflected.
const CONFIRMED: &[PaymentStatus] = &[
    PaymentStatus::Paid,
    PaymentStatus::PartiallyRefunded,
    PaymentStatus::Refunded,
];

/// Statuses at which an expiry has nothing left to do.
const SETTLED: &[PaymentStatus] = &[
    PaymentStatus::Paid,
    PaymentStatus::PartiallyRefunded,
    PaymentStatus::Refunded,
    PaymentStatus::Failed,
    PaymentStatus::Cancelled,
];

/// Failed payments in this window feed the velocity signal.
const FAILURE_VELOCITY_WINDOW_MINUTES: i64 = 60;
const FAILURE_VELOCITY_THRESHOLD: i64 = 3;

/// Provider-reported failure to apply to a payment.
#[derive(Debug, Clone)]
pub struct FailureReport {
    pub code: ProviderErrorCode,
    pub reason: Option<String>,
    pub snapshot: Option<serde_json::Value>,
}

pub fn payment_event(kind: EventKind, payment: &Payment) -> NewDomainEvent {
    NewDomainEvent::new(
        kind,
        payment.tenant_id,
        payment.id,
        json!({
            "payment_id": payment.id,
            "order_id": payment.order_id,
            "actor_id": payment.actor_id,
            "amount": payment.amount,
            "currency": payment.currency,
            "provider": payment.provider,
        }),
    )
}

fn failure_event(payment: &Payment, code: ProviderErrorCode, reason: Option<&str>) -> NewDomainEvent {
    NewDomainEvent::new(
        EventKind::PaymentFailed,
        payment.tenant_id,
        payment.id,
        json!({
            "payment_id": payment.id,
            "order_id": payment.order_id,
            "actor_id": payment.actor_id,
            "amount": payment.amount,
            "currency": payment.currency,
            "provider": payment.provider,
            "failure_code": code,
            "reason": reason,
        }),
    )
}

#[derive(Clone)]
pub struct PaymentService {
    store: Arc<dyn Store>,
    providers: ProviderRegistry,
    risk: RiskEngine,
    clock: Arc<dyn Clock>,
    settings: PaymentSettings,
    retry: RetryPolicy,
}

impl PaymentService {
    pub fn new(
        store: Arc<dyn Store>,
        providers: ProviderRegistry,
        risk: RiskEngine,
        clock: Arc<dyn Clock>,
        settings: PaymentSettings,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            providers,
            risk,
            clock,
            settings,
            retry,
        }
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    /// Start a provider payment for an order.
    ///
    /// Returns the payment and whether it was created by this call; an open intent
    /// for the order is returned as-is.
    ///
    /// # Process
    ///
    /// 1. Resolve the provider and the order (tenant-scoped, payable)
    /// 2. Return the live intent if one is still open
    /// 3. Risk gate, then the offline-store gate
    /// 4. `create_intent` at the provider, keyed by the new payment id
    /// 5. Persist the `PENDING` payment with its expiry and an order-pricing audit
    ///
    /// # Errors
    ///
    /// - `UNSUPPORTED_PROVIDER`, `ORDER_NOT_FOUND`, `ORDER_NOT_PAYABLE`
    /// - `PAYMENT_REQUIRES_MANUAL_REVIEW`, `PAYMENT_LOCKED_BY_RISK_POLICY`, `PAYMENT_DISABLED_OFFLINE`
    /// - Provider errors. A permanent one leaves a `FAILED` payment behind; a transient
    ///   one persists nothing.
    pub async fn start_payment(
        &self,
        tenant_id: Uuid,
        request: StartPaymentRequest,
    ) -> Result<(Payment, bool), AppError> {
        let provider = self.providers.get(&request.provider)?;
        let order = self.payable_order(tenant_id, request.order_id).await?;

        if let Some(live) = self.open_intent(order.id).await? {
            return Ok((live, false));
        }

        self.gate(tenant_id, request.actor_id, provider.name()).await?;
        if provider.name() != wallet::NAME {
            let online = self
                .store
                .get_store_location(tenant_id, order.store_id)
                .await?
                .is_none_or(|store| store.is_online);
            if !online {
                tracing::info!(order_id = %order.id, provider = %provider.name(), "store offline, payment refused");
                return Err(AppError::PaymentDisabledOffline);
            }
        }

        let now = self.clock.now();
        let mut payment = self.new_payment(&order, request.actor_id, PaymentFlow::Provider, provider.name(), now);
        payment.expires_at = Some(now + self.settings.intent_ttl);

        let intent = match self.create_intent(provider.as_ref(), &payment).await {
            Ok(intent) => intent,
            Err(err) if err.code.is_transient() => {
                tracing::warn!(order_id = %order.id, provider = %provider.name(), code = %err.code, "intent creation failed");
                return Err(err.into());
            }
            Err(err) => {
                tracing::warn!(order_id = %order.id, provider = %provider.name(), code = %err.code, "intent rejected by provider");
                self.record_rejected_intent(payment, &order, &err).await?;
                return Err(err.into());
            }
        };

        payment.provider_ref = Some(intent.provider_ref.clone());
        payment.client_secret = intent.client_secret.clone();
        payment.snapshot = Some(intent.snapshot.clone());

        let created = match self.persist_intent(payment).await {
            Ok(created) => created,
            Err(AppError::PaymentAlreadyExists) => {
                // Lost the race against a concurrent start for the same order
                return match self.open_intent(order.id).await? {
                    Some(live) => Ok((live, false)),
                    None => Err(AppError::PaymentAlreadyExists),
                };
            }
            Err(err) => return Err(err),
        };

        tracing::info!(
            payment_id = %created.id,
            order_id = %order.id,
            provider = %created.provider,
            amount = created.amount,
            "payment intent created"
        );

        let payment = match intent.status {
            CanonicalStatus::Paid => {
                self.confirm_from_provider_event(
                    created.id,
                    &intent.provider_ref,
                    intent.snapshot,
                    AuditContext::new(AuditSource::Command),
                )
                .await?
            }
            _ => created,
        };
        Ok((payment, true))
    }

    /// Open a cashier payment: no provider, no expiry, confirmed by the operator.
    pub async fn start_cashier_payment(
        &self,
        tenant_id: Uuid,
        request: StartCashierPaymentRequest,
    ) -> Result<(Payment, bool), AppError> {
        let order = self.payable_order(tenant_id, request.order_id).await?;
        if let Some(live) = self.open_intent(order.id).await? {
            return Ok((live, false));
        }
        self.gate(tenant_id, request.actor_id, CASH_PROVIDER).await?;

        let now = self.clock.now();
        let payment = self.new_payment(&order, request.actor_id, PaymentFlow::Cashier, CASH_PROVIDER, now);
        let created = self.persist_intent(payment).await?;
        tracing::info!(payment_id = %created.id, order_id = %order.id, "cashier payment opened");
        Ok((created, true))
    }

    /// Tenant-scoped read. Another tenant's payment is reported as missing.
    pub async fn get_payment(&self, tenant_id: Uuid, payment_id: Uuid) -> Result<Payment, AppError> {
        self.store
            .get_payment(payment_id)
            .await?
            .filter(|p| p.tenant_id == tenant_id)
            .ok_or(AppError::PaymentNotFound)
    }

    pub async fn audit_trail(
        &self,
        tenant_id: Uuid,
        payment_id: Uuid,
    ) -> Result<Vec<PaymentAuditSnapshot>, AppError> {
        let payment = self.get_payment(tenant_id, payment_id).await?;
        self.store.list_audit_snapshots(payment.id).await
    }

    /// Confirm a payment on the client's request.
    ///
    /// Provider payments are looked up at the provider under the confirm-in-progress
    /// lock; cashier payments are confirmed directly by the operator.
    ///
    /// # Errors
    ///
    /// - `PAYMENT_IN_PROGRESS` when another confirmation holds the lock
    /// - `INVALID_PAYMENT_TRANSITION` when the payment is failed or cancelled
    pub async fn confirm_payment(
        &self,
        tenant_id: Uuid,
        payment_id: Uuid,
        operator: &str,
    ) -> Result<Payment, AppError> {
        let payment = self.get_payment(tenant_id, payment_id).await?;
        if CONFIRMED.contains(&payment.status) {
            return Ok(payment);
        }
        if !payment.status.is_live() {
            return Err(AppError::InvalidPaymentTransition {
                from: payment.status.to_string(),
                to: PaymentStatus::Paid.to_string(),
            });
        }

        self.with_lock(&payment, async {
            match payment.flow {
                PaymentFlow::Cashier => {
                    let outcome = self
                        .confirm(
                            payment.id,
                            None,
                            None,
                            AuditContext::new(AuditSource::Cashier).operator(operator),
                        )
                        .await?;
                    Ok(outcome.into_payment())
                }
                PaymentFlow::Provider => {
                    let lookup = self.lookup(&payment).await?;
                    self.apply_lookup(&payment, lookup, AuditContext::new(AuditSource::Command).operator(operator))
                        .await
                }
            }
        })
        .await
    }

    /// Apply a provider-reported success. Already-confirmed payments are returned unchanged.
    pub async fn confirm_from_provider_event(
        &self,
        payment_id: Uuid,
        provider_ref: &str,
        snapshot: serde_json::Value,
        audit: AuditContext,
    ) -> Result<Payment, AppError> {
        let outcome = self
            .confirm(payment_id, Some(provider_ref.to_string()), Some(snapshot), audit)
            .await?;
        Ok(outcome.into_payment())
    }

    /// Apply a provider-reported failure and feed the matching risk signal.
    pub async fn mark_failed_from_provider(
        &self,
        payment_id: Uuid,
        failure: FailureReport,
        audit: AuditContext,
    ) -> Result<Payment, AppError> {
        let current = self
            .store
            .get_payment(payment_id)
            .await?
            .ok_or(AppError::PaymentNotFound)?;

        let mut transition = PaymentTransition::new(payment_id, PaymentStatus::Failed, audit, self.clock.now());
        transition.unchanged_if = &[PaymentStatus::Failed];
        transition.changes.failure_code = Some(failure.code.to_string());
        transition.changes.failure_reason = failure.reason.clone();
        transition.changes.snapshot = failure.snapshot;
        transition.events = vec![failure_event(&current, failure.code, failure.reason.as_deref())];

        let outcome = self.store.apply_payment_transition(transition).await?;
        if outcome.was_applied() {
            tracing::warn!(payment_id = %payment_id, code = %failure.code, "payment failed");
            self.signal_failure(outcome.payment(), failure.code).await;
        }
        Ok(outcome.into_payment())
    }

    /// Apply a provider-reported cancellation; the order is cancelled and its inventory released.
    pub async fn cancel_from_provider(
        &self,
        payment_id: Uuid,
        snapshot: Option<serde_json::Value>,
        audit: AuditContext,
    ) -> Result<Payment, AppError> {
        let current = self
            .store
            .get_payment(payment_id)
            .await?
            .ok_or(AppError::PaymentNotFound)?;

        let mut transition = PaymentTransition::new(payment_id, PaymentStatus::Cancelled, audit, self.clock.now());
        transition.unchanged_if = &[PaymentStatus::Cancelled];
        transition.changes.snapshot = snapshot;
        transition.events = vec![
            payment_event(EventKind::PaymentCancelled, &current),
            payment_event(EventKind::InventoryReleaseRequested, &current),
        ];

        let outcome = self.store.apply_payment_transition(transition).await?;
        if outcome.was_applied() {
            tracing::info!(payment_id = %payment_id, "payment cancelled by provider");
        }
        Ok(outcome.into_payment())
    }

    /// Retry a failed payment.
    ///
    /// # Process
    ///
    /// 1. Refuse exhausted, fraud-flagged, cooling-down or risk-blocked payments
    ///    without touching the provider
    /// 2. `FAILED -> RETRYING`, count the attempt, open a fresh expiry window
    /// 3. Re-check the intent at the provider (or create one if the first never existed)
    ///
    /// A provider outage in step 3 leaves the payment `RETRYING` for the polling job.
    ///
    /// # Errors
    ///
    /// `MAX_RETRIES_EXCEEDED`, `PAYMENT_NOT_RETRYABLE`, `RETRY_COOLDOWN_ACTIVE`,
    /// `PAYMENT_LOCKED_BY_RISK_POLICY`, `INVALID_PAYMENT_TRANSITION`.
    pub async fn retry_failed_payment(
        &self,
        tenant_id: Uuid,
        payment_id: Uuid,
        operator: &str,
    ) -> Result<Payment, AppError> {
        let payment = self.get_payment(tenant_id, payment_id).await?;
        if payment.status != PaymentStatus::Failed {
            return Err(AppError::InvalidPaymentTransition {
                from: payment.status.to_string(),
                to: PaymentStatus::Retrying.to_string(),
            });
        }
        if payment.retries >= payment.max_retries {
            return Err(AppError::MaxRetriesExceeded);
        }
        if let Some(code) = payment.failure_code.as_deref() {
            let retryable = code
                .parse::<ProviderErrorCode>()
                .map(ProviderErrorCode::is_retryable)
                .unwrap_or(true);
            if !retryable {
                return Err(AppError::PaymentNotRetryable(code.to_string()));
            }
        }

        let now = self.clock.now();
        if let Some(last_retry_at) = payment.last_retry_at {
            let retry_after = last_retry_at + self.settings.retry_cooldown;
            if retry_after > now {
                return Err(AppError::RetryCooldownActive { retry_after });
            }
        }
        if let Err(err) = self.risk.gate_retry(tenant_id, payment.actor_id).await {
            tracing::info!(payment_id = %payment_id, code = err.code(), "retry refused by risk policy");
            return Err(err);
        }

        let audit = AuditContext::new(AuditSource::Command).operator(operator);
        let mut transition = PaymentTransition::new(payment.id, PaymentStatus::Retrying, audit.clone(), now);
        transition.changes.count_retry = true;
        if payment.flow == PaymentFlow::Provider {
            transition.changes.expires_at = Some(now + self.settings.intent_ttl);
        }
        transition.events = vec![payment_event(EventKind::PaymentRetrying, &payment)];
        let retrying = self.store.apply_payment_transition(transition).await?.into_payment();

        tracing::info!(payment_id = %payment_id, retries = retrying.retries, "payment retrying");
        if retrying.flow == PaymentFlow::Cashier {
            return Ok(retrying);
        }

        self.with_lock(&retrying, async {
            let lookup = match retrying.provider_ref {
                Some(_) => self.lookup(&retrying).await,
                None => self.reissue_intent(&retrying).await,
            };
            match lookup {
                Ok(lookup) => self.apply_lookup(&retrying, lookup, audit).await,
                Err(AppError::Provider(err)) if err.code.is_transient() => {
                    tracing::warn!(payment_id = %retrying.id, code = %err.code, "retry lookup deferred to reconciliation");
                    Ok(retrying.clone())
                }
                Err(err) => Err(err),
            }
        })
        .await
    }

    /// Void a pending payment at the merchant's request.
    pub async fn void_payment(
        &self,
        tenant_id: Uuid,
        payment_id: Uuid,
        reason: &str,
        operator: &str,
    ) -> Result<Payment, AppError> {
        if reason.trim().is_empty() {
            return Err(AppError::InvalidRequest("reason is required".to_string()));
        }
        let payment = self.get_payment(tenant_id, payment_id).await?;
        if payment.status != PaymentStatus::Pending {
            return Err(AppError::InvalidPaymentTransition {
                from: payment.status.to_string(),
                to: PaymentStatus::Cancelled.to_string(),
            });
        }

        let audit = AuditContext::new(AuditSource::Command).operator(operator).reason(reason);
        let mut transition = PaymentTransition::new(payment.id, PaymentStatus::Cancelled, audit, self.clock.now());
        transition.changes.voided = true;
        transition.events = vec![
            payment_event(EventKind::PaymentCancelled, &payment),
            payment_event(EventKind::InventoryReleaseRequested, &payment),
        ];

        let voided = self.store.apply_payment_transition(transition).await?.into_payment();
        tracing::info!(payment_id = %payment_id, operator, "payment voided");
        Ok(voided)
    }

    /// Admin override of a payment's status, checked against the override table.
    pub async fn correct_payment(
        &self,
        tenant_id: Uuid,
        payment_id: Uuid,
        status: PaymentStatus,
        reason: &str,
        operator: &str,
    ) -> Result<Payment, AppError> {
        if reason.trim().is_empty() {
            return Err(AppError::InvalidRequest("reason is required".to_string()));
        }
        let payment = self.get_payment(tenant_id, payment_id).await?;

        let audit = AuditContext::new(AuditSource::Admin).operator(operator).reason(reason);
        let mut transition = PaymentTransition::new(payment.id, status, audit, self.clock.now());
        transition.mode = TransitionMode::Override;
        transition.events = vec![NewDomainEvent::new(
            EventKind::PaymentCorrected,
            payment.tenant_id,
            payment.id,
            json!({
                "payment_id": payment.id,
                "order_id": payment.order_id,
                "from": payment.status,
                "to": status,
                "reason": reason,
                "operator": operator,
            }),
        )];

        let corrected = self.store.apply_payment_transition(transition).await?.into_payment();
        tracing::warn!(
            payment_id = %payment_id,
            from = %payment.status,
            to = %status,
            operator,
            "payment status overridden"
        );
        Ok(corrected)
    }

    /// Settle an intent whose expiry has passed.
    ///
    /// The provider gets the last word first: an intent it reports paid or failed is
    /// applied as such. Otherwise the payment fails with `PROVIDER_TIMEOUT`, the order
    /// is cancelled and its inventory released.
    pub async fn expire_intent(&self, payment: &Payment) -> Result<Payment, AppError> {
        if payment.flow == PaymentFlow::Provider && payment.provider_ref.is_some() {
            match self.lookup(payment).await {
                Ok(lookup) if matches!(lookup.status, CanonicalStatus::Paid | CanonicalStatus::Failed) => {
                    return self
                        .apply_lookup(payment, lookup, AuditContext::new(AuditSource::Reconciliation))
                        .await;
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(payment_id = %payment.id, error = %err, "lookup before expiry failed");
                }
            }
        }

        let audit = AuditContext::new(AuditSource::Timeout).reason("payment intent expired");
        let mut transition = PaymentTransition::new(payment.id, PaymentStatus::Failed, audit, self.clock.now());
        transition.unchanged_if = SETTLED;
        transition.changes.failure_code = Some(ProviderErrorCode::ProviderTimeout.to_string());
        transition.changes.failure_reason = Some("payment intent expired".to_string());
        transition.order_status = Some(OrderStatus::Cancelled);
        transition.events = vec![
            failure_event(payment, ProviderErrorCode::ProviderTimeout, Some("payment intent expired")),
            payment_event(EventKind::InventoryReleaseRequested, payment),
        ];

        let outcome = self.store.apply_payment_transition(transition).await?;
        if outcome.was_applied() {
            tracing::info!(payment_id = %payment.id, order_id = %payment.order_id, "payment intent timed out");
            self.signal(payment, FraudSignal::Timeout).await;
        }
        Ok(outcome.into_payment())
    }

    /// Poll the provider for a live payment and apply a diverging status.
    ///
    /// Returns `true` when the payment changed.
    pub async fn reconcile_payment(&self, payment: &Payment) -> Result<bool, AppError> {
        let lookup = self.lookup(payment).await?;
        if !matches!(lookup.status, CanonicalStatus::Paid | CanonicalStatus::Failed) {
            return Ok(false);
        }
        let before = payment.status;
        let after = self
            .apply_lookup(payment, lookup, AuditContext::new(AuditSource::Reconciliation))
            .await?;
        Ok(after.status != before)
    }

    async fn payable_order(&self, tenant_id: Uuid, order_id: Uuid) -> Result<Order, AppError> {
        let order = self
            .store
            .get_order(tenant_id, order_id)
            .await?
            .ok_or(AppError::OrderNotFound)?;
        if !order.status.is_payable() {
            return Err(AppError::OrderNotPayable(order.status.to_string()));
        }
        Ok(order)
    }

    async fn open_intent(&self, order_id: Uuid) -> Result<Option<Payment>, AppError> {
        let now = self.clock.now();
        Ok(self
            .store
            .find_live_payment_for_order(order_id)
            .await?
            .filter(|p| p.is_open_intent(now)))
    }

    async fn gate(&self, tenant_id: Uuid, actor_id: Uuid, provider: &str) -> Result<(), AppError> {
        self.risk
            .gate_payment(tenant_id, actor_id, provider)
            .await
            .inspect_err(|err| {
                if err.is_policy() {
                    tracing::info!(actor_id = %actor_id, code = err.code(), "payment refused by risk policy");
                }
            })
    }

    fn new_payment(
        &self,
        order: &Order,
        actor_id: Uuid,
        flow: PaymentFlow,
        provider: &str,
        now: DateTime<Utc>,
    ) -> Payment {
        Payment {
            id: Uuid::new_v4(),
            tenant_id: order.tenant_id,
            store_id: order.store_id,
            order_id: order.id,
            actor_id,
            amount: order.total_amount,
            currency: order.currency.clone(),
            flow,
            provider: provider.to_string(),
            provider_ref: None,
            client_secret: None,
            status: PaymentStatus::Pending,
            failure_code: None,
            failure_reason: None,
            retries: 0,
            max_retries: self.settings.default_max_retries,
            last_retry_at: None,
            expires_at: None,
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

    async fn persist_intent(&self, payment: Payment) -> Result<Payment, AppError> {
        let events = vec![payment_event(EventKind::PaymentIntentCreated, &payment)];
        self.store
            .create_payment_intent(NewPaymentIntent {
                payment,
                audit: AuditContext::new(AuditSource::Command),
                events,
            })
            .await
    }

    /// Keep a record of an intent the provider refused outright.
    async fn record_rejected_intent(
        &self,
        payment: Payment,
        order: &Order,
        err: &ProviderError,
    ) -> Result<(), AppError> {
        let created = match self.persist_intent(payment).await {
            Ok(created) => created,
            Err(AppError::PaymentAlreadyExists) => return Ok(()),
            Err(persist_err) => return Err(persist_err),
        };
        tracing::debug!(payment_id = %created.id, order_id = %order.id, "recording rejected intent");
        self.mark_failed_from_provider(
            created.id,
            FailureReport {
                code: err.code,
                reason: Some(err.message.clone()),
                snapshot: None,
            },
            AuditContext::new(AuditSource::Command),
        )
        .await?;
        Ok(())
    }

    async fn create_intent(
        &self,
        provider: &dyn PaymentProvider,
        payment: &Payment,
    ) -> Result<IntentResult, ProviderError> {
        let metadata = IntentMetadata {
            payment_id: payment.id,
            order_id: payment.order_id,
            tenant_id: payment.tenant_id,
            actor_id: payment.actor_id,
        };
        let metadata = &metadata;
        let currency = payment.currency.as_str();
        let amount = payment.amount;
        with_retry(self.retry, "create_intent", move || {
            provider.create_intent(amount, currency, metadata)
        })
        .await
    }

    /// Create a provider intent for a retrying payment that never got one.
    async fn reissue_intent(&self, payment: &Payment) -> Result<LookupResult, AppError> {
        let provider = self.providers.get(&payment.provider)?;
        let intent = self.create_intent(provider.as_ref(), payment).await?;
        self.store
            .attach_provider_intent(
                payment.id,
                &intent.provider_ref,
                intent.client_secret.clone(),
                intent.snapshot.clone(),
                self.clock.now(),
            )
            .await?;
        Ok(LookupResult {
            provider_ref: intent.provider_ref,
            status: intent.status,
            failure_code: None,
            failure_reason: None,
            snapshot: intent.snapshot,
        })
    }

    async fn lookup(&self, payment: &Payment) -> Result<LookupResult, AppError> {
        let provider = self.providers.get(&payment.provider)?;
        let provider = provider.as_ref();
        let provider_ref = payment
            .provider_ref
            .as_deref()
            .ok_or_else(|| AppError::Internal(format!("payment {} has no provider reference", payment.id)))?;
        let lookup = with_retry(self.retry, "lookup", move || provider.lookup(provider_ref)).await?;
        Ok(lookup)
    }

    /// Apply what the provider reports for a payment. Non-final statuses change nothing.
    async fn apply_lookup(
        &self,
        payment: &Payment,
        lookup: LookupResult,
        audit: AuditContext,
    ) -> Result<Payment, AppError> {
        match lookup.status {
            CanonicalStatus::Paid => {
                self.confirm_from_provider_event(payment.id, &lookup.provider_ref, lookup.snapshot, audit)
                    .await
            }
            CanonicalStatus::Failed => {
                self.mark_failed_from_provider(
                    payment.id,
                    FailureReport {
                        code: lookup.failure_code.unwrap_or(ProviderErrorCode::CardDeclined),
                        reason: lookup.failure_reason,
                        snapshot: Some(lookup.snapshot),
                    },
                    audit,
                )
                .await
            }
            CanonicalStatus::Pending | CanonicalStatus::RequiresAction => self
                .store
                .get_payment(payment.id)
                .await?
                .ok_or(AppError::PaymentNotFound),
        }
    }

    async fn confirm(
        &self,
        payment_id: Uuid,
        provider_ref: Option<String>,
        snapshot: Option<serde_json::Value>,
        audit: AuditContext,
    ) -> Result<TransitionOutcome, AppError> {
        let current = self
            .store
            .get_payment(payment_id)
            .await?
            .ok_or(AppError::PaymentNotFound)?;

        let source = audit.source;
        let mut transition = PaymentTransition::new(payment_id, PaymentStatus::Paid, audit, self.clock.now());
        transition.unchanged_if = CONFIRMED;
        transition.changes.provider_ref = provider_ref;
        transition.changes.snapshot = snapshot;
        transition.events = vec![payment_event(EventKind::PaymentConfirmed, &current)];

        let outcome = self.store.apply_payment_transition(transition).await?;
        if outcome.was_applied() {
            tracing::info!(payment_id = %payment_id, source = %source, "payment confirmed");
            self.signal(outcome.payment(), FraudSignal::PaymentSucceeded).await;
        }
        Ok(outcome)
    }

    async fn with_lock<F>(&self, payment: &Payment, work: F) -> Result<Payment, AppError>
    where
        F: std::future::Future<Output = Result<Payment, AppError>>,
    {
        let now = self.clock.now();
        let locked = self
            .store
            .try_lock_payment(payment.id, now, now - self.settings.confirm_lock_ttl)
            .await?;
        if !locked {
            return Err(AppError::PaymentInProgress);
        }

        let result = work.await;
        if let Err(err) = self.store.release_payment_lock(payment.id).await {
            tracing::error!(payment_id = %payment.id, error = %err, "failed to release payment lock");
        }
        result
    }

    /// Failure signal: fraud flag, timeout, velocity, or a plain failure.
    async fn signal_failure(&self, payment: &Payment, code: ProviderErrorCode) {
        let signal = match code {
            ProviderErrorCode::FraudSuspected => FraudSignal::ProviderFraudFlag,
            ProviderErrorCode::ProviderTimeout => FraudSignal::Timeout,
            _ => {
                let since = self.clock.now() - chrono::Duration::minutes(FAILURE_VELOCITY_WINDOW_MINUTES);
                match self
                    .store
                    .count_recent_failures(payment.tenant_id, payment.actor_id, since)
                    .await
                {
                    Ok(failures) if failures >= FAILURE_VELOCITY_THRESHOLD => FraudSignal::MultiFailureVelocity,
                    Ok(_) => FraudSignal::PaymentFailure,
                    Err(err) => {
                        tracing::warn!(payment_id = %payment.id, error = %err, "failure count unavailable");
                        FraudSignal::PaymentFailure
                    }
                }
            }
        };
        self.signal(payment, signal).await;
    }

    /// Risk signals never fail the command that produced them.
    async fn signal(&self, payment: &Payment, signal: FraudSignal) {
        let payload = json!({
            "payment_id": payment.id,
            "order_id": payment.order_id,
            "amount": payment.amount,
            "failure_code": payment.failure_code,
        });
        if let Err(err) = self
            .risk
            .evaluate(payment.tenant_id, payment.actor_id, signal, payload)
            .await
        {
            tracing::warn!(payment_id = %payment.id, signal = %signal, error = %err, "risk signal not recorded");
        }
    }
}
