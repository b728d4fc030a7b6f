//! Inbound provider webhook pipeline.
//!
//! This module verifies, deduplicates, durably records and dispatches provider events,
//! and owns the dead-letter queue and replay tooling built on the stored event log.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::AppError;
use crate::models::audit::{AuditContext, AuditSource};
use crate::models::events::{AlertKind, AlertSeverity, NewDomainEvent};
use crate::models::webhook::{
    DeadLetterFailure, DeadLetterStatus, NewWebhookEvent, WebhookAck, WebhookAckStatus,
    WebhookDeadLetter, WebhookEvent, WebhookReplay,
};
use crate::providers::{ProviderErrorCode, ProviderEvent, ProviderEventKind, ProviderRegistry};
use crate::services::payment_service::{FailureReport, PaymentService};
use crate::services::refund_service::RefundService;
use crate::store::Store;

/// Cap on the dead-letter backoff exponent.
const MAX_BACKOFF_EXPONENT: u32 = 10;

/// Outcome counts of a range replay.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplaySummary {
    pub events: usize,
    pub processed: usize,
    pub ignored: usize,
    pub failed: usize,
}

/// Delay before the next redelivery after `attempts` failures: 1, 2, 4, ... minutes.
pub fn dead_letter_backoff(attempts: i32) -> Duration {
    let exponent = (attempts.max(1) as u32 - 1).min(MAX_BACKOFF_EXPONENT);
    Duration::minutes(1i64 << exponent)
}

fn ack(status: WebhookAckStatus, event_id: Option<Uuid>, code: Option<&str>) -> WebhookAck {
    WebhookAck {
        status,
        event_id,
        code: code.map(str::to_string),
    }
}

#[derive(Clone)]
pub struct WebhookService {
    store: Arc<dyn Store>,
    providers: ProviderRegistry,
    payments: PaymentService,
    refunds: RefundService,
    clock: Arc<dyn Clock>,
    max_attempts: i32,
}

impl WebhookService {
    pub fn new(
        store: Arc<dyn Store>,
        providers: ProviderRegistry,
        payments: PaymentService,
        refunds: RefundService,
        clock: Arc<dyn Clock>,
        max_attempts: i32,
    ) -> Self {
        Self {
            store,
            providers,
            payments,
            refunds,
            clock,
            max_attempts,
        }
    }

    /// Header the provider signs its deliveries with.
    pub fn signature_header(&self, provider: &str) -> Result<&'static str, AppError> {
        Ok(self.providers.get(provider)?.signature_header())
    }

    /// Handle one inbound delivery.
    ///
    /// # Process
    ///
    /// 1. Verify the signature over the raw body
    /// 2. Normalize the event; answer a known `(provider, event_id)` as duplicate
    /// 3. Record the event (the unique key decides concurrent duplicates)
    /// 4. Validate and dispatch; failures go to the dead-letter queue
    ///
    /// # Errors
    ///
    /// Only failures before step 3 are errors (`WEBHOOK_SIGNATURE_INVALID`,
    /// `MALFORMED_WEBHOOK`, `UNSUPPORTED_PROVIDER`). Once recorded, the delivery is
    /// acknowledged whatever happens next.
    pub async fn ingest(
        &self,
        provider_name: &str,
        signature: Option<&str>,
        body: &[u8],
    ) -> Result<WebhookAck, AppError> {
        let provider = self.providers.get(provider_name)?;

        let verified = signature.is_some_and(|signature| provider.verify_webhook(body, signature));
        if !verified {
            self.integrity_alert(
                provider_name,
                "webhook signature verification failed",
                json!({ "provider": provider_name, "signature_present": signature.is_some() }),
            )
            .await;
            return Err(AppError::WebhookSignatureInvalid);
        }

        let event = match provider.parse_event(body) {
            Ok(event) => event,
            Err(err) => {
                self.integrity_alert(
                    provider_name,
                    "verified webhook could not be parsed",
                    json!({ "provider": provider_name, "error": err.to_string() }),
                )
                .await;
                return Err(err);
            }
        };

        if let Some(existing) = self.store.find_webhook_event(provider_name, &event.event_id).await? {
            tracing::info!(provider = %provider_name, event_id = %event.event_id, "duplicate webhook delivery");
            return Ok(ack(WebhookAckStatus::Duplicate, Some(existing.id), None));
        }

        let payload = serde_json::from_slice(body)
            .unwrap_or_else(|_| json!({ "raw": String::from_utf8_lossy(body) }));
        let recorded = self
            .store
            .record_webhook_event(NewWebhookEvent {
                provider: provider_name.to_string(),
                event_uuid: event.event_id.clone(),
                event_type: event.event_type.clone(),
                payload,
                received_at: self.clock.now(),
            })
            .await?;
        let Some(stored) = recorded else {
            tracing::info!(provider = %provider_name, event_id = %event.event_id, "concurrent duplicate webhook delivery");
            let existing = self.store.find_webhook_event(provider_name, &event.event_id).await?;
            return Ok(ack(WebhookAckStatus::Duplicate, existing.map(|e| e.id), None));
        };

        tracing::info!(
            provider = %provider_name,
            event_id = %event.event_id,
            event_type = %event.event_type,
            "webhook recorded"
        );
        self.process(&stored, &event).await
    }

    /// Replay a stored event through validation and dispatch.
    pub async fn replay_event(&self, event_id: Uuid, requested_by: &str) -> Result<WebhookAck, AppError> {
        let stored = self
            .store
            .get_webhook_event(event_id)
            .await?
            .ok_or(AppError::WebhookEventNotFound)?;
        let result = self.redeliver(&stored).await;
        self.record_replay(&stored, requested_by, &result).await?;
        result
    }

    /// Replay every stored event received in `[from, to]`, oldest first.
    pub async fn replay_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        provider: Option<&str>,
        requested_by: &str,
    ) -> Result<ReplaySummary, AppError> {
        if from > to {
            return Err(AppError::InvalidRequest("from must not be after to".to_string()));
        }

        let events = self.store.list_webhook_events_between(from, to, provider).await?;
        let mut summary = ReplaySummary {
            events: events.len(),
            ..ReplaySummary::default()
        };
        for stored in &events {
            let result = self.redeliver(stored).await;
            self.record_replay(stored, requested_by, &result).await?;
            match result.map(|ack| ack.status) {
                Ok(WebhookAckStatus::Processed) | Ok(WebhookAckStatus::Duplicate) => summary.processed += 1,
                Ok(WebhookAckStatus::Ignored) => summary.ignored += 1,
                Ok(_) => summary.failed += 1,
                Err(err) => {
                    tracing::error!(event_id = %stored.id, error = %err, "replay failed");
                    summary.failed += 1;
                }
            }
        }

        tracing::info!(
            events = summary.events,
            processed = summary.processed,
            failed = summary.failed,
            requested_by,
            "webhook range replayed"
        );
        Ok(summary)
    }

    pub async fn list_dead_letters(
        &self,
        status: Option<DeadLetterStatus>,
    ) -> Result<Vec<WebhookDeadLetter>, AppError> {
        self.store.list_dead_letters(status).await
    }

    /// Operator-triggered redelivery of one dead letter, whatever its backoff says.
    pub async fn retry_dead_letter(&self, dead_letter_id: Uuid, requested_by: &str) -> Result<WebhookAck, AppError> {
        let dead_letter = self
            .store
            .get_dead_letter(dead_letter_id)
            .await?
            .ok_or(AppError::DeadLetterNotFound)?;
        if dead_letter.status == DeadLetterStatus::Resolved {
            return Ok(ack(WebhookAckStatus::Processed, Some(dead_letter.webhook_event_id), None));
        }
        self.replay_event(dead_letter.webhook_event_id, requested_by).await
    }

    /// Redeliver every dead letter whose backoff has elapsed. Returns how many resolved.
    ///
    /// Individual failures are counted on their dead letter and do not stop the batch.
    pub async fn retry_due_dead_letters(&self, limit: i64) -> Result<usize, AppError> {
        let due = self.store.list_due_dead_letters(self.clock.now(), limit).await?;
        let mut resolved = 0;
        for dead_letter in due {
            let stored = match self.store.get_webhook_event(dead_letter.webhook_event_id).await? {
                Some(stored) => stored,
                None => {
                    tracing::error!(dead_letter_id = %dead_letter.id, "dead letter without stored event");
                    continue;
                }
            };
            match self.redeliver(&stored).await {
                Ok(result) if result.status == WebhookAckStatus::Processed || result.status == WebhookAckStatus::Ignored => {
                    resolved += 1;
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::error!(dead_letter_id = %dead_letter.id, error = %err, "dead letter retry failed");
                }
            }
        }
        Ok(resolved)
    }

    async fn redeliver(&self, stored: &WebhookEvent) -> Result<WebhookAck, AppError> {
        let provider = self.providers.get(&stored.provider)?;
        let body = serde_json::to_vec(&stored.payload)
            .map_err(|e| AppError::MalformedWebhook(e.to_string()))?;
        match provider.parse_event(&body) {
            Ok(event) => self.process(stored, &event).await,
            Err(err) => self.dead_letter(stored, &err).await,
        }
    }

    /// Validate and dispatch a recorded event, dead-lettering any failure.
    async fn process(&self, stored: &WebhookEvent, event: &ProviderEvent) -> Result<WebhookAck, AppError> {
        match self.dispatch(stored, event).await {
            Ok(applied) => {
                // The effect is committed; a bookkeeping failure still acknowledges.
                if let Err(err) = self.finish(stored).await {
                    tracing::error!(webhook_event_id = %stored.id, error = %err, "failed to mark webhook processed");
                }
                let status = if applied {
                    WebhookAckStatus::Processed
                } else {
                    WebhookAckStatus::Ignored
                };
                Ok(ack(status, Some(stored.id), None))
            }
            Err(err) => self.dead_letter(stored, &err).await,
        }
    }

    /// Stamp the event processed and resolve any dead letter it had.
    async fn finish(&self, stored: &WebhookEvent) -> Result<(), AppError> {
        let now = self.clock.now();
        self.store.mark_webhook_processed(stored.id, now).await?;
        if let Some(dead_letter) = self.store.find_dead_letter_for_event(stored.id).await? {
            if dead_letter.status != DeadLetterStatus::Resolved {
                self.store.resolve_dead_letter(dead_letter.id, now).await?;
                tracing::info!(dead_letter_id = %dead_letter.id, "dead letter resolved");
            }
        }
        Ok(())
    }

    /// Route a normalized event to its handler. `Ok(false)` means it was ignored.
    async fn dispatch(&self, stored: &WebhookEvent, event: &ProviderEvent) -> Result<bool, AppError> {
        let audit = AuditContext::new(AuditSource::Webhook).reason(format!("{} {}", event.event_type, event.event_id));
        let snapshot = stored.payload.clone();

        match &event.kind {
            ProviderEventKind::Ignored(event_type) => {
                tracing::debug!(provider = %stored.provider, event_type = %event_type, "webhook type ignored");
                Ok(false)
            }
            ProviderEventKind::PaymentSucceeded
            | ProviderEventKind::PaymentFailed
            | ProviderEventKind::PaymentCanceled => {
                let provider_ref = required_ref(event)?;
                let payment = self
                    .store
                    .find_payment_by_provider_ref(&stored.provider, provider_ref)
                    .await?
                    .ok_or(AppError::UnknownProviderReference)?;
                check_amount(event, payment.amount, &payment.currency)?;

                match event.kind {
                    ProviderEventKind::PaymentSucceeded => {
                        self.payments
                            .confirm_from_provider_event(payment.id, provider_ref, snapshot, audit)
                            .await?;
                    }
                    ProviderEventKind::PaymentFailed => {
                        let failure = FailureReport {
                            code: event.failure_code.unwrap_or(ProviderErrorCode::CardDeclined),
                            reason: event.reason.clone(),
                            snapshot: Some(snapshot),
                        };
                        self.payments
                            .mark_failed_from_provider(payment.id, failure, audit)
                            .await?;
                    }
                    _ => {
                        self.payments
                            .cancel_from_provider(payment.id, Some(snapshot), audit)
                            .await?;
                    }
                }
                Ok(true)
            }
            ProviderEventKind::RefundSucceeded | ProviderEventKind::RefundFailed => {
                let provider_ref = required_ref(event)?;
                let refund = self
                    .store
                    .find_refund_by_provider_ref(&stored.provider, provider_ref)
                    .await?
                    .ok_or(AppError::UnknownProviderReference)?;
                check_amount(event, refund.amount, &refund.currency)?;

                if event.kind == ProviderEventKind::RefundSucceeded {
                    self.refunds
                        .complete_from_provider(refund.id, Some(snapshot), audit)
                        .await?;
                } else {
                    self.refunds
                        .fail_from_provider(refund.id, event.reason.clone(), Some(snapshot), audit)
                        .await?;
                }
                Ok(true)
            }
        }
    }

    /// Count a failed dispatch against the event's dead letter.
    ///
    /// Integrity failures and exhausted retries are abandoned with a critical alert;
    /// anything else is scheduled for redelivery with exponential backoff.
    async fn dead_letter(&self, stored: &WebhookEvent, err: &AppError) -> Result<WebhookAck, AppError> {
        let now = self.clock.now();
        let attempts = self
            .store
            .find_dead_letter_for_event(stored.id)
            .await?
            .map(|d| d.attempt_count)
            .unwrap_or(0)
            + 1;

        let integrity = err.is_integrity();
        let abandon = integrity || attempts >= self.max_attempts;
        let mut events = Vec::new();
        if integrity {
            tracing::error!(event_id = %stored.id, provider = %stored.provider, code = err.code(), "webhook rejected");
            events.push(NewDomainEvent::alert(
                AlertSeverity::Critical,
                AlertKind::WebhookIntegrity,
                format!("webhook {} rejected: {}", stored.event_uuid, err.code()),
                json!({ "webhook_event_id": stored.id, "provider": stored.provider, "code": err.code() }),
            ));
        } else if abandon {
            tracing::error!(event_id = %stored.id, attempts, error = %err, "webhook dead letter abandoned");
            events.push(NewDomainEvent::alert(
                AlertSeverity::Critical,
                AlertKind::DeadLetterAbandoned,
                format!("webhook {} abandoned after {attempts} attempts", stored.event_uuid),
                json!({ "webhook_event_id": stored.id, "provider": stored.provider, "error": err.to_string() }),
            ));
        } else {
            tracing::warn!(event_id = %stored.id, attempts, error = %err, "webhook dispatch failed, queued for retry");
        }

        let dead_letter = self
            .store
            .record_dead_letter_failure(
                DeadLetterFailure {
                    webhook_event_id: stored.id,
                    provider: stored.provider.clone(),
                    event_type: stored.event_type.clone(),
                    error_message: format!("{}: {}", err.code(), err),
                    status: if abandon {
                        DeadLetterStatus::Abandoned
                    } else {
                        DeadLetterStatus::Failed
                    },
                    next_retry_at: (!abandon).then(|| now + dead_letter_backoff(attempts)),
                    at: now,
                },
                events,
            )
            .await?;

        let status = if integrity {
            WebhookAckStatus::Rejected
        } else {
            WebhookAckStatus::Queued
        };
        tracing::debug!(dead_letter_id = %dead_letter.id, status = %dead_letter.status, "dead letter recorded");
        Ok(ack(status, Some(stored.id), Some(err.code())))
    }

    async fn record_replay(
        &self,
        stored: &WebhookEvent,
        requested_by: &str,
        result: &Result<WebhookAck, AppError>,
    ) -> Result<(), AppError> {
        let (outcome, error_message) = match result {
            Ok(ack) => (
                serde_json::to_value(ack.status)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_else(|| "unknown".to_string()),
                ack.code.clone(),
            ),
            Err(err) => ("error".to_string(), Some(err.to_string())),
        };
        self.store
            .record_webhook_replay(WebhookReplay {
                id: Uuid::new_v4(),
                webhook_event_id: stored.id,
                requested_by: requested_by.to_string(),
                outcome,
                error_message,
                replayed_at: self.clock.now(),
            })
            .await
    }

    /// Integrity alert for deliveries rejected before they could be recorded.
    async fn integrity_alert(&self, provider: &str, message: &str, context: serde_json::Value) {
        tracing::error!(provider = %provider, "{message}");
        let alert = NewDomainEvent::alert(AlertSeverity::Critical, AlertKind::WebhookIntegrity, message, context);
        if let Err(err) = self.store.append_domain_events(vec![alert], self.clock.now()).await {
            tracing::error!(error = %err, "failed to record webhook integrity alert");
        }
    }
}

fn required_ref(event: &ProviderEvent) -> Result<&str, AppError> {
    event
        .provider_ref
        .as_deref()
        .ok_or_else(|| AppError::MalformedWebhook(format!("{} carries no provider reference", event.event_type)))
}

/// The declared amount and currency, when present, must match the local record.
fn check_amount(event: &ProviderEvent, amount: i64, currency: &str) -> Result<(), AppError> {
    if event.amount.is_some_and(|declared| declared != amount) {
        return Err(AppError::PaymentAmountMismatch);
    }
    if event
        .currency
        .as_deref()
        .is_some_and(|declared| !declared.eq_ignore_ascii_case(currency))
    {
        return Err(AppError::PaymentAmountMismatch);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(amount: Option<i64>, currency: Option<&str>) -> ProviderEvent {
        ProviderEvent {
            event_id: "evt_1".into(),
            event_type: "payment.succeeded".into(),
            kind: ProviderEventKind::PaymentSucceeded,
            provider_ref: Some("pi_1".into()),
            amount,
            currency: currency.map(str::to_string),
            failure_code: None,
            reason: None,
        }
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        assert_eq!(dead_letter_backoff(1), Duration::minutes(1));
        assert_eq!(dead_letter_backoff(2), Duration::minutes(2));
        assert_eq!(dead_letter_backoff(4), Duration::minutes(8));
        assert_eq!(dead_letter_backoff(50), Duration::minutes(1024));
    }

    #[test]
    fn declared_amount_must_match() {
        assert!(check_amount(&event(Some(1000), Some("USD")), 1000, "USD").is_ok());
        assert!(check_amount(&event(None, None), 1000, "USD").is_ok());
        assert!(matches!(
            check_amount(&event(Some(999), Some("USD")), 1000, "USD"),
            Err(AppError::PaymentAmountMismatch)
        ));
        assert!(matches!(
            check_amount(&event(Some(1000), Some("EUR")), 1000, "USD"),
            Err(AppError::PaymentAmountMismatch)
        ));
    }
}
