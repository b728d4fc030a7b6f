//! Card-gateway adapter.
//!
//! Talks to a Stripe-style REST API:
//! - `POST /v1/payment_intents` / `GET /v1/payment_intents/{id}`
//! - `POST /v1/refunds`
//! - `GET /v1/settlements?period_start=..&period_end=..`
//!
//! Every mutating call carries an `Idempotency-Key` (payment or refund id) so that local
//! retries after a timeout can never double-charge.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use url::Url;

use crate::clock::Clock;
use crate::error::AppError;
use crate::models::reconciliation::{SettlementLine, SettlementReport};
use crate::providers::{
    CanonicalStatus, IntentMetadata, IntentResult, LookupResult, PaymentProvider, ProviderError,
    ProviderErrorCode, ProviderEvent, ProviderEventKind, RefundMetadata, RefundResult, signature,
};

pub const NAME: &str = "card";

pub struct CardProvider {
    base_url: Url,
    api_key: String,
    webhook_secret: String,
    tolerance_seconds: i64,
    client: reqwest::Client,
    clock: Arc<dyn Clock>,
}

impl CardProvider {
    /// `client` must be built with a bounded request timeout.
    pub fn new(
        base_url: Url,
        api_key: String,
        webhook_secret: String,
        tolerance_seconds: i64,
        client: reqwest::Client,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            base_url,
            api_key,
            webhook_secret,
            tolerance_seconds,
            client,
            clock,
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url, ProviderError> {
        self.base_url
            .join(path)
            .map_err(|e| ProviderError::unavailable(format!("invalid card endpoint {path}: {e}")))
    }
}

/// Map a card-network decline code into the shared vocabulary.
pub fn map_decline_code(code: Option<&str>) -> ProviderErrorCode {
    match code {
        Some("insufficient_funds") => ProviderErrorCode::InsufficientFunds,
        Some("amount_too_large") | Some("card_velocity_exceeded") => ProviderErrorCode::AmountTooLarge,
        Some("duplicate_transaction") => ProviderErrorCode::DuplicateTransaction,
        Some("fraudulent") | Some("stolen_card") | Some("lost_card") | Some("pickup_card") => {
            ProviderErrorCode::FraudSuspected
        }
        _ => ProviderErrorCode::CardDeclined,
    }
}

fn map_intent_status(status: &str) -> CanonicalStatus {
    match status {
        "succeeded" => CanonicalStatus::Paid,
        "processing" => CanonicalStatus::Pending,
        "canceled" => CanonicalStatus::Failed,
        // requires_payment_method, requires_confirmation, requires_action, requires_capture
        _ => CanonicalStatus::RequiresAction,
    }
}

/// Turn a gateway response into JSON or a normalized error.
async fn read_response(response: reqwest::Response) -> Result<Value, ProviderError> {
    let status = response.status();
    let body = response.json::<Value>().await.unwrap_or(Value::Null);

    if status.is_success() {
        return Ok(body);
    }
    if status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::GATEWAY_TIMEOUT {
        return Err(ProviderError::new(
            ProviderErrorCode::ProviderTimeout,
            format!("card gateway answered {status}"),
        ));
    }
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return Err(ProviderError::unavailable(format!("card gateway answered {status}")));
    }

    let error = &body["error"];
    let code = error["decline_code"].as_str().or_else(|| error["code"].as_str());
    let message = error["message"].as_str().unwrap_or("card payment declined");
    Err(ProviderError::new(map_decline_code(code), message))
}

fn failure_of(intent: &Value) -> (Option<ProviderErrorCode>, Option<String>) {
    let error = &intent["last_payment_error"];
    if error.is_null() {
        return (None, None);
    }
    let code = error["decline_code"].as_str().or_else(|| error["code"].as_str());
    (
        Some(map_decline_code(code)),
        error["message"].as_str().map(str::to_string),
    )
}

fn required_str(value: &Value, field: &str) -> Result<String, ProviderError> {
    value[field]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| ProviderError::unavailable(format!("card gateway response lacks {field}")))
}

fn settlement_lines(value: &Value) -> Vec<SettlementLine> {
    value
        .as_array()
        .map(|lines| {
            lines
                .iter()
                .filter_map(|line| {
                    Some(SettlementLine {
                        provider_ref: line["id"].as_str()?.to_string(),
                        amount: line["amount"].as_i64()?,
                        currency: line["currency"].as_str()?.to_uppercase(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Debug, Deserialize)]
struct CardEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: CardEventData,
}

#[derive(Debug, Deserialize)]
struct CardEventData {
    object: Value,
}

#[async_trait::async_trait]
impl PaymentProvider for CardProvider {
    fn name(&self) -> &str {
        NAME
    }

    fn signature_header(&self) -> &'static str {
        "Card-Signature"
    }

    async fn create_intent(
        &self,
        amount: i64,
        currency: &str,
        metadata: &IntentMetadata,
    ) -> Result<IntentResult, ProviderError> {
        let response = self
            .client
            .post(self.endpoint("v1/payment_intents")?)
            .bearer_auth(&self.api_key)
            .header("Idempotency-Key", metadata.payment_id.to_string())
            .json(&json!({
                "amount": amount,
                "currency": currency.to_lowercase(),
                "metadata": {
                    "payment_id": metadata.payment_id,
                    "order_id": metadata.order_id,
                    "tenant_id": metadata.tenant_id,
                },
            }))
            .send()
            .await?;

        let intent = read_response(response).await?;
        Ok(IntentResult {
            provider_ref: required_str(&intent, "id")?,
            client_secret: intent["client_secret"].as_str().map(str::to_string),
            status: map_intent_status(intent["status"].as_str().unwrap_or_default()),
            snapshot: intent,
        })
    }

    async fn lookup(&self, provider_ref: &str) -> Result<LookupResult, ProviderError> {
        let response = self
            .client
            .get(self.endpoint(&format!("v1/payment_intents/{provider_ref}"))?)
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        let intent = read_response(response).await?;
        let status = map_intent_status(intent["status"].as_str().unwrap_or_default());
        let (mut failure_code, mut failure_reason) = failure_of(&intent);
        if intent["status"] == "canceled" && failure_reason.is_none() {
            failure_code = Some(ProviderErrorCode::CardDeclined);
            failure_reason = intent["cancellation_reason"]
                .as_str()
                .map(str::to_string)
                .or_else(|| Some("canceled".to_string()));
        }

        Ok(LookupResult {
            provider_ref: provider_ref.to_string(),
            status,
            failure_code,
            failure_reason,
            snapshot: intent,
        })
    }

    async fn refund(
        &self,
        provider_ref: &str,
        amount: i64,
        metadata: &RefundMetadata,
    ) -> Result<RefundResult, ProviderError> {
        let response = self
            .client
            .post(self.endpoint("v1/refunds")?)
            .bearer_auth(&self.api_key)
            .header("Idempotency-Key", metadata.refund_id.to_string())
            .json(&json!({
                "payment_intent": provider_ref,
                "amount": amount,
                "metadata": {
                    "refund_id": metadata.refund_id,
                    "payment_id": metadata.payment_id,
                },
            }))
            .send()
            .await?;

        let refund = read_response(response).await?;
        if refund["status"] == "failed" {
            let reason = refund["failure_reason"].as_str().unwrap_or("refund failed");
            return Err(ProviderError::new(ProviderErrorCode::CardDeclined, reason));
        }

        Ok(RefundResult {
            provider_ref: required_str(&refund, "id")?,
            settled: refund["status"] == "succeeded",
            snapshot: refund,
        })
    }

    async fn lookup_refund(&self, refund_ref: &str) -> Result<LookupResult, ProviderError> {
        let response = self
            .client
            .get(self.endpoint(&format!("v1/refunds/{refund_ref}"))?)
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        let refund = read_response(response).await?;
        let status = match refund["status"].as_str().unwrap_or_default() {
            "succeeded" => CanonicalStatus::Paid,
            "failed" | "canceled" => CanonicalStatus::Failed,
            _ => CanonicalStatus::Pending,
        };
        Ok(LookupResult {
            provider_ref: refund_ref.to_string(),
            status,
            failure_code: None,
            failure_reason: refund["failure_reason"].as_str().map(str::to_string),
            snapshot: refund,
        })
    }

    fn verify_webhook(&self, payload: &[u8], header: &str) -> bool {
        signature::verify_timestamped(
            &self.webhook_secret,
            payload,
            header,
            self.clock.now(),
            self.tolerance_seconds,
        )
    }

    fn parse_event(&self, payload: &[u8]) -> Result<ProviderEvent, AppError> {
        parse_card_event(payload)
    }

    async fn settlement_report(
        &self,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<SettlementReport, ProviderError> {
        let response = self
            .client
            .get(self.endpoint("v1/settlements")?)
            .bearer_auth(&self.api_key)
            .query(&[
                ("period_start", period_start.timestamp()),
                ("period_end", period_end.timestamp()),
            ])
            .send()
            .await?;

        let statement = read_response(response).await?;
        Ok(SettlementReport {
            provider: NAME.to_string(),
            period_start,
            period_end,
            payments: settlement_lines(&statement["payments"]),
            refunds: settlement_lines(&statement["refunds"]),
        })
    }
}

/// Normalize a card-gateway event body.
pub fn parse_card_event(payload: &[u8]) -> Result<ProviderEvent, AppError> {
    let event: CardEvent =
        serde_json::from_slice(payload).map_err(|e| AppError::MalformedWebhook(e.to_string()))?;
    let object = &event.data.object;

    let kind = match event.event_type.as_str() {
        "payment_intent.succeeded" => ProviderEventKind::PaymentSucceeded,
        "payment_intent.payment_failed" => ProviderEventKind::PaymentFailed,
        "payment_intent.canceled" => ProviderEventKind::PaymentCanceled,
        "refund.updated" => match object["status"].as_str() {
            Some("succeeded") => ProviderEventKind::RefundSucceeded,
            Some("failed") | Some("canceled") => ProviderEventKind::RefundFailed,
            _ => ProviderEventKind::Ignored(event.event_type.clone()),
        },
        other => ProviderEventKind::Ignored(other.to_string()),
    };

    let (failure_code, mut reason) = failure_of(object);
    if reason.is_none() {
        reason = object["failure_reason"]
            .as_str()
            .or_else(|| object["cancellation_reason"].as_str())
            .map(str::to_string);
    }

    Ok(ProviderEvent {
        event_id: event.id,
        event_type: event.event_type,
        kind,
        provider_ref: object["id"].as_str().map(str::to_string),
        amount: object["amount"].as_i64(),
        currency: object["currency"].as_str().map(str::to_uppercase),
        failure_code,
        reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decline_codes_map_into_shared_vocabulary() {
        assert_eq!(map_decline_code(Some("insufficient_funds")), ProviderErrorCode::InsufficientFunds);
        assert_eq!(map_decline_code(Some("fraudulent")), ProviderErrorCode::FraudSuspected);
        assert_eq!(map_decline_code(Some("do_not_honor")), ProviderErrorCode::CardDeclined);
        assert_eq!(map_decline_code(None), ProviderErrorCode::CardDeclined);
    }

    #[test]
    fn intent_statuses_map_to_canonical() {
        assert_eq!(map_intent_status("succeeded"), CanonicalStatus::Paid);
        assert_eq!(map_intent_status("processing"), CanonicalStatus::Pending);
        assert_eq!(map_intent_status("requires_action"), CanonicalStatus::RequiresAction);
        assert_eq!(map_intent_status("canceled"), CanonicalStatus::Failed);
    }

    #[test]
    fn parses_payment_failed_event() {
        let body = br#"{
            "id": "evt_9",
            "type": "payment_intent.payment_failed",
            "data": {"object": {
                "id": "pi_9", "amount": 1000, "currency": "usd",
                "last_payment_error": {"code": "card_declined", "decline_code": "fraudulent", "message": "blocked"}
            }}
        }"#;
        let event = parse_card_event(body).unwrap();
        assert_eq!(event.kind, ProviderEventKind::PaymentFailed);
        assert_eq!(event.provider_ref.as_deref(), Some("pi_9"));
        assert_eq!(event.amount, Some(1000));
        assert_eq!(event.currency.as_deref(), Some("USD"));
        assert_eq!(event.failure_code, Some(ProviderErrorCode::FraudSuspected));
        assert_eq!(event.reason.as_deref(), Some("blocked"));
    }

    #[test]
    fn refund_updates_route_on_status() {
        let done = br#"{"id":"evt_r","type":"refund.updated","data":{"object":{"id":"re_1","status":"succeeded","amount":400,"currency":"usd"}}}"#;
        let pending = br#"{"id":"evt_p","type":"refund.updated","data":{"object":{"id":"re_1","status":"pending"}}}"#;
        assert_eq!(parse_card_event(done).unwrap().kind, ProviderEventKind::RefundSucceeded);
        assert!(matches!(parse_card_event(pending).unwrap().kind, ProviderEventKind::Ignored(_)));
    }

    #[test]
    fn malformed_body_is_an_integrity_error() {
        let err = parse_card_event(b"not json").unwrap_err();
        assert!(err.is_integrity());
    }
}
