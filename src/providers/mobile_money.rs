//! Mobile-money gateway adapter.
//!
//! Collections are pushed to the customer's handset and approved there, so a fresh
//! collection is always `PENDING` and completion arrives as a callback or is found by
//! polling. Callbacks are signed `X-Callback-Signature: sha256=<hex>` over the raw body.

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use url::Url;

use crate::error::AppError;
use crate::models::reconciliation::{SettlementLine, SettlementReport};
use crate::providers::{
    CanonicalStatus, IntentMetadata, IntentResult, LookupResult, PaymentProvider, ProviderError,
    ProviderErrorCode, ProviderEvent, ProviderEventKind, RefundMetadata, RefundResult, signature,
};

pub const NAME: &str = "mobile_money";

pub struct MobileMoneyProvider {
    base_url: Url,
    api_key: String,
    webhook_secret: String,
    client: reqwest::Client,
}

impl MobileMoneyProvider {
    pub fn new(base_url: Url, api_key: String, webhook_secret: String, client: reqwest::Client) -> Self {
        Self {
            base_url,
            api_key,
            webhook_secret,
            client,
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url, ProviderError> {
        self.base_url.join(path).map_err(|e| {
            ProviderError::unavailable(format!("invalid mobile money endpoint {path}: {e}"))
        })
    }
}

pub fn map_reason_code(code: Option<&str>) -> ProviderErrorCode {
    match code {
        Some("INSUFFICIENT_BALANCE") => ProviderErrorCode::InsufficientFunds,
        Some("LIMIT_EXCEEDED") | Some("AMOUNT_ABOVE_MAXIMUM") => ProviderErrorCode::AmountTooLarge,
        Some("DUPLICATE_REFERENCE") => ProviderErrorCode::DuplicateTransaction,
        Some("SUSPECTED_FRAUD") | Some("SUBSCRIBER_BLACKLISTED") => ProviderErrorCode::FraudSuspected,
        Some("WALLET_INACTIVE") | Some("ACCOUNT_LOCKED") => ProviderErrorCode::WalletDisabled,
        Some("SUBSCRIBER_TIMEOUT") => ProviderErrorCode::ProviderTimeout,
        _ => ProviderErrorCode::CardDeclined,
    }
}

fn map_status(status: &str) -> CanonicalStatus {
    match status {
        "SUCCESSFUL" => CanonicalStatus::Paid,
        "FAILED" | "REJECTED" | "EXPIRED" | "CANCELLED" => CanonicalStatus::Failed,
        _ => CanonicalStatus::Pending,
    }
}

async fn read_response(response: reqwest::Response) -> Result<Value, ProviderError> {
    let status = response.status();
    let body = response.json::<Value>().await.unwrap_or(Value::Null);

    if status.is_success() {
        return Ok(body);
    }
    if status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::GATEWAY_TIMEOUT {
        return Err(ProviderError::new(
            ProviderErrorCode::ProviderTimeout,
            format!("mobile money gateway answered {status}"),
        ));
    }
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return Err(ProviderError::unavailable(format!(
            "mobile money gateway answered {status}"
        )));
    }
    Err(ProviderError::new(
        map_reason_code(body["reason_code"].as_str()),
        body["reason"].as_str().unwrap_or("collection rejected"),
    ))
}

fn required_str(value: &Value, field: &str) -> Result<String, ProviderError> {
    value[field].as_str().map(str::to_string).ok_or_else(|| {
        ProviderError::unavailable(format!("mobile money response lacks {field}"))
    })
}

fn settlement_lines(value: &Value) -> Vec<SettlementLine> {
    value
        .as_array()
        .map(|lines| {
            lines
                .iter()
                .filter_map(|line| {
                    Some(SettlementLine {
                        provider_ref: line["reference"].as_str()?.to_string(),
                        amount: line["amount"].as_i64()?,
                        currency: line["currency"].as_str()?.to_uppercase(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Debug, Deserialize)]
struct Callback {
    event_id: String,
    event: String,
    transaction: Value,
}

#[async_trait::async_trait]
impl PaymentProvider for MobileMoneyProvider {
    fn name(&self) -> &str {
        NAME
    }

    fn signature_header(&self) -> &'static str {
        "X-Callback-Signature"
    }

    async fn create_intent(
        &self,
        amount: i64,
        currency: &str,
        metadata: &IntentMetadata,
    ) -> Result<IntentResult, ProviderError> {
        let response = self
            .client
            .post(self.endpoint("collections")?)
            .header("X-Api-Key", &self.api_key)
            .header("X-Reference-Id", metadata.payment_id.to_string())
            .json(&json!({
                "amount": amount,
                "currency": currency,
                "external_id": metadata.payment_id,
                "payer_id": metadata.actor_id,
            }))
            .send()
            .await?;

        let collection = read_response(response).await?;
        Ok(IntentResult {
            provider_ref: required_str(&collection, "reference")?,
            client_secret: None,
            status: map_status(collection["status"].as_str().unwrap_or("PENDING")),
            snapshot: collection,
        })
    }

    async fn lookup(&self, provider_ref: &str) -> Result<LookupResult, ProviderError> {
        let response = self
            .client
            .get(self.endpoint(&format!("collections/{provider_ref}"))?)
            .header("X-Api-Key", &self.api_key)
            .send()
            .await?;

        let collection = read_response(response).await?;
        let status = map_status(collection["status"].as_str().unwrap_or("PENDING"));
        let failure_code = (status == CanonicalStatus::Failed)
            .then(|| map_reason_code(collection["reason_code"].as_str()));

        Ok(LookupResult {
            provider_ref: provider_ref.to_string(),
            status,
            failure_code,
            failure_reason: collection["reason"].as_str().map(str::to_string),
            snapshot: collection,
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
            .post(self.endpoint("disbursements")?)
            .header("X-Api-Key", &self.api_key)
            .header("X-Reference-Id", metadata.refund_id.to_string())
            .json(&json!({
                "amount": amount,
                "currency": metadata.currency,
                "original_reference": provider_ref,
                "external_id": metadata.refund_id,
                "payee_id": metadata.actor_id,
            }))
            .send()
            .await?;

        let disbursement = read_response(response).await?;
        Ok(RefundResult {
            provider_ref: required_str(&disbursement, "reference")?,
            settled: disbursement["status"] == "SUCCESSFUL",
            snapshot: disbursement,
        })
    }

    async fn lookup_refund(&self, refund_ref: &str) -> Result<LookupResult, ProviderError> {
        let response = self
            .client
            .get(self.endpoint(&format!("disbursements/{refund_ref}"))?)
            .header("X-Api-Key", &self.api_key)
            .send()
            .await?;

        let disbursement = read_response(response).await?;
        Ok(LookupResult {
            provider_ref: refund_ref.to_string(),
            status: map_status(disbursement["status"].as_str().unwrap_or("PENDING")),
            failure_code: None,
            failure_reason: disbursement["reason"].as_str().map(str::to_string),
            snapshot: disbursement,
        })
    }

    fn verify_webhook(&self, payload: &[u8], header: &str) -> bool {
        signature::verify_body(&self.webhook_secret, payload, header)
    }

    fn parse_event(&self, payload: &[u8]) -> Result<ProviderEvent, AppError> {
        let callback: Callback = serde_json::from_slice(payload)
            .map_err(|e| AppError::MalformedWebhook(e.to_string()))?;
        let tx = &callback.transaction;

        let kind = match callback.event.as_str() {
            "collection.completed" => ProviderEventKind::PaymentSucceeded,
            "collection.failed" => ProviderEventKind::PaymentFailed,
            "collection.cancelled" => ProviderEventKind::PaymentCanceled,
            "disbursement.completed" => ProviderEventKind::RefundSucceeded,
            "disbursement.failed" => ProviderEventKind::RefundFailed,
            other => ProviderEventKind::Ignored(other.to_string()),
        };
        let failure_code = matches!(
            kind,
            ProviderEventKind::PaymentFailed | ProviderEventKind::RefundFailed
        )
        .then(|| map_reason_code(tx["reason_code"].as_str()));

        Ok(ProviderEvent {
            event_id: callback.event_id,
            event_type: callback.event,
            kind,
            provider_ref: tx["reference"].as_str().map(str::to_string),
            amount: tx["amount"].as_i64(),
            currency: tx["currency"].as_str().map(str::to_uppercase),
            failure_code,
            reason: tx["reason"].as_str().map(str::to_string),
        })
    }

    async fn settlement_report(
        &self,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<SettlementReport, ProviderError> {
        let response = self
            .client
            .get(self.endpoint("statements")?)
            .header("X-Api-Key", &self.api_key)
            .query(&[
                ("from", period_start.to_rfc3339()),
                ("to", period_end.to_rfc3339()),
            ])
            .send()
            .await?;

        let statement = read_response(response).await?;
        Ok(SettlementReport {
            provider: NAME.to_string(),
            period_start,
            period_end,
            payments: settlement_lines(&statement["collections"]),
            refunds: settlement_lines(&statement["disbursements"]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> MobileMoneyProvider {
        MobileMoneyProvider::new(
            Url::parse("https://mm.test/").unwrap(),
            "key".into(),
            "mm_secret".into(),
            reqwest::Client::new(),
        )
    }

    #[test]
    fn verifies_callback_signature_over_raw_body() {
        let provider = provider();
        let body = br#"{"event_id":"e1","event":"collection.completed","transaction":{"reference":"mm_1","amount":500,"currency":"kes"}}"#;
        let header = signature::sign_body("mm_secret", body);
        assert!(provider.verify_webhook(body, &header));
        assert!(!provider.verify_webhook(b"{}", &header));
    }

    #[test]
    fn parses_failed_collection() {
        let provider = provider();
        let body = br#"{"event_id":"e2","event":"collection.failed","transaction":{"reference":"mm_2","amount":500,"currency":"KES","reason_code":"INSUFFICIENT_BALANCE","reason":"low balance"}}"#;
        let event = provider.parse_event(body).unwrap();
        assert_eq!(event.kind, ProviderEventKind::PaymentFailed);
        assert_eq!(event.failure_code, Some(ProviderErrorCode::InsufficientFunds));
        assert_eq!(event.reason.as_deref(), Some("low balance"));
    }

    #[test]
    fn statuses_map_to_canonical() {
        assert_eq!(map_status("SUCCESSFUL"), CanonicalStatus::Paid);
        assert_eq!(map_status("EXPIRED"), CanonicalStatus::Failed);
        assert_eq!(map_status("PENDING"), CanonicalStatus::Pending);
    }
}
