//! Scriptable provider for tests and `MOCK_PROVIDERS=true` local runs.
//!
//! Unscripted calls succeed: intents come back `REQUIRES_ACTION`, lookups report the
//! intent's scripted status (default `PENDING`), refunds settle synchronously.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::error::AppError;
use crate::models::reconciliation::SettlementReport;
use crate::providers::{
    CanonicalStatus, IntentMetadata, IntentResult, LookupResult, PaymentProvider, ProviderError,
    ProviderErrorCode, ProviderEvent, RefundMetadata, RefundResult, parse_generic_event, signature,
};

#[derive(Default)]
struct MockState {
    intent_status: Option<CanonicalStatus>,
    intent_errors: VecDeque<ProviderError>,
    lookups: HashMap<String, (CanonicalStatus, Option<ProviderErrorCode>)>,
    lookup_errors: VecDeque<ProviderError>,
    refund_errors: VecDeque<ProviderError>,
    refunds_pending: bool,
    settlement: Option<SettlementReport>,
    intent_calls: usize,
    lookup_calls: usize,
    refund_calls: usize,
}

pub struct MockProvider {
    name: String,
    secret: String,
    state: Mutex<MockState>,
}

impl MockProvider {
    pub fn new(name: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            secret: secret.into(),
            state: Mutex::new(MockState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Status returned by subsequent `create_intent` calls.
    pub fn set_intent_status(&self, status: CanonicalStatus) {
        self.state().intent_status = Some(status);
    }

    pub fn fail_next_intent(&self, err: ProviderError) {
        self.state().intent_errors.push_back(err);
    }

    /// Scripts payment lookups by payment reference and refund lookups by refund reference.
    pub fn set_lookup(&self, provider_ref: &str, status: CanonicalStatus, failure: Option<ProviderErrorCode>) {
        self.state()
            .lookups
            .insert(provider_ref.to_string(), (status, failure));
    }

    pub fn fail_next_lookup(&self, err: ProviderError) {
        self.state().lookup_errors.push_back(err);
    }

    pub fn fail_next_refund(&self, err: ProviderError) {
        self.state().refund_errors.push_back(err);
    }

    /// Refunds are accepted but completion is left to a later refund event.
    pub fn defer_refunds(&self) {
        self.state().refunds_pending = true;
    }

    pub fn set_settlement(&self, report: SettlementReport) {
        self.state().settlement = Some(report);
    }

    pub fn intent_calls(&self) -> usize {
        self.state().intent_calls
    }

    pub fn lookup_calls(&self) -> usize {
        self.state().lookup_calls
    }

    pub fn refund_calls(&self) -> usize {
        self.state().refund_calls
    }

    /// `sha256=<hex>` header for a webhook body.
    pub fn sign(&self, payload: &[u8]) -> String {
        signature::sign_body(&self.secret, payload)
    }
}

#[async_trait::async_trait]
impl PaymentProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn signature_header(&self) -> &'static str {
        "X-Mock-Signature"
    }

    async fn create_intent(
        &self,
        amount: i64,
        currency: &str,
        metadata: &IntentMetadata,
    ) -> Result<IntentResult, ProviderError> {
        let mut state = self.state();
        state.intent_calls += 1;
        if let Some(err) = state.intent_errors.pop_front() {
            return Err(err);
        }

        let provider_ref = format!("{}_{}", self.name, metadata.payment_id.simple());
        let status = state.intent_status.unwrap_or(CanonicalStatus::RequiresAction);
        Ok(IntentResult {
            client_secret: Some(format!("{provider_ref}_secret")),
            snapshot: json!({ "id": provider_ref, "amount": amount, "currency": currency, "status": status }),
            provider_ref,
            status,
        })
    }

    async fn lookup(&self, provider_ref: &str) -> Result<LookupResult, ProviderError> {
        let mut state = self.state();
        state.lookup_calls += 1;
        if let Some(err) = state.lookup_errors.pop_front() {
            return Err(err);
        }

        let (status, failure_code) = state
            .lookups
            .get(provider_ref)
            .copied()
            .unwrap_or((CanonicalStatus::Pending, None));
        Ok(LookupResult {
            provider_ref: provider_ref.to_string(),
            status,
            failure_code,
            failure_reason: failure_code.map(|code| format!("mock {code}")),
            snapshot: json!({ "id": provider_ref, "status": status }),
        })
    }

    async fn refund(
        &self,
        provider_ref: &str,
        amount: i64,
        metadata: &RefundMetadata,
    ) -> Result<RefundResult, ProviderError> {
        let mut state = self.state();
        state.refund_calls += 1;
        if let Some(err) = state.refund_errors.pop_front() {
            return Err(err);
        }

        let refund_ref = format!("{}_rf_{}", self.name, metadata.refund_id.simple());
        Ok(RefundResult {
            snapshot: json!({ "id": refund_ref, "payment": provider_ref, "amount": amount }),
            provider_ref: refund_ref,
            settled: !state.refunds_pending,
        })
    }

    async fn lookup_refund(&self, refund_ref: &str) -> Result<LookupResult, ProviderError> {
        self.lookup(refund_ref).await
    }

    fn verify_webhook(&self, payload: &[u8], header: &str) -> bool {
        signature::verify_body(&self.secret, payload, header)
    }

    fn parse_event(&self, payload: &[u8]) -> Result<ProviderEvent, AppError> {
        parse_generic_event(payload)
    }

    async fn settlement_report(
        &self,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<SettlementReport, ProviderError> {
        match self.state().settlement.clone() {
            Some(report) => Ok(SettlementReport {
                period_start,
                period_end,
                ..report
            }),
            None => Err(ProviderError::unavailable("no settlement scripted")),
        }
    }
}
