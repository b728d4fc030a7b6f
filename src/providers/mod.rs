//! Provider abstraction layer.
//!
//! Every payment provider (card gateway, mobile-money gateway, internal wallet) is reached
//! through the [`PaymentProvider`] trait. Adapters translate native statuses into
//! [`CanonicalStatus`] and native failures into [`ProviderErrorCode`], so the command
//! service, webhook pipeline and reconciliation jobs never branch on provider names.
//!
//! # Adapters
//!
//! - `card`: card-gateway REST API, `Card-Signature: t=<unix>,v1=<hex>` webhooks
//! - `mobile_money`: mobile-money REST API, `X-Callback-Signature: sha256=<hex>` callbacks
//! - `wallet`: in-process wallet ledger; needs no network
//! - `mock`: scriptable adapter for tests and local runs

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::RetryPolicy;
use crate::error::AppError;
use crate::models::reconciliation::SettlementReport;

pub mod card;
pub mod mock;
pub mod mobile_money;
pub mod signature;
pub mod wallet;

text_enum! {
    /// Provider-agnostic payment state every adapter must produce.
    pub enum CanonicalStatus {
        RequiresAction => "REQUIRES_ACTION",
        Pending => "PENDING",
        Paid => "PAID",
        Failed => "FAILED",
    }
}

text_enum! {
    /// Failure vocabulary every adapter maps its native errors into.
    pub enum ProviderErrorCode {
        InsufficientFunds => "INSUFFICIENT_FUNDS",
        CardDeclined => "CARD_DECLINED",
        WalletDisabled => "WALLET_DISABLED",
        AmountTooLarge => "AMOUNT_TOO_LARGE",
        DuplicateTransaction => "DUPLICATE_TRANSACTION",
        FraudSuspected => "FRAUD_SUSPECTED",
        ProviderTimeout => "PROVIDER_TIMEOUT",
        ProviderUnavailable => "PROVIDER_UNAVAILABLE",
    }
}

impl ProviderErrorCode {
    /// Transient failures are retried locally with backoff; everything else is final.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ProviderErrorCode::ProviderTimeout | ProviderErrorCode::ProviderUnavailable
        )
    }

    /// A payment that failed with this code may be retried by the customer.
    pub fn is_retryable(self) -> bool {
        self != ProviderErrorCode::FraudSuspected
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ProviderError {
    pub code: ProviderErrorCode,
    pub message: String,
}

impl ProviderError {
    pub fn new(code: ProviderErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorCode::ProviderUnavailable, message)
    }
}

/// Map a transport failure. Bounded timeouts always surface as `PROVIDER_TIMEOUT`.
impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::new(ProviderErrorCode::ProviderTimeout, "provider request timed out")
        } else {
            ProviderError::unavailable(format!("provider request failed: {err}"))
        }
    }
}

/// Identifiers forwarded to the provider with a new intent.
///
/// `payment_id` doubles as the provider-side idempotency key.
#[derive(Debug, Clone)]
pub struct IntentMetadata {
    pub payment_id: Uuid,
    pub order_id: Uuid,
    pub tenant_id: Uuid,
    pub actor_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct RefundMetadata {
    pub refund_id: Uuid,
    pub payment_id: Uuid,
    pub tenant_id: Uuid,
    pub actor_id: Uuid,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IntentResult {
    pub provider_ref: String,
    pub client_secret: Option<String>,
    pub status: CanonicalStatus,
    pub snapshot: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LookupResult {
    pub provider_ref: String,
    pub status: CanonicalStatus,
    pub failure_code: Option<ProviderErrorCode>,
    pub failure_reason: Option<String>,
    pub snapshot: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefundResult {
    pub provider_ref: String,

    /// True when the provider settled the refund synchronously; otherwise completion
    /// arrives later as a refund event.
    pub settled: bool,
    pub snapshot: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderEventKind {
    PaymentSucceeded,
    PaymentFailed,
    PaymentCanceled,
    RefundSucceeded,
    RefundFailed,
    /// Event type the engine does not act on.
    Ignored(String),
}

/// Inbound provider event after normalization.
///
/// For payment events `provider_ref` is the payment's provider reference; for refund
/// events it is the refund's.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderEvent {
    pub event_id: String,
    pub event_type: String,
    pub kind: ProviderEventKind,
    pub provider_ref: Option<String>,
    pub amount: Option<i64>,
    pub currency: Option<String>,
    pub failure_code: Option<ProviderErrorCode>,
    pub reason: Option<String>,
}

#[async_trait::async_trait]
pub trait PaymentProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Request header carrying the webhook signature.
    fn signature_header(&self) -> &'static str;

    async fn create_intent(
        &self,
        amount: i64,
        currency: &str,
        metadata: &IntentMetadata,
    ) -> Result<IntentResult, ProviderError>;

    async fn lookup(&self, provider_ref: &str) -> Result<LookupResult, ProviderError>;

    async fn refund(
        &self,
        provider_ref: &str,
        amount: i64,
        metadata: &RefundMetadata,
    ) -> Result<RefundResult, ProviderError>;

    /// Current state of a refund by its provider reference. `Paid` means the refund
    /// settled.
    async fn lookup_refund(&self, refund_ref: &str) -> Result<LookupResult, ProviderError>;

    /// Verify a signature over the raw, unparsed request body.
    fn verify_webhook(&self, payload: &[u8], signature: &str) -> bool;

    /// Normalize a verified webhook body.
    fn parse_event(&self, payload: &[u8]) -> Result<ProviderEvent, AppError>;

    /// Statement of settled payments and refunds for a closed period.
    async fn settlement_report(
        &self,
        _period_start: DateTime<Utc>,
        _period_end: DateTime<Utc>,
    ) -> Result<SettlementReport, ProviderError> {
        Err(ProviderError::unavailable(format!(
            "{} does not publish settlement reports",
            self.name()
        )))
    }
}

/// Provider name -> adapter, resolved once at startup.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn PaymentProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, provider: Arc<dyn PaymentProvider>) -> Self {
        self.providers.insert(provider.name().to_string(), provider);
        self
    }

    /// # Errors
    ///
    /// `UNSUPPORTED_PROVIDER` when no adapter is registered under `name`.
    pub fn get(&self, name: &str) -> Result<Arc<dyn PaymentProvider>, AppError> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| AppError::UnsupportedProvider(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Run a provider call, retrying transient failures with exponential backoff.
pub async fn with_retry<T, F, Fut>(
    policy: RetryPolicy,
    operation: &str,
    mut call: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt: u32 = 1;
    loop {
        match call().await {
            Err(err) if err.code.is_transient() && attempt < policy.max_attempts => {
                let backoff = policy
                    .base_backoff_ms
                    .saturating_mul(1u64 << (attempt - 1).min(16));
                tracing::warn!(
                    operation,
                    attempt,
                    code = %err.code,
                    backoff_ms = backoff,
                    "transient provider failure, retrying"
                );
                tokio::time::sleep(Duration::from_millis(backoff)).await;
                attempt += 1;
            }
            outcome => return outcome,
        }
    }
}

/// Body format shared by the wallet and mock adapters.
///
/// ```json
/// {
///   "id": "evt_123",
///   "type": "payment.succeeded",
///   "provider_ref": "wlt_...",
///   "amount": 1000,
///   "currency": "USD",
///   "failure_code": "CARD_DECLINED",
///   "reason": "declined"
/// }
/// ```
#[derive(Debug, Deserialize)]
struct GenericEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    provider_ref: Option<String>,
    amount: Option<i64>,
    currency: Option<String>,
    failure_code: Option<String>,
    reason: Option<String>,
}

pub(crate) fn parse_generic_event(payload: &[u8]) -> Result<ProviderEvent, AppError> {
    let event: GenericEvent = serde_json::from_slice(payload)
        .map_err(|e| AppError::MalformedWebhook(e.to_string()))?;

    let kind = match event.event_type.as_str() {
        "payment.succeeded" => ProviderEventKind::PaymentSucceeded,
        "payment.failed" => ProviderEventKind::PaymentFailed,
        "payment.canceled" => ProviderEventKind::PaymentCanceled,
        "refund.succeeded" => ProviderEventKind::RefundSucceeded,
        "refund.failed" => ProviderEventKind::RefundFailed,
        other => ProviderEventKind::Ignored(other.to_string()),
    };

    let failure_code = event
        .failure_code
        .as_deref()
        .map(|code| code.parse::<ProviderErrorCode>().unwrap_or(ProviderErrorCode::CardDeclined));

    Ok(ProviderEvent {
        event_id: event.id,
        event_type: event.event_type,
        kind,
        provider_ref: event.provider_ref,
        amount: event.amount,
        currency: event.currency.map(|c| c.to_uppercase()),
        failure_code,
        reason: event.reason,
    })
}
