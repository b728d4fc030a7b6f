//! Internal wallet adapter.
//!
//! Payments debit the customer's wallet balance and refunds credit it back, all inside
//! the platform's own ledger, so a wallet intent settles synchronously and the adapter
//! keeps working when a store has no connectivity to external gateways.

use std::sync::Arc;

use serde_json::json;

use crate::clock::Clock;
use crate::error::AppError;
use crate::models::wallet::{WalletDebit, WalletMovement};
use crate::providers::{
    CanonicalStatus, IntentMetadata, IntentResult, LookupResult, PaymentProvider, ProviderError,
    ProviderErrorCode, ProviderEvent, RefundMetadata, RefundResult, parse_generic_event, signature,
};
use crate::store::WalletRepository;

pub const NAME: &str = "wallet";

pub struct WalletProvider {
    wallets: Arc<dyn WalletRepository>,
    webhook_secret: String,
    clock: Arc<dyn Clock>,
}

impl WalletProvider {
    pub fn new(wallets: Arc<dyn WalletRepository>, webhook_secret: String, clock: Arc<dyn Clock>) -> Self {
        Self {
            wallets,
            webhook_secret,
            clock,
        }
    }
}

fn ledger_error(err: AppError) -> ProviderError {
    ProviderError::unavailable(format!("wallet ledger error: {err}"))
}

#[async_trait::async_trait]
impl PaymentProvider for WalletProvider {
    fn name(&self) -> &str {
        NAME
    }

    fn signature_header(&self) -> &'static str {
        "X-Wallet-Signature"
    }

    async fn create_intent(
        &self,
        amount: i64,
        currency: &str,
        metadata: &IntentMetadata,
    ) -> Result<IntentResult, ProviderError> {
        let reference = format!("wlt_{}", metadata.payment_id.simple());
        let movement = WalletMovement {
            tenant_id: metadata.tenant_id,
            holder_id: metadata.actor_id,
            amount: -amount,
            currency: currency.to_string(),
            reference: reference.clone(),
            at: self.clock.now(),
        };

        match self.wallets.wallet_debit(movement).await.map_err(ledger_error)? {
            WalletDebit::Applied(entry) => Ok(IntentResult {
                provider_ref: reference,
                client_secret: None,
                status: CanonicalStatus::Paid,
                snapshot: json!({
                    "entry_id": entry.id,
                    "amount": entry.amount,
                    "balance_after": entry.balance_after,
                }),
            }),
            WalletDebit::InsufficientFunds { balance } => Err(ProviderError::new(
                ProviderErrorCode::InsufficientFunds,
                format!("wallet balance {balance} is below {amount}"),
            )),
        }
    }

    async fn lookup(&self, provider_ref: &str) -> Result<LookupResult, ProviderError> {
        let entry = self
            .wallets
            .wallet_entry(provider_ref)
            .await
            .map_err(ledger_error)?;

        Ok(match entry {
            Some(entry) => LookupResult {
                provider_ref: provider_ref.to_string(),
                status: CanonicalStatus::Paid,
                failure_code: None,
                failure_reason: None,
                snapshot: json!({ "entry_id": entry.id, "amount": entry.amount }),
            },
            None => LookupResult {
                provider_ref: provider_ref.to_string(),
                status: CanonicalStatus::Failed,
                failure_code: Some(ProviderErrorCode::InsufficientFunds),
                failure_reason: Some("no wallet debit recorded".to_string()),
                snapshot: json!({}),
            },
        })
    }

    async fn refund(
        &self,
        provider_ref: &str,
        amount: i64,
        metadata: &RefundMetadata,
    ) -> Result<RefundResult, ProviderError> {
        let reference = format!("wlt_rf_{}", metadata.refund_id.simple());
        let entry = self
            .wallets
            .wallet_credit(WalletMovement {
                tenant_id: metadata.tenant_id,
                holder_id: metadata.actor_id,
                amount,
                currency: metadata.currency.clone(),
                reference: reference.clone(),
                at: self.clock.now(),
            })
            .await
            .map_err(ledger_error)?;

        Ok(RefundResult {
            provider_ref: reference,
            settled: true,
            snapshot: json!({
                "entry_id": entry.id,
                "original_reference": provider_ref,
                "balance_after": entry.balance_after,
            }),
        })
    }

    /// Wallet credits are written synchronously, so a missing entry means the refund never
    /// happened.
    async fn lookup_refund(&self, refund_ref: &str) -> Result<LookupResult, ProviderError> {
        let entry = self
            .wallets
            .wallet_entry(refund_ref)
            .await
            .map_err(ledger_error)?;

        Ok(match entry {
            Some(entry) => LookupResult {
                provider_ref: refund_ref.to_string(),
                status: CanonicalStatus::Paid,
                failure_code: None,
                failure_reason: None,
                snapshot: json!({ "entry_id": entry.id, "amount": entry.amount }),
            },
            None => LookupResult {
                provider_ref: refund_ref.to_string(),
                status: CanonicalStatus::Failed,
                failure_code: None,
                failure_reason: Some("no wallet credit recorded".to_string()),
                snapshot: json!({}),
            },
        })
    }

    fn verify_webhook(&self, payload: &[u8], header: &str) -> bool {
        signature::verify_body(&self.webhook_secret, payload, header)
    }

    fn parse_event(&self, payload: &[u8]) -> Result<ProviderEvent, AppError> {
        parse_generic_event(payload)
    }
}
