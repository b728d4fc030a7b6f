//! Internal wallet ledger entries.
//!
//! The wallet provider moves money between customer wallets and the merchant without
//! leaving the platform: a payment is a debit, a refund is a credit. Entries are
//! append-only and each carries the running balance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize, Deserialize)]
pub struct WalletEntry {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub holder_id: Uuid,

    /// Signed amount in minor units: negative for debits.
    pub amount: i64,
    pub currency: String,

    /// Unique reference; doubles as the wallet provider's transaction id.
    pub reference: String,
    pub balance_after: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct WalletMovement {
    pub tenant_id: Uuid,
    pub holder_id: Uuid,
    pub amount: i64,
    pub currency: String,
    pub reference: String,
    pub at: DateTime<Utc>,
}

/// Outcome of a debit; an unfunded debit writes nothing.
#[derive(Debug, Clone, PartialEq)]
pub enum WalletDebit {
    Applied(WalletEntry),
    InsufficientFunds { balance: i64 },
}
