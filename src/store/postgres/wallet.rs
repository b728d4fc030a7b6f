//! Wallet ledger.
//!
//! Each holder's entries are serialised by an advisory transaction lock on the holder,
//! so the running balance read before an insert is never stale.

use sqlx::PgConnection;
use uuid::Uuid;

use super::PgStore;
use crate::error::AppError;
use crate::models::wallet::{WalletDebit, WalletEntry, WalletMovement};
use crate::store::WalletRepository;

async fn lock_holder(conn: &mut PgConnection, movement: &WalletMovement) -> Result<i64, AppError> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(format!("{}:{}", movement.tenant_id, movement.holder_id))
        .execute(&mut *conn)
        .await?;

    let balance: Option<i64> = sqlx::query_scalar(
        r#"
        SELECT balance_after FROM wallet_entries
        WHERE tenant_id = $1 AND holder_id = $2 AND currency = $3
        ORDER BY created_at DESC, id DESC
        LIMIT 1
        "#,
    )
    .bind(movement.tenant_id)
    .bind(movement.holder_id)
    .bind(&movement.currency)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(balance.unwrap_or(0))
}

async fn existing_entry(conn: &mut PgConnection, reference: &str) -> Result<Option<WalletEntry>, AppError> {
    let entry = sqlx::query_as::<_, WalletEntry>("SELECT * FROM wallet_entries WHERE reference = $1")
        .bind(reference)
        .fetch_optional(conn)
        .await?;
    Ok(entry)
}

async fn insert_entry(
    conn: &mut PgConnection,
    movement: &WalletMovement,
    balance: i64,
) -> Result<WalletEntry, AppError> {
    let entry = sqlx::query_as::<_, WalletEntry>(
        r#"
        INSERT INTO wallet_entries (id, tenant_id, holder_id, amount, currency, reference, balance_after, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(movement.tenant_id)
    .bind(movement.holder_id)
    .bind(movement.amount)
    .bind(&movement.currency)
    .bind(&movement.reference)
    .bind(balance + movement.amount)
    .bind(movement.at)
    .fetch_one(conn)
    .await?;
    Ok(entry)
}

#[async_trait::async_trait]
impl WalletRepository for PgStore {
    async fn wallet_debit(&self, movement: WalletMovement) -> Result<WalletDebit, AppError> {
        let mut tx = self.pool.begin().await?;
        let balance = lock_holder(&mut tx, &movement).await?;

        if let Some(entry) = existing_entry(&mut tx, &movement.reference).await? {
            return Ok(WalletDebit::Applied(entry));
        }
        if balance + movement.amount < 0 {
            return Ok(WalletDebit::InsufficientFunds { balance });
        }

        let entry = insert_entry(&mut tx, &movement, balance).await?;
        tx.commit().await?;
        Ok(WalletDebit::Applied(entry))
    }

    async fn wallet_credit(&self, movement: WalletMovement) -> Result<WalletEntry, AppError> {
        let mut tx = self.pool.begin().await?;
        let balance = lock_holder(&mut tx, &movement).await?;

        if let Some(entry) = existing_entry(&mut tx, &movement.reference).await? {
            return Ok(entry);
        }

        let entry = insert_entry(&mut tx, &movement, balance).await?;
        tx.commit().await?;
        Ok(entry)
    }

    async fn wallet_entry(&self, reference: &str) -> Result<Option<WalletEntry>, AppError> {
        let entry = sqlx::query_as::<_, WalletEntry>("SELECT * FROM wallet_entries WHERE reference = $1")
            .bind(reference)
            .fetch_optional(&self.pool)
            .await?;
        Ok(entry)
    }
}
