//! Idempotency-key claims.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::PgStore;
use crate::error::AppError;
use crate::models::idempotency::{
    IdempotencyClaim, IdempotencyCompletion, IdempotencyRecord, NewIdempotencyClaim,
};
use crate::store::IdempotencyRepository;

#[async_trait::async_trait]
impl IdempotencyRepository for PgStore {
    /// Claim a key.
    ///
    /// # Process
    ///
    /// 1. `INSERT ... ON CONFLICT DO NOTHING`; a returned row means the key is ours
    /// 2. Otherwise lock the existing row; an expired record or lapsed lease is taken over in place
    /// 3. A live record is a replay, an in-flight request, or a payload mismatch
    async fn claim_idempotency_key(&self, claim: NewIdempotencyClaim) -> Result<IdempotencyClaim, AppError> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO idempotency_keys (tenant_id, key, route, request_hash, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (tenant_id, key, route) DO NOTHING
            "#,
        )
        .bind(claim.tenant_id)
        .bind(&claim.key)
        .bind(&claim.route)
        .bind(&claim.request_hash)
        .bind(claim.now)
        .bind(claim.expires_at)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 1 {
            tx.commit().await?;
            return Ok(IdempotencyClaim::Claimed);
        }

        let existing = sqlx::query_as::<_, IdempotencyRecord>(
            "SELECT * FROM idempotency_keys WHERE tenant_id = $1 AND key = $2 AND route = $3 FOR UPDATE",
        )
        .bind(claim.tenant_id)
        .bind(&claim.key)
        .bind(&claim.route)
        .fetch_one(&mut *tx)
        .await?;

        if existing.expires_at <= claim.now {
            sqlx::query(
                r#"
                UPDATE idempotency_keys
                SET request_hash = $1, status_code = NULL, response_body = NULL, entity_id = NULL,
                    created_at = $2, expires_at = $3, completed_at = NULL
                WHERE tenant_id = $4 AND key = $5 AND route = $6
                "#,
            )
            .bind(&claim.request_hash)
            .bind(claim.now)
            .bind(claim.expires_at)
            .bind(claim.tenant_id)
            .bind(&claim.key)
            .bind(&claim.route)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            return Ok(IdempotencyClaim::Claimed);
        }

        tx.commit().await?;
        Ok(if existing.request_hash != claim.request_hash {
            IdempotencyClaim::PayloadMismatch
        } else if existing.status_code.is_some() {
            IdempotencyClaim::Completed(existing)
        } else {
            IdempotencyClaim::InProgress
        })
    }

    async fn complete_idempotency_key(
        &self,
        tenant_id: Uuid,
        key: &str,
        route: &str,
        completion: IdempotencyCompletion,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE idempotency_keys
            SET status_code = $1, response_body = $2, entity_id = $3, completed_at = $4, expires_at = $5
            WHERE tenant_id = $6 AND key = $7 AND route = $8
            "#,
        )
        .bind(completion.status_code)
        .bind(&completion.response_body)
        .bind(completion.entity_id)
        .bind(completion.at)
        .bind(completion.expires_at)
        .bind(tenant_id)
        .bind(key)
        .bind(route)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn release_idempotency_key(&self, tenant_id: Uuid, key: &str, route: &str) -> Result<(), AppError> {
        sqlx::query(
            r#"
            DELETE FROM idempotency_keys
            WHERE tenant_id = $1 AND key = $2 AND route = $3 AND status_code IS NULL
            "#,
        )
        .bind(tenant_id)
        .bind(key)
        .bind(route)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn purge_idempotency_keys(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        let purged = sqlx::query("DELETE FROM idempotency_keys WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(purged)
    }
}
