//! PostgreSQL backend.
//!
//! Every state change runs inside one `pool.begin()` transaction: the current row is
//! re-read with `SELECT ... FOR UPDATE`, the transition guard runs against it, and the
//! entity, its order, the audit snapshot and the outbox events are written before
//! `commit()`. Dropping the transaction on an early `?` rolls everything back.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::db::DbPool;
use crate::error::AppError;
use crate::models::api_key::ApiKey;
use crate::models::audit::PaymentAuditSnapshot;
use crate::models::events::{DomainEvent, NewDomainEvent};
use crate::models::job::{JobHeartbeat, JobRun};
use crate::models::order::{Order, OrderStatus, StoreLocation};
use crate::models::reconciliation::SettlementReconciliation;
use crate::store::{OpsRepository, OrderRepository};

mod idempotency;
mod payments;
mod refunds;
mod risk;
mod wallet;
mod webhooks;

#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

pub(crate) async fn insert_audit(
    conn: &mut PgConnection,
    audit: &PaymentAuditSnapshot,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        INSERT INTO payment_audit_snapshots (
            id, entity_type, entity_id, payment_id, tenant_id,
            before_status, after_status, before_snapshot, after_snapshot,
            source, operator, reason, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        "#,
    )
    .bind(audit.id)
    .bind(audit.entity_type)
    .bind(audit.entity_id)
    .bind(audit.payment_id)
    .bind(audit.tenant_id)
    .bind(&audit.before_status)
    .bind(&audit.after_status)
    .bind(&audit.before_snapshot)
    .bind(&audit.after_snapshot)
    .bind(audit.source)
    .bind(&audit.operator)
    .bind(&audit.reason)
    .bind(audit.created_at)
    .execute(conn)
    .await?;
    Ok(())
}

pub(crate) async fn insert_events(
    conn: &mut PgConnection,
    events: Vec<NewDomainEvent>,
    at: DateTime<Utc>,
) -> Result<(), AppError> {
    for event in events {
        let event = event.into_event(at);
        sqlx::query(
            r#"
            INSERT INTO domain_events (id, kind, tenant_id, aggregate_id, payload, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(event.id)
        .bind(event.kind)
        .bind(event.tenant_id)
        .bind(event.aggregate_id)
        .bind(&event.payload)
        .bind(event.created_at)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

pub(crate) async fn set_order_status(
    conn: &mut PgConnection,
    order_id: Uuid,
    status: OrderStatus,
    at: DateTime<Utc>,
) -> Result<(), AppError> {
    sqlx::query("UPDATE orders SET status = $1, updated_at = $2 WHERE id = $3")
        .bind(status)
        .bind(at)
        .bind(order_id)
        .execute(conn)
        .await?;
    Ok(())
}

#[async_trait::async_trait]
impl OrderRepository for PgStore {
    async fn get_order(&self, tenant_id: Uuid, order_id: Uuid) -> Result<Option<Order>, AppError> {
        let order = sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE id = $1 AND tenant_id = $2")
            .bind(order_id)
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(order)
    }

    async fn get_store_location(
        &self,
        tenant_id: Uuid,
        store_id: Uuid,
    ) -> Result<Option<StoreLocation>, AppError> {
        let store = sqlx::query_as::<_, StoreLocation>(
            "SELECT * FROM store_locations WHERE id = $1 AND tenant_id = $2",
        )
        .bind(store_id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(store)
    }
}

#[async_trait::async_trait]
impl OpsRepository for PgStore {
    async fn ping(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn find_api_key(&self, key_hash: &str) -> Result<Option<ApiKey>, AppError> {
        let api_key = sqlx::query_as::<_, ApiKey>(
            "SELECT id, tenant_id, key_hash, key_name, is_admin, created_at, is_active
             FROM api_keys
             WHERE key_hash = $1 AND is_active = true",
        )
        .bind(key_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(api_key)
    }

    async fn append_domain_events(&self, events: Vec<NewDomainEvent>, at: DateTime<Utc>) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;
        insert_events(&mut tx, events, at).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn pending_domain_events(&self, limit: i64) -> Result<Vec<DomainEvent>, AppError> {
        let events = sqlx::query_as::<_, DomainEvent>(
            r#"
            SELECT * FROM domain_events
            WHERE published_at IS NULL
            ORDER BY created_at
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }

    async fn mark_events_published(&self, event_ids: &[Uuid], at: DateTime<Utc>) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE domain_events SET published_at = $1 WHERE id = ANY($2) AND published_at IS NULL",
        )
        .bind(at)
        .bind(event_ids)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_reconciliation(
        &self,
        rec: SettlementReconciliation,
        events: Vec<NewDomainEvent>,
    ) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO settlement_reconciliations (
                id, provider, period_start, period_end,
                local_payment_count, local_payment_total, provider_payment_count, provider_payment_total,
                payment_count_variance, payment_amount_variance,
                local_refund_count, local_refund_total, provider_refund_count, provider_refund_total,
                refund_count_variance, refund_amount_variance,
                net_variance, missing_locally, missing_at_provider, has_discrepancy, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21)
            "#,
        )
        .bind(rec.id)
        .bind(&rec.provider)
        .bind(rec.period_start)
        .bind(rec.period_end)
        .bind(rec.local_payment_count)
        .bind(rec.local_payment_total)
        .bind(rec.provider_payment_count)
        .bind(rec.provider_payment_total)
        .bind(rec.payment_count_variance)
        .bind(rec.payment_amount_variance)
        .bind(rec.local_refund_count)
        .bind(rec.local_refund_total)
        .bind(rec.provider_refund_count)
        .bind(rec.provider_refund_total)
        .bind(rec.refund_count_variance)
        .bind(rec.refund_amount_variance)
        .bind(rec.net_variance)
        .bind(&rec.missing_locally)
        .bind(&rec.missing_at_provider)
        .bind(rec.has_discrepancy)
        .bind(rec.created_at)
        .execute(&mut *tx)
        .await?;

        insert_events(&mut tx, events, rec.created_at).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_reconciliations(
        &self,
        provider: Option<&str>,
        limit: i64,
    ) -> Result<Vec<SettlementReconciliation>, AppError> {
        let reconciliations = sqlx::query_as::<_, SettlementReconciliation>(
            r#"
            SELECT * FROM settlement_reconciliations
            WHERE ($1::TEXT IS NULL OR provider = $1)
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(provider)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(reconciliations)
    }

    async fn record_job_run(&self, run: JobRun) -> Result<JobHeartbeat, AppError> {
        let mut tx = self.pool.begin().await?;
        let current = sqlx::query_as::<_, JobHeartbeat>(
            "SELECT * FROM job_heartbeats WHERE job_name = $1 FOR UPDATE",
        )
        .bind(&run.job_name)
        .fetch_optional(&mut *tx)
        .await?;

        let heartbeat = match current {
            Some(mut heartbeat) => {
                heartbeat.fold(&run);
                heartbeat
            }
            None => JobHeartbeat::first(&run),
        };

        sqlx::query(
            r#"
            INSERT INTO job_heartbeats (
                job_name, last_run_at, last_duration_ms, last_success_at,
                consecutive_failures, total_runs, last_error
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (job_name) DO UPDATE SET
                last_run_at = EXCLUDED.last_run_at,
                last_duration_ms = EXCLUDED.last_duration_ms,
                last_success_at = EXCLUDED.last_success_at,
                consecutive_failures = EXCLUDED.consecutive_failures,
                total_runs = EXCLUDED.total_runs,
                last_error = EXCLUDED.last_error
            "#,
        )
        .bind(&heartbeat.job_name)
        .bind(heartbeat.last_run_at)
        .bind(heartbeat.last_duration_ms)
        .bind(heartbeat.last_success_at)
        .bind(heartbeat.consecutive_failures)
        .bind(heartbeat.total_runs)
        .bind(&heartbeat.last_error)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(heartbeat)
    }

    async fn list_job_heartbeats(&self) -> Result<Vec<JobHeartbeat>, AppError> {
        let heartbeats = sqlx::query_as::<_, JobHeartbeat>("SELECT * FROM job_heartbeats ORDER BY job_name")
            .fetch_all(&self.pool)
            .await?;
        Ok(heartbeats)
    }
}
