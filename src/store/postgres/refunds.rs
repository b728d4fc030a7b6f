//! Refund unit-of-work queries.
//!
//! Lock order is always payment first, then refund, so a refund transition and a
//! payment transition on the same payment serialise instead of deadlocking.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use super::payments::{lock_payment, write_payment};
use super::{PgStore, insert_audit, insert_events, set_order_status};
use crate::error::AppError;
use crate::models::audit::AuditContext;
use crate::models::events::NewDomainEvent;
use crate::models::order::OrderStatus;
use crate::models::refund::Refund;
use crate::store::{
    RefundActivity, RefundOutcome, RefundRepository, RefundTransition, next_refund, refund_audit,
    refunded_payment,
};

async fn write_refund(conn: &mut PgConnection, refund: &Refund) -> Result<(), AppError> {
    sqlx::query(
        r#"
        UPDATE refunds
        SET status = $1,
            approved_by = $2,
            approved_at = $3,
            provider_ref = $4,
            failure_reason = $5,
            snapshot = $6,
            updated_at = $7,
            completed_at = $8,
            failed_at = $9,
            cancelled_at = $10
        WHERE id = $11
        "#,
    )
    .bind(refund.status)
    .bind(&refund.approved_by)
    .bind(refund.approved_at)
    .bind(&refund.provider_ref)
    .bind(&refund.failure_reason)
    .bind(&refund.snapshot)
    .bind(refund.updated_at)
    .bind(refund.completed_at)
    .bind(refund.failed_at)
    .bind(refund.cancelled_at)
    .bind(refund.id)
    .execute(conn)
    .await?;
    Ok(())
}

#[async_trait::async_trait]
impl RefundRepository for PgStore {
    async fn get_refund(&self, refund_id: Uuid) -> Result<Option<Refund>, AppError> {
        let refund = sqlx::query_as::<_, Refund>("SELECT * FROM refunds WHERE id = $1")
            .bind(refund_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(refund)
    }

    async fn list_refunds_for_payment(&self, payment_id: Uuid) -> Result<Vec<Refund>, AppError> {
        let refunds = sqlx::query_as::<_, Refund>(
            "SELECT * FROM refunds WHERE payment_id = $1 ORDER BY created_at",
        )
        .bind(payment_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(refunds)
    }

    async fn find_refund_by_provider_ref(
        &self,
        provider: &str,
        provider_ref: &str,
    ) -> Result<Option<Refund>, AppError> {
        let refund = sqlx::query_as::<_, Refund>(
            "SELECT * FROM refunds WHERE provider = $1 AND provider_ref = $2",
        )
        .bind(provider)
        .bind(provider_ref)
        .fetch_optional(&self.pool)
        .await?;
        Ok(refund)
    }

    /// Insert a refund after checking the refundable balance.
    ///
    /// # Process
    ///
    /// 1. Lock the payment, require `PAID` or `PARTIALLY_REFUNDED`
    /// 2. Sum the refunds that hold balance; refuse if the new amount overflows it
    /// 3. Insert, audit, append events, commit
    async fn create_refund(
        &self,
        refund: Refund,
        audit: AuditContext,
        events: Vec<NewDomainEvent>,
    ) -> Result<Refund, AppError> {
        let mut tx = self.pool.begin().await?;
        let payment = lock_payment(&mut tx, refund.payment_id).await?;
        if !payment.status.is_refundable() {
            return Err(AppError::PaymentNotRefundable(payment.status.to_string()));
        }

        let outstanding: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(amount), 0)::BIGINT FROM refunds
            WHERE payment_id = $1 AND status IN ('REQUESTED', 'PROCESSING', 'COMPLETED')
            "#,
        )
        .bind(payment.id)
        .fetch_one(&mut *tx)
        .await?;
        if outstanding + refund.amount > payment.amount {
            return Err(AppError::RefundExceedsPayment);
        }

        sqlx::query(
            r#"
            INSERT INTO refunds (
                id, payment_id, order_id, tenant_id, store_id, actor_id, amount, currency,
                status, reason, requested_by, requires_approval, provider, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(refund.id)
        .bind(refund.payment_id)
        .bind(refund.order_id)
        .bind(refund.tenant_id)
        .bind(refund.store_id)
        .bind(refund.actor_id)
        .bind(refund.amount)
        .bind(&refund.currency)
        .bind(refund.status)
        .bind(&refund.reason)
        .bind(&refund.requested_by)
        .bind(refund.requires_approval)
        .bind(&refund.provider)
        .bind(refund.created_at)
        .bind(refund.updated_at)
        .execute(&mut *tx)
        .await?;

        insert_audit(&mut tx, &refund_audit(None, &refund, &audit, refund.created_at)).await?;
        insert_events(&mut tx, events, refund.created_at).await?;
        tx.commit().await?;
        Ok(refund)
    }

    async fn apply_refund_transition(&self, transition: RefundTransition) -> Result<RefundOutcome, AppError> {
        let mut tx = self.pool.begin().await?;

        let payment_id: Uuid = sqlx::query_scalar("SELECT payment_id FROM refunds WHERE id = $1")
            .bind(transition.refund_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(AppError::RefundNotFound)?;
        let payment = lock_payment(&mut tx, payment_id).await?;

        let current = sqlx::query_as::<_, Refund>("SELECT * FROM refunds WHERE id = $1 FOR UPDATE")
            .bind(transition.refund_id)
            .fetch_one(&mut *tx)
            .await?;

        let Some(next) = next_refund(&current, &transition)? else {
            tx.rollback().await?;
            return Ok(RefundOutcome::Unchanged(current));
        };

        let at = transition.at;
        write_refund(&mut tx, &next).await?;
        insert_audit(&mut tx, &refund_audit(Some(&current), &next, &transition.audit, at)).await?;
        insert_events(&mut tx, transition.events, at).await?;

        let mut moved = None;
        if next.status == crate::models::refund::RefundStatus::Completed {
            let completed_total: i64 = sqlx::query_scalar(
                "SELECT COALESCE(SUM(amount), 0)::BIGINT FROM refunds WHERE payment_id = $1 AND status = 'COMPLETED'",
            )
            .bind(payment.id)
            .fetch_one(&mut *tx)
            .await?;

            if let Some((refunded, audit, event)) =
                refunded_payment(&payment, completed_total, &transition.audit, at)?
            {
                write_payment(&mut tx, &refunded).await?;
                set_order_status(&mut tx, payment.order_id, OrderStatus::mirroring(refunded.status), at).await?;
                insert_audit(&mut tx, &audit).await?;
                insert_events(&mut tx, vec![event], at).await?;
                moved = Some(refunded);
            }
        }

        tx.commit().await?;
        Ok(RefundOutcome::Applied {
            refund: next,
            payment: moved,
        })
    }

    async fn attach_refund_reference(
        &self,
        refund_id: Uuid,
        provider_ref: &str,
        snapshot: serde_json::Value,
        at: DateTime<Utc>,
    ) -> Result<Refund, AppError> {
        sqlx::query_as::<_, Refund>(
            r#"
            UPDATE refunds
            SET provider_ref = $1, snapshot = $2, updated_at = $3
            WHERE id = $4
            RETURNING *
            "#,
        )
        .bind(provider_ref)
        .bind(snapshot)
        .bind(at)
        .bind(refund_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AppError::RefundNotFound)
    }

    async fn refund_activity(
        &self,
        tenant_id: Uuid,
        actor_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<RefundActivity, AppError> {
        let (recent_refunds, refunded_total): (i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE created_at >= $3),
                COALESCE(SUM(amount) FILTER (WHERE status = 'COMPLETED'), 0)::BIGINT
            FROM refunds
            WHERE tenant_id = $1 AND actor_id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(actor_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        let paid_total: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(amount), 0)::BIGINT FROM payments
            WHERE tenant_id = $1 AND actor_id = $2 AND paid_at IS NOT NULL
            "#,
        )
        .bind(tenant_id)
        .bind(actor_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(RefundActivity {
            recent_refunds,
            refunded_total,
            paid_total,
        })
    }

    async fn list_completed_refunds(
        &self,
        provider: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Refund>, AppError> {
        let refunds = sqlx::query_as::<_, Refund>(
            r#"
            SELECT * FROM refunds
            WHERE provider = $1 AND status = 'COMPLETED'
              AND completed_at >= $2 AND completed_at < $3
            "#,
        )
        .bind(provider)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        Ok(refunds)
    }

    async fn list_stale_refunds(
        &self,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Refund>, AppError> {
        let refunds = sqlx::query_as::<_, Refund>(
            r#"
            SELECT * FROM refunds
            WHERE status = 'PROCESSING' AND updated_at < $1
            ORDER BY updated_at
            LIMIT $2
            "#,
        )
        .bind(updated_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(refunds)
    }
}
