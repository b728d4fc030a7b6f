//! Payment unit-of-work queries.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use super::{PgStore, insert_audit, insert_events, is_unique_violation, set_order_status};
use crate::error::AppError;
use crate::models::audit::PaymentAuditSnapshot;
use crate::models::order::{Order, OrderStatus};
use crate::models::payment::Payment;
use crate::store::{
    NewPaymentIntent, PaymentRepository, PaymentTransition, TransitionOutcome, next_payment,
    payment_audit, payment_created_audit, superseded_intent,
};

pub(super) async fn lock_payment(conn: &mut PgConnection, payment_id: Uuid) -> Result<Payment, AppError> {
    sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE id = $1 FOR UPDATE")
        .bind(payment_id)
        .fetch_optional(conn)
        .await?
        .ok_or(AppError::PaymentNotFound)
}

/// Write every mutable column of a payment row.
pub(super) async fn write_payment(conn: &mut PgConnection, payment: &Payment) -> Result<(), AppError> {
    let result = sqlx::query(
        r#"
        UPDATE payments
        SET status = $1,
            provider_ref = $2,
            client_secret = $3,
            failure_code = $4,
            failure_reason = $5,
            retries = $6,
            last_retry_at = $7,
            expires_at = $8,
            snapshot = $9,
            updated_at = $10,
            paid_at = $11,
            failed_at = $12,
            cancelled_at = $13,
            voided_at = $14,
            corrected_at = $15
        WHERE id = $16
        "#,
    )
    .bind(payment.status)
    .bind(&payment.provider_ref)
    .bind(&payment.client_secret)
    .bind(&payment.failure_code)
    .bind(&payment.failure_reason)
    .bind(payment.retries)
    .bind(payment.last_retry_at)
    .bind(payment.expires_at)
    .bind(&payment.snapshot)
    .bind(payment.updated_at)
    .bind(payment.paid_at)
    .bind(payment.failed_at)
    .bind(payment.cancelled_at)
    .bind(payment.voided_at)
    .bind(payment.corrected_at)
    .bind(payment.id)
    .execute(conn)
    .await;

    match result {
        Ok(_) => Ok(()),
        // The one-live-payment-per-order index
        Err(err) if is_unique_violation(&err) => Err(AppError::PaymentAlreadyExists),
        Err(err) => Err(err.into()),
    }
}

async fn insert_payment(conn: &mut PgConnection, payment: &Payment) -> Result<(), AppError> {
    let result = sqlx::query(
        r#"
        INSERT INTO payments (
            id, tenant_id, store_id, order_id, actor_id, amount, currency, flow, provider,
            provider_ref, client_secret, status, retries, max_retries, expires_at, snapshot,
            created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
        "#,
    )
    .bind(payment.id)
    .bind(payment.tenant_id)
    .bind(payment.store_id)
    .bind(payment.order_id)
    .bind(payment.actor_id)
    .bind(payment.amount)
    .bind(&payment.currency)
    .bind(payment.flow)
    .bind(&payment.provider)
    .bind(&payment.provider_ref)
    .bind(&payment.client_secret)
    .bind(payment.status)
    .bind(payment.retries)
    .bind(payment.max_retries)
    .bind(payment.expires_at)
    .bind(&payment.snapshot)
    .bind(payment.created_at)
    .bind(payment.updated_at)
    .execute(conn)
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(err) if is_unique_violation(&err) => Err(AppError::PaymentAlreadyExists),
        Err(err) => Err(err.into()),
    }
}

#[async_trait::async_trait]
impl PaymentRepository for PgStore {
    async fn get_payment(&self, payment_id: Uuid) -> Result<Option<Payment>, AppError> {
        let payment = sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE id = $1")
            .bind(payment_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(payment)
    }

    async fn find_payment_by_provider_ref(
        &self,
        provider: &str,
        provider_ref: &str,
    ) -> Result<Option<Payment>, AppError> {
        let payment = sqlx::query_as::<_, Payment>(
            "SELECT * FROM payments WHERE provider = $1 AND provider_ref = $2",
        )
        .bind(provider)
        .bind(provider_ref)
        .fetch_optional(&self.pool)
        .await?;
        Ok(payment)
    }

    async fn find_live_payment_for_order(&self, order_id: Uuid) -> Result<Option<Payment>, AppError> {
        let payment = sqlx::query_as::<_, Payment>(
            "SELECT * FROM payments WHERE order_id = $1 AND status IN ('PENDING', 'RETRYING')",
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(payment)
    }

    /// Create a payment intent row.
    ///
    /// # Process
    ///
    /// 1. Lock the order row, check it is payable
    /// 2. Lock any live payment of the order; refuse if still open, fail it if expired
    /// 3. Insert the new payment, move the order to `PENDING_PAYMENT`
    /// 4. Audit with the order pricing, append events, commit
    async fn create_payment_intent(&self, intent: NewPaymentIntent) -> Result<Payment, AppError> {
        let payment = intent.payment;
        let now = payment.created_at;
        let mut tx = self.pool.begin().await?;

        let order = sqlx::query_as::<_, Order>(
            "SELECT * FROM orders WHERE id = $1 AND tenant_id = $2 FOR UPDATE",
        )
        .bind(payment.order_id)
        .bind(payment.tenant_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(AppError::OrderNotFound)?;

        if !order.status.is_payable() {
            return Err(AppError::OrderNotPayable(order.status.to_string()));
        }

        let live = sqlx::query_as::<_, Payment>(
            "SELECT * FROM payments WHERE order_id = $1 AND status IN ('PENDING', 'RETRYING') FOR UPDATE",
        )
        .bind(order.id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(live) = live {
            if live.is_open_intent(now) {
                return Err(AppError::PaymentAlreadyExists);
            }
            let (failed, audit, event) = superseded_intent(&live, now)?;
            write_payment(&mut tx, &failed).await?;
            insert_audit(&mut tx, &audit).await?;
            insert_events(&mut tx, vec![event], now).await?;
        }

        insert_payment(&mut tx, &payment).await?;
        set_order_status(&mut tx, order.id, OrderStatus::PendingPayment, now).await?;
        insert_audit(&mut tx, &payment_created_audit(&payment, &order, &intent.audit)).await?;
        insert_events(&mut tx, intent.events, now).await?;

        tx.commit().await?;
        Ok(payment)
    }

    async fn apply_payment_transition(
        &self,
        transition: PaymentTransition,
    ) -> Result<TransitionOutcome, AppError> {
        let mut tx = self.pool.begin().await?;
        let current = lock_payment(&mut tx, transition.payment_id).await?;

        let Some(next) = next_payment(&current, &transition)? else {
            tx.rollback().await?;
            return Ok(TransitionOutcome::Unchanged(current));
        };

        let at = transition.at;
        write_payment(&mut tx, &next).await?;
        set_order_status(&mut tx, current.order_id, transition.order_status(), at).await?;
        insert_audit(&mut tx, &payment_audit(&current, &next, &transition.audit, at)).await?;
        insert_events(&mut tx, transition.events, at).await?;
        tx.commit().await?;

        Ok(TransitionOutcome::Applied {
            before: current,
            after: next,
        })
    }

    async fn attach_provider_intent(
        &self,
        payment_id: Uuid,
        provider_ref: &str,
        client_secret: Option<String>,
        snapshot: serde_json::Value,
        at: DateTime<Utc>,
    ) -> Result<Payment, AppError> {
        sqlx::query_as::<_, Payment>(
            r#"
            UPDATE payments
            SET provider_ref = $1, client_secret = $2, snapshot = $3, updated_at = $4
            WHERE id = $5
            RETURNING *
            "#,
        )
        .bind(provider_ref)
        .bind(client_secret)
        .bind(snapshot)
        .bind(at)
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AppError::PaymentNotFound)
    }

    async fn try_lock_payment(
        &self,
        payment_id: Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        // Single conditional UPDATE: exactly one concurrent caller can see rows_affected = 1
        let taken = sqlx::query(
            r#"
            UPDATE payments
            SET locked_at = $1
            WHERE id = $2 AND (locked_at IS NULL OR locked_at < $3)
            "#,
        )
        .bind(now)
        .bind(payment_id)
        .bind(stale_before)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if taken == 1 {
            return Ok(true);
        }
        let exists: Option<Uuid> = sqlx::query_scalar("SELECT id FROM payments WHERE id = $1")
            .bind(payment_id)
            .fetch_optional(&self.pool)
            .await?;
        match exists {
            Some(_) => Ok(false),
            None => Err(AppError::PaymentNotFound),
        }
    }

    async fn release_payment_lock(&self, payment_id: Uuid) -> Result<(), AppError> {
        sqlx::query("UPDATE payments SET locked_at = NULL WHERE id = $1")
            .bind(payment_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_stale_payments(
        &self,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Payment>, AppError> {
        let payments = sqlx::query_as::<_, Payment>(
            r#"
            SELECT * FROM payments
            WHERE flow = 'PROVIDER'
              AND status IN ('PENDING', 'RETRYING')
              AND provider_ref IS NOT NULL
              AND updated_at < $1
            ORDER BY updated_at
            LIMIT $2
            "#,
        )
        .bind(updated_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(payments)
    }

    async fn list_expired_intents(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Payment>, AppError> {
        let payments = sqlx::query_as::<_, Payment>(
            r#"
            SELECT * FROM payments
            WHERE status IN ('PENDING', 'RETRYING') AND expires_at <= $1
            ORDER BY expires_at
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(payments)
    }

    async fn count_recent_failures(
        &self,
        tenant_id: Uuid,
        actor_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<i64, AppError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM payments WHERE tenant_id = $1 AND actor_id = $2 AND failed_at >= $3",
        )
        .bind(tenant_id)
        .bind(actor_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn list_settled_payments(
        &self,
        provider: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Payment>, AppError> {
        let payments = sqlx::query_as::<_, Payment>(
            r#"
            SELECT * FROM payments
            WHERE provider = $1
              AND status IN ('PAID', 'PARTIALLY_REFUNDED', 'REFUNDED')
              AND paid_at >= $2 AND paid_at < $3
            "#,
        )
        .bind(provider)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        Ok(payments)
    }

    async fn list_audit_snapshots(&self, payment_id: Uuid) -> Result<Vec<PaymentAuditSnapshot>, AppError> {
        let snapshots = sqlx::query_as::<_, PaymentAuditSnapshot>(
            "SELECT * FROM payment_audit_snapshots WHERE payment_id = $1 ORDER BY created_at, id",
        )
        .bind(payment_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(snapshots)
    }
}
