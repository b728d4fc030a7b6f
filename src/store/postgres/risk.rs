//! Risk scores, fraud signal log and restrictions.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::PgStore;
use crate::error::AppError;
use crate::models::risk::{
    FraudEvent, PaymentRestriction, PaymentRisk, RestrictionChanges, RestrictionKind, RiskSignal,
    restrictions_for_score,
};
use crate::store::{RiskRepository, RiskUpdate};

#[async_trait::async_trait]
impl RiskRepository for PgStore {
    async fn get_risk(&self, tenant_id: Uuid, actor_id: Uuid) -> Result<Option<PaymentRisk>, AppError> {
        let risk = sqlx::query_as::<_, PaymentRisk>(
            "SELECT * FROM payment_risks WHERE tenant_id = $1 AND actor_id = $2",
        )
        .bind(tenant_id)
        .bind(actor_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(risk)
    }

    /// Apply one signal.
    ///
    /// # Process
    ///
    /// 1. Make sure the risk row exists (`ON CONFLICT DO NOTHING`)
    /// 2. Lock it, apply the delta floored at zero, re-derive the level
    /// 3. Append the fraud event with the resulting score, commit
    async fn apply_risk_signal(&self, signal: RiskSignal) -> Result<RiskUpdate, AppError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO payment_risks (tenant_id, actor_id, score, level, updated_at)
            VALUES ($1, $2, 0, 'LOW', $3)
            ON CONFLICT (tenant_id, actor_id) DO NOTHING
            "#,
        )
        .bind(signal.tenant_id)
        .bind(signal.actor_id)
        .bind(signal.at)
        .execute(&mut *tx)
        .await?;

        let mut risk = sqlx::query_as::<_, PaymentRisk>(
            "SELECT * FROM payment_risks WHERE tenant_id = $1 AND actor_id = $2 FOR UPDATE",
        )
        .bind(signal.tenant_id)
        .bind(signal.actor_id)
        .fetch_one(&mut *tx)
        .await?;

        let previous_level = risk.level;
        risk.apply_delta(signal.delta, signal.at);

        sqlx::query(
            r#"
            UPDATE payment_risks
            SET score = $1, level = $2, last_incident_at = $3, updated_at = $4
            WHERE tenant_id = $5 AND actor_id = $6
            "#,
        )
        .bind(risk.score)
        .bind(risk.level)
        .bind(risk.last_incident_at)
        .bind(risk.updated_at)
        .bind(risk.tenant_id)
        .bind(risk.actor_id)
        .execute(&mut *tx)
        .await?;

        let event = sqlx::query_as::<_, FraudEvent>(
            r#"
            INSERT INTO fraud_events (id, tenant_id, actor_id, signal, delta, score_after, payload, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(signal.tenant_id)
        .bind(signal.actor_id)
        .bind(signal.signal)
        .bind(signal.delta)
        .bind(risk.score)
        .bind(&signal.payload)
        .bind(signal.at)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(RiskUpdate {
            previous_level,
            risk,
            event,
        })
    }

    async fn active_restrictions(
        &self,
        tenant_id: Uuid,
        actor_id: Uuid,
    ) -> Result<Vec<PaymentRestriction>, AppError> {
        let restrictions = sqlx::query_as::<_, PaymentRestriction>(
            r#"
            SELECT * FROM payment_restrictions
            WHERE tenant_id = $1 AND actor_id = $2 AND active = true
            ORDER BY kind
            "#,
        )
        .bind(tenant_id)
        .bind(actor_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(restrictions)
    }

    /// Re-derive the restriction set from the stored score.
    ///
    /// # Process
    ///
    /// 1. Lock the risk row so no signal or decay lands in between
    /// 2. Lock the actor's restriction rows
    /// 3. Activate or lift each kind against what the locked score calls for, commit
    async fn sync_restrictions(
        &self,
        tenant_id: Uuid,
        actor_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<RestrictionChanges, AppError> {
        let mut tx = self.pool.begin().await?;
        let risk = sqlx::query_as::<_, PaymentRisk>(
            "SELECT * FROM payment_risks WHERE tenant_id = $1 AND actor_id = $2 FOR UPDATE",
        )
        .bind(tenant_id)
        .bind(actor_id)
        .fetch_optional(&mut *tx)
        .await?
        .unwrap_or_else(|| PaymentRisk::clean(tenant_id, actor_id, at));

        let current = sqlx::query_as::<_, PaymentRestriction>(
            "SELECT * FROM payment_restrictions WHERE tenant_id = $1 AND actor_id = $2 FOR UPDATE",
        )
        .bind(tenant_id)
        .bind(actor_id)
        .fetch_all(&mut *tx)
        .await?;

        let wanted = restrictions_for_score(risk.score);
        let reason = risk.restriction_reason();
        let mut changes = RestrictionChanges {
            score: risk.score,
            ..RestrictionChanges::default()
        };
        for &kind in RestrictionKind::ALL {
            let active = current.iter().any(|r| r.kind == kind && r.active);
            let want = wanted.contains(&kind);

            if want && !active {
                sqlx::query(
                    r#"
                    INSERT INTO payment_restrictions (tenant_id, actor_id, kind, active, reason, activated_at)
                    VALUES ($1, $2, $3, true, $4, $5)
                    ON CONFLICT (tenant_id, actor_id, kind) DO UPDATE SET
                        active = true, reason = EXCLUDED.reason,
                        activated_at = EXCLUDED.activated_at, lifted_at = NULL
                    "#,
                )
                .bind(tenant_id)
                .bind(actor_id)
                .bind(kind)
                .bind(&reason)
                .bind(at)
                .execute(&mut *tx)
                .await?;
                changes.activated.push(kind);
            } else if !want && active {
                sqlx::query(
                    r#"
                    UPDATE payment_restrictions SET active = false, lifted_at = $1
                    WHERE tenant_id = $2 AND actor_id = $3 AND kind = $4
                    "#,
                )
                .bind(at)
                .bind(tenant_id)
                .bind(actor_id)
                .bind(kind)
                .execute(&mut *tx)
                .await?;
                changes.lifted.push(kind);
            }
        }

        tx.commit().await?;
        Ok(changes)
    }

    /// Decay every positive score in one statement; levels are re-derived by the same thresholds
    /// as [`crate::models::risk::RiskLevel::from_score`].
    async fn decay_risk_scores(&self, amount: i32, at: DateTime<Utc>) -> Result<Vec<PaymentRisk>, AppError> {
        let decayed = sqlx::query_as::<_, PaymentRisk>(
            r#"
            WITH next AS (
                SELECT tenant_id, actor_id, GREATEST(score - $1, 0) AS score
                FROM payment_risks
                WHERE score > 0
                FOR UPDATE
            )
            UPDATE payment_risks r
            SET score = next.score,
                level = CASE
                    WHEN next.score >= 90 THEN 'CRITICAL'
                    WHEN next.score >= 70 THEN 'SEVERE'
                    WHEN next.score >= 50 THEN 'HIGH'
                    WHEN next.score >= 30 THEN 'ELEVATED'
                    ELSE 'LOW'
                END,
                updated_at = $2
            FROM next
            WHERE r.tenant_id = next.tenant_id AND r.actor_id = next.actor_id
            RETURNING r.*
            "#,
        )
        .bind(amount)
        .bind(at)
        .fetch_all(&self.pool)
        .await?;
        Ok(decayed)
    }

    async fn list_fraud_events(
        &self,
        tenant_id: Uuid,
        actor_id: Uuid,
        limit: i64,
    ) -> Result<Vec<FraudEvent>, AppError> {
        let events = sqlx::query_as::<_, FraudEvent>(
            r#"
            SELECT * FROM fraud_events
            WHERE tenant_id = $1 AND actor_id = $2
            ORDER BY created_at DESC
            LIMIT $3
            "#,
        )
        .bind(tenant_id)
        .bind(actor_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }
}
