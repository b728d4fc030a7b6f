//! Risk/fraud policy engine.
//!
//! The engine never inspects transactions itself. Signal producers (payment and refund
//! services, webhook pipeline, timeout job) call [`RiskEngine::evaluate`], which moves the
//! actor's score and re-derives the restriction set. Command paths consult the gates
//! before doing anything with money.

use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::AppError;
use crate::models::events::{AlertKind, AlertSeverity, NewDomainEvent};
use crate::models::risk::{
    FraudSignal, PaymentRestriction, PaymentRisk, RestrictionChanges, RestrictionKind, RiskLevel,
    RiskProfile, RiskSignal,
};
use crate::providers::wallet;
use crate::store::{RiskUpdate, Store};

/// Score from which new payments need manual review.
pub const MANUAL_REVIEW_SCORE: i32 = 80;

fn has(restrictions: &[PaymentRestriction], kind: RestrictionKind) -> bool {
    restrictions.iter().any(|r| r.kind == kind && r.active)
}

#[derive(Clone)]
pub struct RiskEngine {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl RiskEngine {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Feed one signal for an actor and enforce the resulting score.
    ///
    /// A move into a higher level raises `RISK_THRESHOLD_CROSSED`.
    pub async fn evaluate(
        &self,
        tenant_id: Uuid,
        actor_id: Uuid,
        signal: FraudSignal,
        payload: serde_json::Value,
    ) -> Result<RiskUpdate, AppError> {
        let now = self.clock.now();
        let update = self
            .store
            .apply_risk_signal(RiskSignal {
                tenant_id,
                actor_id,
                signal,
                delta: signal.weight(),
                payload,
                at: now,
            })
            .await?;

        tracing::info!(
            tenant_id = %tenant_id,
            actor_id = %actor_id,
            signal = %signal,
            score = update.risk.score,
            level = %update.risk.level,
            "risk signal applied"
        );

        self.enforce(tenant_id, actor_id).await?;

        if update.risk.level.is_above(update.previous_level) {
            let severity = if update.risk.level == RiskLevel::Critical {
                AlertSeverity::Critical
            } else {
                AlertSeverity::Warning
            };
            tracing::error!(
                actor_id = %actor_id,
                from = %update.previous_level,
                to = %update.risk.level,
                "risk threshold crossed"
            );
            self.store
                .append_domain_events(
                    vec![NewDomainEvent::alert(
                        severity,
                        AlertKind::RiskThresholdCrossed,
                        format!("actor risk moved from {} to {}", update.previous_level, update.risk.level),
                        json!({
                            "tenant_id": tenant_id,
                            "actor_id": actor_id,
                            "score": update.risk.score,
                            "signal": signal,
                        }),
                    )],
                    now,
                )
                .await?;
        }

        Ok(update)
    }

    /// Make the active restriction set match the actor's score as stored now.
    ///
    /// The store re-reads the score under the risk row lock, so a pass that runs after a
    /// concurrent signal or decay never restores restrictions for an outdated score.
    pub async fn enforce(&self, tenant_id: Uuid, actor_id: Uuid) -> Result<RestrictionChanges, AppError> {
        let changes = self
            .store
            .sync_restrictions(tenant_id, actor_id, self.clock.now())
            .await?;

        if !changes.activated.is_empty() || !changes.lifted.is_empty() {
            tracing::info!(
                actor_id = %actor_id,
                score = changes.score,
                activated = ?changes.activated,
                lifted = ?changes.lifted,
                "restrictions updated"
            );
        }
        Ok(changes)
    }

    /// Daily decay of every positive score, then re-enforcement of the decayed actors.
    pub async fn decay(&self, amount: i32) -> Result<usize, AppError> {
        let decayed = self.store.decay_risk_scores(amount, self.clock.now()).await?;
        for risk in &decayed {
            self.enforce(risk.tenant_id, risk.actor_id).await?;
        }
        Ok(decayed.len())
    }

    /// Policy gate for starting a payment.
    ///
    /// # Errors
    ///
    /// - `PAYMENT_LOCKED_BY_RISK_POLICY`: payment lock, retry block, or wallet disabled
    ///   for a wallet payment
    /// - `PAYMENT_REQUIRES_MANUAL_REVIEW`: score at or above [`MANUAL_REVIEW_SCORE`]
    pub async fn gate_payment(&self, tenant_id: Uuid, actor_id: Uuid, provider: &str) -> Result<(), AppError> {
        let restrictions = self.store.active_restrictions(tenant_id, actor_id).await?;
        if has(&restrictions, RestrictionKind::PaymentLock) {
            return Err(AppError::PaymentLockedByRiskPolicy);
        }

        let score = self
            .store
            .get_risk(tenant_id, actor_id)
            .await?
            .map(|r| r.score)
            .unwrap_or(0);
        if score >= MANUAL_REVIEW_SCORE {
            return Err(AppError::PaymentRequiresManualReview);
        }

        if has(&restrictions, RestrictionKind::BlockRetry)
            || (provider == wallet::NAME && has(&restrictions, RestrictionKind::DisableWallet))
        {
            return Err(AppError::PaymentLockedByRiskPolicy);
        }
        Ok(())
    }

    /// Policy gate for retrying a failed payment.
    pub async fn gate_retry(&self, tenant_id: Uuid, actor_id: Uuid) -> Result<(), AppError> {
        let restrictions = self.store.active_restrictions(tenant_id, actor_id).await?;
        if has(&restrictions, RestrictionKind::PaymentLock) || has(&restrictions, RestrictionKind::BlockRetry) {
            return Err(AppError::PaymentLockedByRiskPolicy);
        }
        Ok(())
    }

    /// Policy gate for a refund request. `Ok(true)` means the refund needs approval.
    pub async fn gate_refund(&self, tenant_id: Uuid, actor_id: Uuid) -> Result<bool, AppError> {
        let restrictions = self.store.active_restrictions(tenant_id, actor_id).await?;
        if has(&restrictions, RestrictionKind::PaymentLock) {
            return Err(AppError::PaymentLockedByRiskPolicy);
        }
        Ok(has(&restrictions, RestrictionKind::ManualReview))
    }

    pub async fn profile(&self, tenant_id: Uuid, actor_id: Uuid) -> Result<RiskProfile, AppError> {
        let risk = self
            .store
            .get_risk(tenant_id, actor_id)
            .await?
            .unwrap_or_else(|| PaymentRisk::clean(tenant_id, actor_id, self.clock.now()));
        Ok(RiskProfile {
            risk,
            restrictions: self.store.active_restrictions(tenant_id, actor_id).await?,
            recent_events: self.store.list_fraud_events(tenant_id, actor_id, 50).await?,
        })
    }
}
