//! Risk scores, fraud signals and restrictions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

text_enum! {
    pub enum RiskLevel {
        Low => "LOW",
        Elevated => "ELEVATED",
        High => "HIGH",
        Severe => "SEVERE",
        Critical => "CRITICAL",
    }
}

impl RiskLevel {
    pub fn from_score(score: i32) -> Self {
        match score {
            s if s >= 90 => RiskLevel::Critical,
            s if s >= 70 => RiskLevel::Severe,
            s if s >= 50 => RiskLevel::High,
            s if s >= 30 => RiskLevel::Elevated,
            _ => RiskLevel::Low,
        }
    }

    fn rank(self) -> u8 {
        match self {
            RiskLevel::Low => 0,
            RiskLevel::Elevated => 1,
            RiskLevel::High => 2,
            RiskLevel::Severe => 3,
            RiskLevel::Critical => 4,
        }
    }

    pub fn is_above(self, other: RiskLevel) -> bool {
        self.rank() > other.rank()
    }
}

text_enum! {
    pub enum FraudSignal {
        PaymentFailure => "PAYMENT_FAILURE",
        MultiFailureVelocity => "MULTI_FAILURE_VELOCITY",
        ProviderFraudFlag => "PROVIDER_FRAUD_FLAG",
        HighRiskIp => "HIGH_RISK_IP",
        HighRefundRatio => "HIGH_REFUND_RATIO",
        RefundVelocity => "REFUND_VELOCITY",
        OffHoursPattern => "OFF_HOURS_PATTERN",
        Timeout => "TIMEOUT",
        PaymentSucceeded => "PAYMENT_SUCCEEDED",
    }
}

impl FraudSignal {
    /// Score delta contributed by one occurrence of the signal.
    pub fn weight(self) -> i32 {
        match self {
            FraudSignal::PaymentFailure => 10,
            FraudSignal::MultiFailureVelocity => 40,
            FraudSignal::ProviderFraudFlag => 50,
            FraudSignal::HighRiskIp => 30,
            FraudSignal::HighRefundRatio => 25,
            FraudSignal::RefundVelocity => 20,
            FraudSignal::OffHoursPattern => 10,
            FraudSignal::Timeout => 5,
            FraudSignal::PaymentSucceeded => -2,
        }
    }
}

text_enum! {
    pub enum RestrictionKind {
        BlockRetry => "BLOCK_RETRY",
        DisableWallet => "DISABLE_WALLET",
        ManualReview => "MANUAL_REVIEW",
        PaymentLock => "PAYMENT_LOCK",
    }
}

const BLOCK_RETRY_SCORE: i32 = 50;
const DISABLE_WALLET_SCORE: i32 = 70;
const PAYMENT_LOCK_SCORE: i32 = 90;

/// Restrictions a score calls for.
///
/// ```text
/// >= 50  BLOCK_RETRY
/// >= 70  + DISABLE_WALLET, MANUAL_REVIEW
/// >= 90  + PAYMENT_LOCK
/// ```
pub fn restrictions_for_score(score: i32) -> Vec<RestrictionKind> {
    let mut wanted = Vec::new();
    if score >= BLOCK_RETRY_SCORE {
        wanted.push(RestrictionKind::BlockRetry);
    }
    if score >= DISABLE_WALLET_SCORE {
        wanted.push(RestrictionKind::DisableWallet);
        wanted.push(RestrictionKind::ManualReview);
    }
    if score >= PAYMENT_LOCK_SCORE {
        wanted.push(RestrictionKind::PaymentLock);
    }
    wanted
}

/// Accumulated risk for one actor within one tenant. Score never drops below 0.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize, Deserialize)]
pub struct PaymentRisk {
    pub tenant_id: Uuid,
    pub actor_id: Uuid,
    pub score: i32,
    pub level: RiskLevel,
    pub last_incident_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentRisk {
    /// Reason recorded on restrictions activated for this score.
    pub fn restriction_reason(&self) -> String {
        format!("risk score {} ({})", self.score, self.level)
    }

    pub fn clean(tenant_id: Uuid, actor_id: Uuid, at: DateTime<Utc>) -> Self {
        Self {
            tenant_id,
            actor_id,
            score: 0,
            level: RiskLevel::Low,
            last_incident_at: None,
            updated_at: at,
        }
    }

    /// Apply a delta, floored at zero. Positive deltas count as incidents.
    pub fn apply_delta(&mut self, delta: i32, at: DateTime<Utc>) {
        self.score = (self.score + delta).max(0);
        self.level = RiskLevel::from_score(self.score);
        if delta > 0 {
            self.last_incident_at = Some(at);
        }
        self.updated_at = at;
    }
}

/// Append-only signal log.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize, Deserialize)]
pub struct FraudEvent {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub actor_id: Uuid,
    pub signal: FraudSignal,
    pub delta: i32,
    pub score_after: i32,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RiskSignal {
    pub tenant_id: Uuid,
    pub actor_id: Uuid,
    pub signal: FraudSignal,
    pub delta: i32,
    pub payload: serde_json::Value,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize, Deserialize)]
pub struct PaymentRestriction {
    pub tenant_id: Uuid,
    pub actor_id: Uuid,
    pub kind: RestrictionKind,
    pub active: bool,
    pub reason: String,
    pub activated_at: DateTime<Utc>,
    pub lifted_at: Option<DateTime<Utc>>,
}

/// Restriction changes made by one enforcement pass, derived from the score read under the
/// same lock.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RestrictionChanges {
    pub score: i32,
    pub activated: Vec<RestrictionKind>,
    pub lifted: Vec<RestrictionKind>,
}

/// Admin view of an actor's risk state.
#[derive(Debug, Serialize)]
pub struct RiskProfile {
    pub risk: PaymentRisk,
    pub restrictions: Vec<PaymentRestriction>,
    pub recent_events: Vec<FraudEvent>,
}

/// Admin submission of an externally detected signal (IP reputation, off-hours activity).
///
/// # JSON Example
///
/// ```json
/// { "signal": "HIGH_RISK_IP", "payload": { "ip": "203.0.113.9" } }
/// ```
#[derive(Debug, Deserialize)]
pub struct SubmitRiskSignalRequest {
    pub signal: FraudSignal,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_boundaries() {
        assert_eq!(RiskLevel::from_score(0), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(29), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(30), RiskLevel::Elevated);
        assert_eq!(RiskLevel::from_score(50), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(72), RiskLevel::Severe);
        assert_eq!(RiskLevel::from_score(90), RiskLevel::Critical);
        assert!(RiskLevel::Severe.is_above(RiskLevel::High));
    }

    #[test]
    fn restrictions_are_graduated() {
        assert!(restrictions_for_score(49).is_empty());
        assert_eq!(restrictions_for_score(50), vec![RestrictionKind::BlockRetry]);
        assert_eq!(
            restrictions_for_score(72),
            vec![
                RestrictionKind::BlockRetry,
                RestrictionKind::DisableWallet,
                RestrictionKind::ManualReview
            ]
        );
        assert!(restrictions_for_score(90).contains(&RestrictionKind::PaymentLock));
    }

    #[test]
    fn score_is_floored_at_zero() {
        let now = Utc::now();
        let mut risk = PaymentRisk::clean(Uuid::new_v4(), Uuid::new_v4(), now);
        risk.apply_delta(FraudSignal::PaymentSucceeded.weight(), now);
        assert_eq!(risk.score, 0);
        assert_eq!(risk.last_incident_at, None);

        risk.apply_delta(FraudSignal::ProviderFraudFlag.weight(), now);
        assert_eq!(risk.score, 50);
        assert_eq!(risk.level, RiskLevel::High);
        assert_eq!(risk.last_incident_at, Some(now));
    }
}
