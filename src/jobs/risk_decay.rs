//! Daily decay of actor risk scores.

use std::time::Duration;

use crate::error::AppError;
use crate::jobs::Job;
use crate::services::risk::RiskEngine;

pub struct RiskDecayJob {
    risk: RiskEngine,
    amount: i32,
    interval: Duration,
}

impl RiskDecayJob {
    pub fn new(risk: RiskEngine, amount: i32, interval: Duration) -> Self {
        Self { risk, amount, interval }
    }
}

#[async_trait::async_trait]
impl Job for RiskDecayJob {
    fn name(&self) -> &'static str {
        "risk_decay"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> Result<(), AppError> {
        let decayed = self.risk.decay(self.amount).await?;
        tracing::info!(decayed, amount = self.amount, "risk scores decayed");
        Ok(())
    }
}
