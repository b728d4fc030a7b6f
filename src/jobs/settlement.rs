//! Reconciles the previous UTC day against every provider that publishes statements.

use std::time::Duration;

use crate::error::AppError;
use crate::jobs::Job;
use crate::services::reconciliation_service::ReconciliationService;

pub struct SettlementJob {
    reconciliation: ReconciliationService,
    interval: Duration,
}

impl SettlementJob {
    pub fn new(reconciliation: ReconciliationService, interval: Duration) -> Self {
        Self {
            reconciliation,
            interval,
        }
    }
}

#[async_trait::async_trait]
impl Job for SettlementJob {
    fn name(&self) -> &'static str {
        "settlement_reconciliation"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> Result<(), AppError> {
        let reconciled = self.reconciliation.reconcile_previous_day().await?;
        tracing::info!(providers = reconciled, "settlement reconciliation finished");
        Ok(())
    }
}
