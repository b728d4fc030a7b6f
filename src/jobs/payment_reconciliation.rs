//! Polls the provider for live payments and processing refunds that have gone quiet.

use std::time::Duration;

use crate::error::AppError;
use crate::jobs::{BATCH_SIZE, Job};
use crate::services::reconciliation_service::ReconciliationService;

pub struct PaymentReconciliationJob {
    reconciliation: ReconciliationService,
    interval: Duration,
}

impl PaymentReconciliationJob {
    pub fn new(reconciliation: ReconciliationService, interval: Duration) -> Self {
        Self {
            reconciliation,
            interval,
        }
    }
}

#[async_trait::async_trait]
impl Job for PaymentReconciliationJob {
    fn name(&self) -> &'static str {
        "payment_reconciliation"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> Result<(), AppError> {
        let summary = self.reconciliation.reconcile_stale_payments(BATCH_SIZE).await?;
        if summary.checked > 0 {
            tracing::info!(
                checked = summary.checked,
                updated = summary.updated,
                failed = summary.failed,
                "payment reconciliation pass"
            );
        }

        let summary = self.reconciliation.reconcile_stale_refunds(BATCH_SIZE).await?;
        if summary.checked > 0 {
            tracing::info!(
                checked = summary.checked,
                updated = summary.updated,
                failed = summary.failed,
                "refund reconciliation pass"
            );
        }
        Ok(())
    }
}
