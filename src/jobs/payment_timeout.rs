//! Expires payment intents that outlived their deadline.

use std::time::Duration;

use crate::error::AppError;
use crate::jobs::{BATCH_SIZE, Job};
use crate::services::reconciliation_service::ReconciliationService;

pub struct PaymentTimeoutJob {
    reconciliation: ReconciliationService,
    interval: Duration,
}

impl PaymentTimeoutJob {
    pub fn new(reconciliation: ReconciliationService, interval: Duration) -> Self {
        Self {
            reconciliation,
            interval,
        }
    }
}

#[async_trait::async_trait]
impl Job for PaymentTimeoutJob {
    fn name(&self) -> &'static str {
        "payment_timeout"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> Result<(), AppError> {
        let expired = self.reconciliation.expire_intents(BATCH_SIZE).await?;
        if expired > 0 {
            tracing::info!(expired, "expired payment intents");
        }
        Ok(())
    }
}
