use std::time::Duration;

use crate::error::AppError;
use crate::jobs::Job;
use crate::services::idempotency_service::IdempotencyService;

pub struct IdempotencyPurgeJob {
    idempotency: IdempotencyService,
    interval: Duration,
}

impl IdempotencyPurgeJob {
    pub fn new(idempotency: IdempotencyService, interval: Duration) -> Self {
        Self { idempotency, interval }
    }
}

#[async_trait::async_trait]
impl Job for IdempotencyPurgeJob {
    fn name(&self) -> &'static str {
        "idempotency_purge"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> Result<(), AppError> {
        let purged = self.idempotency.purge_expired().await?;
        if purged > 0 {
            tracing::info!(purged, "expired idempotency keys purged");
        }
        Ok(())
    }
}
