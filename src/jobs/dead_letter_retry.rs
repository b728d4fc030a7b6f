use std::time::Duration;

use crate::error::AppError;
use crate::jobs::{BATCH_SIZE, Job};
use crate::services::webhook_service::WebhookService;

/// Reprocesses dead-lettered webhooks whose backoff has elapsed.
pub struct DeadLetterRetryJob {
    webhooks: WebhookService,
    interval: Duration,
}

impl DeadLetterRetryJob {
    pub fn new(webhooks: WebhookService, interval: Duration) -> Self {
        Self { webhooks, interval }
    }
}

#[async_trait::async_trait]
impl Job for DeadLetterRetryJob {
    fn name(&self) -> &'static str {
        "webhook_dead_letter_retry"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> Result<(), AppError> {
        let resolved = self.webhooks.retry_due_dead_letters(BATCH_SIZE).await?;
        if resolved > 0 {
            tracing::info!(resolved, "dead letters resolved");
        }
        Ok(())
    }
}
