use std::time::Duration;

use crate::error::AppError;
use crate::jobs::{BATCH_SIZE, Job};
use crate::services::events::OutboxRelay;

/// Drains the domain event outbox onto the in-process bus.
pub struct OutboxRelayJob {
    relay: OutboxRelay,
    interval: Duration,
}

impl OutboxRelayJob {
    pub fn new(relay: OutboxRelay, interval: Duration) -> Self {
        Self { relay, interval }
    }
}

#[async_trait::async_trait]
impl Job for OutboxRelayJob {
    fn name(&self) -> &'static str {
        "outbox_relay"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> Result<(), AppError> {
        // Drain in batches so a backlog clears in one run.
        loop {
            let published = self.relay.relay_once(BATCH_SIZE).await?;
            if published < BATCH_SIZE as usize {
                return Ok(());
            }
        }
    }
}
