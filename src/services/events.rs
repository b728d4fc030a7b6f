//! Outbox relay and in-process event bus.
//!
//! Units of work only append to `domain_events`. The relay reads unpublished rows in
//! creation order, broadcasts them to subscribers (notifications, metrics, inventory,
//! ledger) and stamps `published_at`. A subscriber that lags simply misses events; the
//! durable record stays in the table.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::clock::Clock;
use crate::error::AppError;
use crate::models::events::DomainEvent;
use crate::store::Store;

const BUS_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DomainEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
    }

    /// Returns the number of subscribers that received the event.
    pub fn publish(&self, event: DomainEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct OutboxRelay {
    store: Arc<dyn Store>,
    bus: EventBus,
    clock: Arc<dyn Clock>,
}

impl OutboxRelay {
    pub fn new(store: Arc<dyn Store>, bus: EventBus, clock: Arc<dyn Clock>) -> Self {
        Self { store, bus, clock }
    }

    /// Publish up to `limit` pending events. Returns how many were published.
    pub async fn relay_once(&self, limit: i64) -> Result<usize, AppError> {
        let pending = self.store.pending_domain_events(limit).await?;
        if pending.is_empty() {
            return Ok(0);
        }

        let ids: Vec<_> = pending.iter().map(|e| e.id).collect();
        for event in pending {
            tracing::debug!(event_id = %event.id, kind = %event.kind, "publishing domain event");
            self.bus.publish(event);
        }
        self.store.mark_events_published(&ids, self.clock.now()).await?;
        Ok(ids.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::events::{EventKind, NewDomainEvent};
    use chrono::Utc;
    use uuid::Uuid;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let event = NewDomainEvent::new(
            EventKind::PaymentConfirmed,
            Uuid::new_v4(),
            Uuid::new_v4(),
            serde_json::json!({}),
        )
        .into_event(Utc::now());

        assert_eq!(bus.publish(event.clone()), 1);
        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[test]
    fn publishing_without_subscribers_is_not_an_error() {
        let bus = EventBus::new();
        let event = NewDomainEvent::new(EventKind::PaymentFailed, Uuid::new_v4(), Uuid::new_v4(), serde_json::json!({}))
            .into_event(Utc::now());
        assert_eq!(bus.publish(event), 0);
    }
}
