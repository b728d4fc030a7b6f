//! Webhook event log, dead-letter queue and replay records.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{PgStore, insert_events};
use crate::error::AppError;
use crate::models::events::NewDomainEvent;
use crate::models::webhook::{
    DeadLetterFailure, DeadLetterStatus, NewWebhookEvent, WebhookDeadLetter, WebhookEvent,
    WebhookReplay,
};
use crate::store::WebhookRepository;

#[async_trait::async_trait]
impl WebhookRepository for PgStore {
    async fn find_webhook_event(
        &self,
        provider: &str,
        event_uuid: &str,
    ) -> Result<Option<WebhookEvent>, AppError> {
        let event = sqlx::query_as::<_, WebhookEvent>(
            "SELECT * FROM webhook_events WHERE provider = $1 AND event_uuid = $2",
        )
        .bind(provider)
        .bind(event_uuid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(event)
    }

    /// The unique `(provider, event_uuid)` constraint decides concurrent duplicates:
    /// exactly one insert returns a row, the others get `None`.
    async fn record_webhook_event(&self, event: NewWebhookEvent) -> Result<Option<WebhookEvent>, AppError> {
        let stored = sqlx::query_as::<_, WebhookEvent>(
            r#"
            INSERT INTO webhook_events (id, provider, event_uuid, event_type, payload, received_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (provider, event_uuid) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&event.provider)
        .bind(&event.event_uuid)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(event.received_at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(stored)
    }

    async fn get_webhook_event(&self, event_id: Uuid) -> Result<Option<WebhookEvent>, AppError> {
        let event = sqlx::query_as::<_, WebhookEvent>("SELECT * FROM webhook_events WHERE id = $1")
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(event)
    }

    async fn mark_webhook_processed(&self, event_id: Uuid, at: DateTime<Utc>) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE webhook_events SET processed_at = $1 WHERE id = $2 AND processed_at IS NULL",
        )
        .bind(at)
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_webhook_events_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        provider: Option<&str>,
    ) -> Result<Vec<WebhookEvent>, AppError> {
        let events = sqlx::query_as::<_, WebhookEvent>(
            r#"
            SELECT * FROM webhook_events
            WHERE received_at >= $1 AND received_at <= $2
              AND ($3::TEXT IS NULL OR provider = $3)
            ORDER BY received_at
            "#,
        )
        .bind(from)
        .bind(to)
        .bind(provider)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }

    async fn record_dead_letter_failure(
        &self,
        failure: DeadLetterFailure,
        events: Vec<NewDomainEvent>,
    ) -> Result<WebhookDeadLetter, AppError> {
        let mut tx = self.pool.begin().await?;
        let dead_letter = sqlx::query_as::<_, WebhookDeadLetter>(
            r#"
            INSERT INTO webhook_dead_letters (
                id, webhook_event_id, provider, event_type, attempt_count, status,
                error_message, next_retry_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, 1, $5, $6, $7, $8, $8)
            ON CONFLICT (webhook_event_id) DO UPDATE SET
                attempt_count = webhook_dead_letters.attempt_count + 1,
                status = EXCLUDED.status,
                error_message = EXCLUDED.error_message,
                next_retry_at = EXCLUDED.next_retry_at,
                updated_at = EXCLUDED.updated_at
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(failure.webhook_event_id)
        .bind(&failure.provider)
        .bind(&failure.event_type)
        .bind(failure.status)
        .bind(&failure.error_message)
        .bind(failure.next_retry_at)
        .bind(failure.at)
        .fetch_one(&mut *tx)
        .await?;

        insert_events(&mut tx, events, failure.at).await?;
        tx.commit().await?;
        Ok(dead_letter)
    }

    async fn get_dead_letter(&self, dead_letter_id: Uuid) -> Result<Option<WebhookDeadLetter>, AppError> {
        let dead_letter = sqlx::query_as::<_, WebhookDeadLetter>(
            "SELECT * FROM webhook_dead_letters WHERE id = $1",
        )
        .bind(dead_letter_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(dead_letter)
    }

    async fn find_dead_letter_for_event(&self, event_id: Uuid) -> Result<Option<WebhookDeadLetter>, AppError> {
        let dead_letter = sqlx::query_as::<_, WebhookDeadLetter>(
            "SELECT * FROM webhook_dead_letters WHERE webhook_event_id = $1",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(dead_letter)
    }

    async fn list_dead_letters(&self, status: Option<DeadLetterStatus>) -> Result<Vec<WebhookDeadLetter>, AppError> {
        let dead_letters = sqlx::query_as::<_, WebhookDeadLetter>(
            r#"
            SELECT * FROM webhook_dead_letters
            WHERE ($1::TEXT IS NULL OR status = $1)
            ORDER BY created_at
            "#,
        )
        .bind(status)
        .fetch_all(&self.pool)
        .await?;
        Ok(dead_letters)
    }

    async fn list_due_dead_letters(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<WebhookDeadLetter>, AppError> {
        let dead_letters = sqlx::query_as::<_, WebhookDeadLetter>(
            r#"
            SELECT * FROM webhook_dead_letters
            WHERE status = 'FAILED' AND next_retry_at <= $1
            ORDER BY next_retry_at
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(dead_letters)
    }

    async fn resolve_dead_letter(&self, dead_letter_id: Uuid, at: DateTime<Utc>) -> Result<(), AppError> {
        let updated = sqlx::query(
            r#"
            UPDATE webhook_dead_letters
            SET status = 'RESOLVED', next_retry_at = NULL, updated_at = $1
            WHERE id = $2
            "#,
        )
        .bind(at)
        .bind(dead_letter_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(AppError::DeadLetterNotFound);
        }
        Ok(())
    }

    async fn record_webhook_replay(&self, replay: WebhookReplay) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO webhook_replays (id, webhook_event_id, requested_by, outcome, error_message, replayed_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(replay.id)
        .bind(replay.webhook_event_id)
        .bind(&replay.requested_by)
        .bind(&replay.outcome)
        .bind(&replay.error_message)
        .bind(replay.replayed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_webhook_replays(&self, event_id: Uuid) -> Result<Vec<WebhookReplay>, AppError> {
        let replays = sqlx::query_as::<_, WebhookReplay>(
            "SELECT * FROM webhook_replays WHERE webhook_event_id = $1 ORDER BY replayed_at",
        )
        .bind(event_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(replays)
    }
}
