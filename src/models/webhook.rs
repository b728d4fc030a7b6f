//! Webhook models for inbound provider events.
//!
//! # Webhook Flow
//!
//! 1. A provider POSTs an event to `/webhooks/{provider}` with a signature header
//! 2. The signature is verified over the raw body
//! 3. The event is recorded once per `(provider, event_uuid)` before any dispatch
//! 4. Dispatch failures land in the dead-letter queue and are retried by a job
//!
//! Event rows are append-only; the only later write is the `processed_at` stamp.
//! Replays never touch history, they append `WebhookReplay` rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Durable record of a verified inbound provider event.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: Uuid,
    pub provider: String,
    pub event_uuid: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewWebhookEvent {
    pub provider: String,
    pub event_uuid: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

text_enum! {
    pub enum DeadLetterStatus {
        Failed => "FAILED",
        Abandoned => "ABANDONED",
        Resolved => "RESOLVED",
    }
}

/// A webhook whose dispatch failed after it was durably recorded.
///
/// One row per event; repeated failures increment `attempt_count`.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct WebhookDeadLetter {
    pub id: Uuid,
    pub webhook_event_id: Uuid,
    pub provider: String,
    pub event_type: String,
    pub attempt_count: i32,
    pub status: DeadLetterStatus,
    pub error_message: String,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Failure to record against an event's dead letter.
#[derive(Debug, Clone)]
pub struct DeadLetterFailure {
    pub webhook_event_id: Uuid,
    pub provider: String,
    pub event_type: String,
    pub error_message: String,
    /// `Abandoned` for failures that redelivery cannot fix.
    pub status: DeadLetterStatus,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub at: DateTime<Utc>,
}

/// Analysis record written for every replay of a stored event.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct WebhookReplay {
    pub id: Uuid,
    pub webhook_event_id: Uuid,
    pub requested_by: String,
    pub outcome: String,
    pub error_message: Option<String>,
    pub replayed_at: DateTime<Utc>,
}

/// Body of the inbound webhook response.
///
/// Always sent with HTTP 200 once the event is durably recorded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebhookAck {
    pub status: WebhookAckStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WebhookAckStatus {
    Processed,
    Duplicate,
    Ignored,
    Queued,
    Rejected,
}

/// Admin request to replay every stored event received in a time range.
#[derive(Debug, Deserialize)]
pub struct ReplayRangeRequest {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub provider: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DeadLetterQuery {
    pub status: Option<DeadLetterStatus>,
}
