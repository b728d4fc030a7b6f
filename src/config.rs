//! Application configuration management.
//!
//! This module handles loading configuration from environment variables.
//! It uses the `envy` crate to deserialize environment variables into a type-safe struct;
//! every business knob has a default so a bare `DATABASE_URL` is enough to boot.

use chrono::Duration;
use serde::Deserialize;

/// Which storage backend the server runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Postgres,
    Memory,
}

/// Application configuration loaded from environment variables.
///
/// # Environment Variables
///
/// - `DATABASE_URL`: PostgreSQL connection string (required for the postgres backend)
/// - `SERVER_PORT`: HTTP server port, defaults to 3000
/// - `STORAGE_BACKEND`: `postgres` (default) or `memory`
/// - `MOCK_PROVIDERS`: register scriptable mock adapters instead of real ones
/// - `CARD_*`, `MOBILE_MONEY_*`, `WALLET_*`: provider endpoints and secrets
/// - the remaining variables tune deadlines, retry budgets and job intervals
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database_url: String,

    #[serde(default = "default_port")]
    pub server_port: u16,

    #[serde(default = "default_backend")]
    pub storage_backend: StorageBackend,

    #[serde(default)]
    pub mock_providers: bool,

    #[serde(default = "default_card_base_url")]
    pub card_base_url: String,
    #[serde(default)]
    pub card_api_key: String,
    #[serde(default)]
    pub card_webhook_secret: String,

    #[serde(default = "default_mobile_money_base_url")]
    pub mobile_money_base_url: String,
    #[serde(default)]
    pub mobile_money_api_key: String,
    #[serde(default)]
    pub mobile_money_webhook_secret: String,

    #[serde(default)]
    pub wallet_webhook_secret: String,

    #[serde(default = "default_provider_timeout_ms")]
    pub provider_timeout_ms: u64,
    #[serde(default = "default_provider_max_attempts")]
    pub provider_max_attempts: u32,
    #[serde(default = "default_provider_backoff_ms")]
    pub provider_backoff_ms: u64,

    #[serde(default = "default_intent_ttl_minutes")]
    pub intent_ttl_minutes: i64,
    #[serde(default = "default_retry_cooldown_minutes")]
    pub retry_cooldown_minutes: i64,
    #[serde(default = "default_max_retries")]
    pub default_max_retries: i32,
    #[serde(default = "default_stale_payment_minutes")]
    pub stale_payment_minutes: i64,
    #[serde(default = "default_confirm_lock_seconds")]
    pub confirm_lock_seconds: i64,
    #[serde(default = "default_idempotency_ttl_hours")]
    pub idempotency_ttl_hours: i64,
    #[serde(default = "default_idempotency_lock_seconds")]
    pub idempotency_lock_seconds: i64,
    #[serde(default = "default_dead_letter_max_attempts")]
    pub dead_letter_max_attempts: i32,
    #[serde(default = "default_settlement_tolerance_minor")]
    pub settlement_tolerance_minor: i64,
    #[serde(default = "default_risk_decay_amount")]
    pub risk_decay_amount: i32,
    #[serde(default = "default_webhook_tolerance_seconds")]
    pub webhook_tolerance_seconds: i64,

    #[serde(default = "default_fast_job_interval_seconds")]
    pub reconciliation_interval_seconds: u64,
    #[serde(default = "default_fast_job_interval_seconds")]
    pub timeout_job_interval_seconds: u64,
    #[serde(default = "default_fast_job_interval_seconds")]
    pub dead_letter_interval_seconds: u64,
    #[serde(default = "default_outbox_interval_seconds")]
    pub outbox_interval_seconds: u64,
    #[serde(default = "default_hourly_interval_seconds")]
    pub idempotency_purge_interval_seconds: u64,
    #[serde(default = "default_daily_interval_seconds")]
    pub risk_decay_interval_seconds: u64,
    #[serde(default = "default_daily_interval_seconds")]
    pub settlement_interval_seconds: u64,
}

/// Business rules the services operate on, projected out of [`Config`].
#[derive(Debug, Clone)]
pub struct PaymentSettings {
    pub intent_ttl: Duration,
    pub retry_cooldown: Duration,
    pub default_max_retries: i32,
    pub stale_after: Duration,
    pub confirm_lock_ttl: Duration,
    pub idempotency_ttl: Duration,
    /// Lease of an unfinished claim; a later request takes over a lapsed one.
    pub idempotency_lock_ttl: Duration,
    pub dead_letter_max_attempts: i32,
    pub settlement_tolerance_minor: i64,
    pub risk_decay_amount: i32,
}

impl Default for PaymentSettings {
    fn default() -> Self {
        Self {
            intent_ttl: Duration::minutes(default_intent_ttl_minutes()),
            retry_cooldown: Duration::minutes(default_retry_cooldown_minutes()),
            default_max_retries: default_max_retries(),
            stale_after: Duration::minutes(default_stale_payment_minutes()),
            confirm_lock_ttl: Duration::seconds(default_confirm_lock_seconds()),
            idempotency_ttl: Duration::hours(default_idempotency_ttl_hours()),
            idempotency_lock_ttl: Duration::seconds(default_idempotency_lock_seconds()),
            dead_letter_max_attempts: default_dead_letter_max_attempts(),
            settlement_tolerance_minor: default_settlement_tolerance_minor(),
            risk_decay_amount: default_risk_decay_amount(),
        }
    }
}

/// How often each scheduled job runs.
#[derive(Debug, Clone, Copy)]
pub struct JobIntervals {
    pub reconciliation: std::time::Duration,
    pub timeout: std::time::Duration,
    pub dead_letter: std::time::Duration,
    pub outbox: std::time::Duration,
    pub idempotency_purge: std::time::Duration,
    pub risk_decay: std::time::Duration,
    pub settlement: std::time::Duration,
}

impl Default for JobIntervals {
    fn default() -> Self {
        let secs = std::time::Duration::from_secs;
        Self {
            reconciliation: secs(default_fast_job_interval_seconds()),
            timeout: secs(default_fast_job_interval_seconds()),
            dead_letter: secs(default_fast_job_interval_seconds()),
            outbox: secs(default_outbox_interval_seconds()),
            idempotency_purge: secs(default_hourly_interval_seconds()),
            risk_decay: secs(default_daily_interval_seconds()),
            settlement: secs(default_daily_interval_seconds()),
        }
    }
}

/// Retry budget for transient provider failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_provider_max_attempts(),
            base_backoff_ms: default_provider_backoff_ms(),
        }
    }
}

fn default_port() -> u16 {
    3000
}

fn default_backend() -> StorageBackend {
    StorageBackend::Postgres
}

fn default_card_base_url() -> String {
    "https://api.card-gateway.example".to_string()
}

fn default_mobile_money_base_url() -> String {
    "https://api.mobile-money.example".to_string()
}

fn default_provider_timeout_ms() -> u64 {
    10_000
}

fn default_provider_max_attempts() -> u32 {
    3
}

fn default_provider_backoff_ms() -> u64 {
    250
}

fn default_intent_ttl_minutes() -> i64 {
    15
}

fn default_retry_cooldown_minutes() -> i64 {
    5
}

fn default_max_retries() -> i32 {
    3
}

fn default_stale_payment_minutes() -> i64 {
    5
}

fn default_confirm_lock_seconds() -> i64 {
    60
}

fn default_idempotency_ttl_hours() -> i64 {
    24
}

fn default_idempotency_lock_seconds() -> i64 {
    60
}

fn default_dead_letter_max_attempts() -> i32 {
    5
}

fn default_settlement_tolerance_minor() -> i64 {
    100
}

fn default_risk_decay_amount() -> i32 {
    5
}

fn default_webhook_tolerance_seconds() -> i64 {
    300
}

fn default_fast_job_interval_seconds() -> u64 {
    60
}

fn default_outbox_interval_seconds() -> u64 {
    5
}

fn default_hourly_interval_seconds() -> u64 {
    3_600
}

fn default_daily_interval_seconds() -> u64 {
    86_400
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// This method first attempts to load a `.env` file (which is optional),
    /// then reads environment variables and deserializes them into a Config struct.
    ///
    /// # Errors
    ///
    /// Returns an error if environment variable values cannot be parsed into expected types.
    pub fn from_env() -> Result<Self, envy::Error> {
        // Try to load .env file if it exists (does nothing if not found)
        dotenvy::dotenv().ok();

        // Field names are automatically converted: database_url -> DATABASE_URL
        envy::from_env::<Config>()
    }

    pub fn payment_settings(&self) -> PaymentSettings {
        PaymentSettings {
            intent_ttl: Duration::minutes(self.intent_ttl_minutes),
            retry_cooldown: Duration::minutes(self.retry_cooldown_minutes),
            default_max_retries: self.default_max_retries,
            stale_after: Duration::minutes(self.stale_payment_minutes),
            confirm_lock_ttl: Duration::seconds(self.confirm_lock_seconds),
            idempotency_ttl: Duration::hours(self.idempotency_ttl_hours),
            idempotency_lock_ttl: Duration::seconds(self.idempotency_lock_seconds),
            dead_letter_max_attempts: self.dead_letter_max_attempts,
            settlement_tolerance_minor: self.settlement_tolerance_minor,
            risk_decay_amount: self.risk_decay_amount,
        }
    }

    pub fn job_intervals(&self) -> JobIntervals {
        // A zero period would make tokio's interval panic
        let secs = |value: u64| std::time::Duration::from_secs(value.max(1));
        JobIntervals {
            reconciliation: secs(self.reconciliation_interval_seconds),
            timeout: secs(self.timeout_job_interval_seconds),
            dead_letter: secs(self.dead_letter_interval_seconds),
            outbox: secs(self.outbox_interval_seconds),
            idempotency_purge: secs(self.idempotency_purge_interval_seconds),
            risk_decay: secs(self.risk_decay_interval_seconds),
            settlement: secs(self.settlement_interval_seconds),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.provider_max_attempts.max(1),
            base_backoff_ms: self.provider_backoff_ms,
        }
    }
}
