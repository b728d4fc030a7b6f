//! Scheduled background jobs.
//!
//! Every job runs on its own interval in its own task. A single run is spawned as a
//! child task, so an error or a panic is recorded against that job's heartbeat and the
//! loop keeps going. Three consecutive failures raise a `JOB_FAILING` alert.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::error::AppError;
use crate::models::events::{AlertKind, AlertSeverity, NewDomainEvent};
use crate::models::job::{JobHeartbeat, JobRun};
use crate::store::Store;

pub mod dead_letter_retry;
pub mod idempotency_purge;
pub mod outbox_relay;
pub mod payment_reconciliation;
pub mod payment_timeout;
pub mod risk_decay;
pub mod settlement;

pub use dead_letter_retry::DeadLetterRetryJob;
pub use idempotency_purge::IdempotencyPurgeJob;
pub use outbox_relay::OutboxRelayJob;
pub use payment_reconciliation::PaymentReconciliationJob;
pub use payment_timeout::PaymentTimeoutJob;
pub use risk_decay::RiskDecayJob;
pub use settlement::SettlementJob;

/// Consecutive failures that raise a `JOB_FAILING` alert.
pub const FAILURE_ALERT_THRESHOLD: i32 = 3;

/// Rows a job handles per run.
pub const BATCH_SIZE: i64 = 100;

#[async_trait::async_trait]
pub trait Job: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn interval(&self) -> Duration;

    async fn run(&self) -> Result<(), AppError>;
}

#[derive(Clone)]
pub struct Scheduler {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    jobs: Vec<Arc<dyn Job>>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            jobs: Vec::new(),
        }
    }

    pub fn register(mut self, job: impl Job) -> Self {
        self.jobs.push(Arc::new(job));
        self
    }

    pub fn job_names(&self) -> Vec<&'static str> {
        self.jobs.iter().map(|job| job.name()).collect()
    }

    /// Run the named job once, outside its schedule.
    pub async fn run_named(&self, name: &str) -> Result<JobHeartbeat, AppError> {
        let job = self
            .jobs
            .iter()
            .find(|job| job.name() == name)
            .cloned()
            .ok_or_else(|| AppError::InvalidRequest(format!("unknown job {name}")))?;
        self.run_once(job).await
    }

    /// Execute one run and fold it into the job's heartbeat.
    ///
    /// # Process
    ///
    /// 1. Spawn the run as a child task and wait for it
    /// 2. Record the outcome, a panic counting as a failure
    /// 3. Raise `JOB_FAILING` when the failure streak reaches the threshold
    pub async fn run_once(&self, job: Arc<dyn Job>) -> Result<JobHeartbeat, AppError> {
        let name = job.name();
        let started_at = self.clock.now();
        let started = Instant::now();

        let outcome = tokio::spawn(async move { job.run().await }).await;
        let error = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err.to_string()),
            Err(join_err) => Some(format!("job task aborted: {join_err}")),
        };

        if let Some(err) = &error {
            tracing::warn!(job = name, error = %err, "job run failed");
        } else {
            tracing::debug!(job = name, "job run finished");
        }

        let heartbeat = self
            .store
            .record_job_run(JobRun {
                job_name: name.to_string(),
                started_at,
                duration_ms: i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX),
                error,
            })
            .await?;

        if heartbeat.consecutive_failures == FAILURE_ALERT_THRESHOLD {
            tracing::error!(job = name, failures = heartbeat.consecutive_failures, "job failing");
            self.store
                .append_domain_events(
                    vec![NewDomainEvent::alert(
                        AlertSeverity::Critical,
                        AlertKind::JobFailing,
                        format!("{name} failed {} times in a row", heartbeat.consecutive_failures),
                        json!({
                            "job": name,
                            "last_error": heartbeat.last_error,
                        }),
                    )],
                    self.clock.now(),
                )
                .await?;
        }
        Ok(heartbeat)
    }

    /// Start one loop per job. Loops stop when `shutdown` flips to `true`.
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        self.jobs
            .iter()
            .cloned()
            .map(|job| {
                let scheduler = self.clone();
                let mut shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(job.interval());
                    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                    tracing::info!(job = job.name(), interval_secs = job.interval().as_secs(), "job scheduled");
                    loop {
                        tokio::select! {
                            _ = ticker.tick() => {
                                if let Err(err) = scheduler.run_once(job.clone()).await {
                                    tracing::error!(job = job.name(), error = %err, "failed to record job run");
                                }
                            }
                            _ = shutdown.changed() => {
                                if *shutdown.borrow() {
                                    tracing::info!(job = job.name(), "job stopped");
                                    break;
                                }
                            }
                        }
                    }
                })
            })
            .collect()
    }

    pub async fn heartbeats(&self) -> Result<Vec<JobHeartbeat>, AppError> {
        self.store.list_job_heartbeats().await
    }
}
