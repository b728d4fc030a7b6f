//! Execution heartbeat of scheduled jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize, Deserialize)]
pub struct JobHeartbeat {
    pub job_name: String,
    pub last_run_at: DateTime<Utc>,
    pub last_duration_ms: i64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub consecutive_failures: i32,
    pub total_runs: i64,
    pub last_error: Option<String>,
}

/// One finished run, folded into the job's heartbeat.
#[derive(Debug, Clone)]
pub struct JobRun {
    pub job_name: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub error: Option<String>,
}

impl JobHeartbeat {
    pub fn first(run: &JobRun) -> Self {
        Self {
            job_name: run.job_name.clone(),
            last_run_at: run.started_at,
            last_duration_ms: run.duration_ms,
            last_success_at: run.error.is_none().then_some(run.started_at),
            consecutive_failures: i32::from(run.error.is_some()),
            total_runs: 1,
            last_error: run.error.clone(),
        }
    }

    pub fn fold(&mut self, run: &JobRun) {
        self.last_run_at = run.started_at;
        self.last_duration_ms = run.duration_ms;
        self.total_runs += 1;
        match &run.error {
            Some(err) => {
                self.consecutive_failures += 1;
                self.last_error = Some(err.clone());
            }
            None => {
                self.consecutive_failures = 0;
                self.last_success_at = Some(run.started_at);
                self.last_error = None;
            }
        }
    }
}
