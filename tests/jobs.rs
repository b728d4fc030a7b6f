mod common;

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use std::time::Duration;

use axum::http::StatusCode;
use common::{ADMIN_KEY, TestApp, get, post_json, send};
use payment_lifecycle_engine::{
    clock::Clock,
    error::AppError,
    jobs::{Job, Scheduler},
    models::events::{AlertKind, EventKind},
    store::Store,
};
use serde_json::json;
use tokio::sync::watch;

struct ScriptedJob {
    name: &'static str,
    fail: bool,
    runs: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl Job for ScriptedJob {
    fn name(&self) -> &'static str {
        self.name
    }

    fn interval(&self) -> Duration {
        Duration::from_millis(10)
    }

    async fn run(&self) -> Result<(), AppError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(AppError::Internal("downstream unavailable".into()));
        }
        Ok(())
    }
}

struct PanickingJob;

#[async_trait::async_trait]
impl Job for PanickingJob {
    fn name(&self) -> &'static str {
        "panicking"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(60)
    }

    async fn run(&self) -> Result<(), AppError> {
        panic!("job bug");
    }
}

fn scheduler(app: &TestApp) -> Scheduler {
    let store: Arc<dyn Store> = app.store.clone();
    let clock: Arc<dyn Clock> = app.clock.clone();
    Scheduler::new(store, clock)
}

#[tokio::test]
async fn third_consecutive_failure_raises_one_alert() {
    let app = TestApp::new().await;
    let runs = Arc::new(AtomicUsize::new(0));
    let scheduler = scheduler(&app).register(ScriptedJob {
        name: "flaky",
        fail: true,
        runs: runs.clone(),
    });

    for expected in 1..=4 {
        let heartbeat = scheduler.run_named("flaky").await.unwrap();
        assert_eq!(heartbeat.consecutive_failures, expected);
        assert_eq!(heartbeat.last_success_at, None);
    }

    assert_eq!(runs.load(Ordering::SeqCst), 4);
    assert_eq!(app.count_alerts(AlertKind::JobFailing).await, 1);
    let heartbeats = scheduler.heartbeats().await.unwrap();
    assert_eq!(heartbeats.len(), 1);
    assert_eq!(heartbeats[0].total_runs, 4);
    assert!(heartbeats[0].last_error.as_deref().unwrap().contains("downstream unavailable"));
}

#[tokio::test]
async fn panicking_job_is_recorded_as_a_failure() {
    let app = TestApp::new().await;
    let scheduler = scheduler(&app).register(PanickingJob);

    let heartbeat = scheduler.run_named("panicking").await.unwrap();

    assert_eq!(heartbeat.consecutive_failures, 1);
    assert!(heartbeat.last_error.is_some());
}

#[tokio::test]
async fn unknown_job_name_is_refused() {
    let app = TestApp::new().await;

    let err = app.state.scheduler.run_named("nope").await.unwrap_err();

    assert_eq!(err.code(), "INVALID_REQUEST");
}

#[tokio::test]
async fn spawned_loops_run_until_shutdown() {
    let app = TestApp::new().await;
    let runs = Arc::new(AtomicUsize::new(0));
    let scheduler = scheduler(&app).register(ScriptedJob {
        name: "ticker",
        fail: false,
        runs: runs.clone(),
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = scheduler.spawn(shutdown_rx);
    tokio::time::sleep(Duration::from_millis(60)).await;
    shutdown_tx.send(true).unwrap();
    for handle in handles {
        handle.await.unwrap();
    }

    let after_shutdown = runs.load(Ordering::SeqCst);
    assert!(after_shutdown >= 1);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(runs.load(Ordering::SeqCst), after_shutdown);

    let heartbeats = scheduler.heartbeats().await.unwrap();
    assert_eq!(heartbeats[0].consecutive_failures, 0);
    assert!(heartbeats[0].last_success_at.is_some());
}

#[tokio::test]
async fn outbox_relay_publishes_each_event_once() {
    let app = TestApp::new().await;
    let mut subscriber = app.state.events.subscribe();
    let payment = app.paid_payment(1000).await;

    app.state.scheduler.run_named("outbox_relay").await.unwrap();

    let mut kinds = Vec::new();
    while let Ok(event) = subscriber.try_recv() {
        if event.aggregate_id == Some(payment.id) {
            kinds.push(event.kind);
        }
    }
    assert_eq!(kinds, [EventKind::PaymentIntentCreated, EventKind::PaymentConfirmed]);
    assert!(app.store.domain_events().await.iter().all(|e| e.published_at.is_some()));

    app.state.scheduler.run_named("outbox_relay").await.unwrap();
    assert!(subscriber.try_recv().is_err());
}

#[tokio::test]
async fn jobs_over_http() {
    let app = TestApp::new().await;
    let router = app.router();

    let (status, heartbeat) = send(
        &router,
        post_json("/api/v1/admin/jobs/payment_timeout/run", ADMIN_KEY, None, json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(heartbeat["job_name"], "payment_timeout");
    assert_eq!(heartbeat["consecutive_failures"], 0);

    let (status, heartbeats) = send(&router, get("/api/v1/admin/jobs", ADMIN_KEY)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(heartbeats.as_array().unwrap().len(), 1);
}
