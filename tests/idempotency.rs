mod common;

use axum::{Router, body::Body, http::Request, http::StatusCode};
use chrono::Duration;
use common::{CLIENT_KEY, TestApp, post_json, send};
use payment_lifecycle_engine::{
    models::idempotency::IdempotencyClaim,
    models::order::Order,
    providers::{ProviderError, ProviderErrorCode},
};
use serde_json::{Value, json};
use tower::ServiceExt;

fn start_body(order: &Order, provider: &str) -> Value {
    json!({ "order_id": order.id, "provider": provider, "actor_id": order.actor_id })
}

async fn send_with_headers(router: &Router, request: Request<Body>) -> (StatusCode, Option<String>, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let replayed = response
        .headers()
        .get("Idempotent-Replayed")
        .map(|v| v.to_str().unwrap().to_string());
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, replayed, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn repeated_command_replays_the_stored_response() {
    let app = TestApp::new().await;
    let order = app.create_order(1000).await;
    let router = app.router();
    let body = start_body(&order, "card");

    let (status, replayed, first) =
        send_with_headers(&router, post_json("/api/v1/payments", CLIENT_KEY, Some("start-1"), body.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(replayed, None);

    let (status, replayed, second) =
        send_with_headers(&router, post_json("/api/v1/payments", CLIENT_KEY, Some("start-1"), body)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(replayed.as_deref(), Some("true"));
    assert_eq!(second, first);
    assert_eq!(app.card.intent_calls(), 1);
}

#[tokio::test]
async fn reusing_a_key_with_another_body_is_refused() {
    let app = TestApp::new().await;
    let order = app.create_order(1000).await;
    let other = app.create_order(2000).await;
    let router = app.router();

    let (status, _) = send(
        &router,
        post_json("/api/v1/payments", CLIENT_KEY, Some("start-2"), start_body(&order, "card")),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, error) = send(
        &router,
        post_json("/api/v1/payments", CLIENT_KEY, Some("start-2"), start_body(&other, "card")),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(error["error"]["code"], "IDEMPOTENCY_KEY_REUSED");
    assert_eq!(app.card.intent_calls(), 1);
}

#[tokio::test]
async fn money_moving_commands_require_a_key() {
    let app = TestApp::new().await;
    let order = app.create_order(1000).await;

    let (status, error) = send(
        &app.router(),
        post_json("/api/v1/payments", CLIENT_KEY, None, start_body(&order, "card")),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error["error"]["code"], "MISSING_IDEMPOTENCY_KEY");
    assert_eq!(app.card.intent_calls(), 0);
}

#[tokio::test]
async fn keys_are_scoped_per_route() {
    let app = TestApp::new().await;
    let order = app.create_order(1000).await;
    let cash_order = app.create_order(500).await;
    let router = app.router();

    let (status, _) = send(
        &router,
        post_json("/api/v1/payments", CLIENT_KEY, Some("shared"), start_body(&order, "card")),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, cashier) = send(
        &router,
        post_json(
            "/api/v1/payments/cashier",
            CLIENT_KEY,
            Some("shared"),
            json!({ "order_id": cash_order.id, "actor_id": cash_order.actor_id }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(cashier["flow"], "CASHIER");
}

#[tokio::test]
async fn client_errors_are_stored_but_server_errors_release_the_key() {
    let app = TestApp::new().await;
    let order = app.create_order(1000).await;
    let router = app.router();

    let (status, replayed, _) = send_with_headers(
        &router,
        post_json("/api/v1/payments", CLIENT_KEY, Some("bad-provider"), start_body(&order, "barter")),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(replayed, None);
    let (status, replayed, error) = send_with_headers(
        &router,
        post_json("/api/v1/payments", CLIENT_KEY, Some("bad-provider"), start_body(&order, "barter")),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(replayed.as_deref(), Some("true"));
    assert_eq!(error["error"]["code"], "UNSUPPORTED_PROVIDER");

    app.card
        .fail_next_intent(ProviderError::new(ProviderErrorCode::ProviderTimeout, "gateway timeout"));
    let (status, error) = send(
        &router,
        post_json("/api/v1/payments", CLIENT_KEY, Some("flaky"), start_body(&order, "card")),
    )
    .await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(error["error"]["code"], "PROVIDER_TIMEOUT");

    let (status, replayed, created) = send_with_headers(
        &router,
        post_json("/api/v1/payments", CLIENT_KEY, Some("flaky"), start_body(&order, "card")),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(replayed, None);
    assert_eq!(created["status"], "PENDING");
    assert_eq!(app.card.intent_calls(), 2);
}

#[tokio::test]
async fn concurrent_claim_is_in_progress_until_completed() {
    let app = TestApp::new().await;
    let service = &app.state.idempotency;
    let route = "POST /api/v1/payments";

    let first = service.claim(app.tenant_id, "k-1", route, b"{}").await.unwrap();
    assert!(matches!(first, IdempotencyClaim::Claimed));
    let second = service.claim(app.tenant_id, "k-1", route, b"{}").await.unwrap();
    assert!(matches!(second, IdempotencyClaim::InProgress));

    service
        .complete(app.tenant_id, "k-1", route, 201, "{}".into(), None)
        .await
        .unwrap();
    let third = service.claim(app.tenant_id, "k-1", route, b"{}").await.unwrap();
    assert!(matches!(third, IdempotencyClaim::Completed(_)));

    let err = service.claim(app.tenant_id, " ", route, b"{}").await.unwrap_err();
    assert_eq!(err.code(), "INVALID_REQUEST");
}

#[tokio::test]
async fn abandoned_claim_is_taken_over_after_its_lease() {
    let app = TestApp::new().await;
    let service = &app.state.idempotency;
    let route = "POST /api/v1/payments";

    let first = service.claim(app.tenant_id, "k-3", route, b"{}").await.unwrap();
    assert!(matches!(first, IdempotencyClaim::Claimed));

    app.advance(Duration::seconds(30));
    let blocked = service.claim(app.tenant_id, "k-3", route, b"{}").await.unwrap();
    assert!(matches!(blocked, IdempotencyClaim::InProgress));

    app.advance(Duration::seconds(31));
    let taken_over = service.claim(app.tenant_id, "k-3", route, b"{}").await.unwrap();
    assert!(matches!(taken_over, IdempotencyClaim::Claimed));

    // A completed response outlives the lease
    service
        .complete(app.tenant_id, "k-3", route, 201, "{}".into(), None)
        .await
        .unwrap();
    app.advance(Duration::hours(6));
    let replay = service.claim(app.tenant_id, "k-3", route, b"{}").await.unwrap();
    assert!(matches!(replay, IdempotencyClaim::Completed(_)));
}

#[tokio::test]
async fn abandoned_request_does_not_block_a_retry_over_http() {
    let app = TestApp::new().await;
    let order = app.create_order(1000).await;
    let body = start_body(&order, "card");
    let route = "POST /api/v1/payments";

    // A claim whose request never finished
    app.state
        .idempotency
        .claim(app.tenant_id, "dropped", route, body.to_string().as_bytes())
        .await
        .unwrap();
    let router = app.router();
    let (status, error) = send(&router, post_json("/api/v1/payments", CLIENT_KEY, Some("dropped"), body.clone())).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error["error"]["code"], "IDEMPOTENCY_KEY_IN_USE");

    app.advance(Duration::minutes(2));
    let (status, created) = send(&router, post_json("/api/v1/payments", CLIENT_KEY, Some("dropped"), body)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["status"], "PENDING");
}

#[tokio::test]
async fn expired_keys_are_purged_and_reusable() {
    let app = TestApp::new().await;
    let service = &app.state.idempotency;
    let route = "POST /api/v1/payments";

    service.claim(app.tenant_id, "k-2", route, b"{\"a\":1}").await.unwrap();
    service
        .complete(app.tenant_id, "k-2", route, 201, "{}".into(), None)
        .await
        .unwrap();

    app.advance(Duration::hours(25));
    app.state.scheduler.run_named("idempotency_purge").await.unwrap();

    let reclaimed = service.claim(app.tenant_id, "k-2", route, b"{\"a\":2}").await.unwrap();
    assert!(matches!(reclaimed, IdempotencyClaim::Claimed));
    assert_eq!(service.purge_expired().await.unwrap(), 0);
}
