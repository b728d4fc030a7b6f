#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode},
};
use chrono::{DateTime, Duration, Utc};
use payment_lifecycle_engine::{
    AppState, build_router,
    clock::ManualClock,
    config::{JobIntervals, PaymentSettings, RetryPolicy},
    middleware::auth::hash_api_key,
    models::{
        api_key::ApiKey,
        events::{AlertKind, EventKind},
        order::{Order, OrderStatus, StoreLocation},
        payment::{Payment, StartPaymentRequest},
    },
    providers::{CanonicalStatus, ProviderRegistry, mock::MockProvider},
    store::memory::InMemoryStore,
};
use serde_json::{Value, json};
use tower::ServiceExt;
use uuid::Uuid;

pub const CLIENT_KEY: &str = "test-client-key";
pub const ADMIN_KEY: &str = "test-admin-key";
pub const CARD_SECRET: &str = "whsec_card_test";

pub fn start_time() -> DateTime<Utc> {
    "2026-10-19T10:00:00Z".parse().unwrap()
}

pub struct TestApp {
    pub state: AppState,
    pub store: Arc<InMemoryStore>,
    pub clock: Arc<ManualClock>,
    pub card: Arc<MockProvider>,
    pub wallet: Arc<MockProvider>,
    pub tenant_id: Uuid,
    pub store_id: Uuid,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_settings(PaymentSettings::default()).await
    }

    pub async fn with_settings(settings: PaymentSettings) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(start_time()));
        let card = Arc::new(MockProvider::new("card", CARD_SECRET));
        let wallet = Arc::new(MockProvider::new("wallet", "whsec_wallet_test"));

        let providers = ProviderRegistry::new()
            .register(card.clone())
            .register(wallet.clone());

        let state = AppState::new(
            store.clone(),
            providers,
            clock.clone(),
            settings,
            RetryPolicy {
                max_attempts: 1,
                base_backoff_ms: 0,
            },
            JobIntervals::default(),
        );

        let tenant_id = Uuid::new_v4();
        let store_id = Uuid::new_v4();
        store
            .insert_store(StoreLocation {
                id: store_id,
                tenant_id,
                name: "Main Street".into(),
                is_online: true,
            })
            .await;
        for (raw, name, is_admin) in [(CLIENT_KEY, "pos-terminal", false), (ADMIN_KEY, "ops-admin", true)] {
            store
                .insert_api_key(ApiKey {
                    id: Uuid::new_v4(),
                    tenant_id,
                    key_hash: hash_api_key(raw),
                    key_name: name.into(),
                    is_admin,
                    created_at: start_time(),
                    is_active: true,
                })
                .await;
        }

        Self {
            state,
            store,
            clock,
            card,
            wallet,
            tenant_id,
            store_id,
        }
    }

    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }

    /// A payable order for a fresh actor.
    pub async fn create_order(&self, amount: i64) -> Order {
        self.create_order_for(Uuid::new_v4(), amount).await
    }

    pub async fn create_order_for(&self, actor_id: Uuid, amount: i64) -> Order {
        let order = Order {
            id: Uuid::new_v4(),
            tenant_id: self.tenant_id,
            store_id: self.store_id,
            actor_id,
            total_amount: amount,
            currency: "USD".into(),
            status: OrderStatus::PendingPayment,
            pricing: json!({ "lines": [{ "sku": "SKU-1", "qty": 1, "unit": amount }] }),
            updated_at: start_time(),
        };
        self.store.insert_order(order.clone()).await;
        order
    }

    pub async fn start_payment(&self, order: &Order, provider: &str) -> Payment {
        let (payment, created) = self
            .state
            .payments
            .start_payment(
                self.tenant_id,
                StartPaymentRequest {
                    order_id: order.id,
                    provider: provider.into(),
                    actor_id: order.actor_id,
                },
            )
            .await
            .expect("payment should start");
        assert!(created);
        payment
    }

    /// A `PAID` card payment for a new order.
    pub async fn paid_payment(&self, amount: i64) -> Payment {
        let order = self.create_order(amount).await;
        let payment = self.start_payment(&order, "card").await;
        let provider_ref = payment.provider_ref.clone().unwrap();
        self.card.set_lookup(&provider_ref, CanonicalStatus::Paid, None);
        self.state
            .payments
            .confirm_payment(self.tenant_id, payment.id, "test")
            .await
            .expect("payment should confirm")
    }

    pub async fn order_status(&self, order_id: Uuid) -> OrderStatus {
        self.store.order(order_id).await.unwrap().status
    }

    pub async fn count_events(&self, kind: EventKind) -> usize {
        self.store
            .domain_events()
            .await
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }

    pub async fn count_events_for(&self, kind: EventKind, aggregate_id: Uuid) -> usize {
        self.store
            .domain_events()
            .await
            .iter()
            .filter(|e| e.kind == kind && e.aggregate_id == Some(aggregate_id))
            .count()
    }

    pub async fn count_alerts(&self, alert: AlertKind) -> usize {
        self.store
            .domain_events()
            .await
            .iter()
            .filter(|e| e.kind == EventKind::AlertRaised && e.payload["alert"] == alert.as_str())
            .count()
    }
}

pub fn webhook_body(event_id: &str, event_type: &str, provider_ref: &str, amount: i64, currency: &str) -> Vec<u8> {
    json!({
        "id": event_id,
        "type": event_type,
        "provider_ref": provider_ref,
        "amount": amount,
        "currency": currency,
    })
    .to_string()
    .into_bytes()
}

pub async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

pub fn post_json(uri: &str, key: &str, idempotency_key: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("Authorization", format!("Bearer {key}"))
        .header("Content-Type", "application/json");
    if let Some(idempotency_key) = idempotency_key {
        builder = builder.header("Idempotency-Key", idempotency_key);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

pub fn get(uri: &str, key: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .header("Authorization", format!("Bearer {key}"))
        .body(Body::empty())
        .unwrap()
}

pub fn webhook_request(provider: &str, header: &str, signature: &str, body: Vec<u8>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(format!("/webhooks/{provider}"))
        .header(header, signature)
        .header("Content-Type", "application/json")
        .body(Body::from(body))
        .unwrap()
}
